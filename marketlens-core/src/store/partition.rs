//! Partition keys and on-disk naming.
//!
//! Time-series datasets have one partition per (entity, granularity), named
//! `<entity>_<granularity>`; snapshot datasets have a single partition named
//! after the dataset. Segment files are `<partition>-<seq>.parquet`.

use serde::{Deserialize, Serialize};

use crate::domain::Granularity;

pub const SEGMENT_EXT: &str = "parquet";
pub const TMP_SUFFIX: &str = ".tmp";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PartitionKey {
    /// The single partition of a snapshot dataset.
    Whole,
    Series {
        entity: String,
        granularity: Granularity,
    },
}

impl PartitionKey {
    pub fn series(entity: impl Into<String>, granularity: Granularity) -> Self {
        PartitionKey::Series {
            entity: entity.into(),
            granularity,
        }
    }

    /// Directory-safe partition name.
    pub fn name(&self, dataset: &str) -> String {
        match self {
            PartitionKey::Whole => dataset.to_string(),
            PartitionKey::Series {
                entity,
                granularity,
            } => format!("{}_{}", encode_entity(entity), granularity.tag()),
        }
    }

    pub fn entity(&self) -> Option<&str> {
        match self {
            PartitionKey::Whole => None,
            PartitionKey::Series { entity, .. } => Some(entity),
        }
    }

    pub fn granularity(&self) -> Option<Granularity> {
        match self {
            PartitionKey::Whole => None,
            PartitionKey::Series { granularity, .. } => Some(*granularity),
        }
    }
}

/// Segment file name for a partition and sequence number.
pub fn segment_file_name(partition: &str, seq: u64) -> String {
    format!("{partition}-{seq:08}.{SEGMENT_EXT}")
}

/// Percent-encode everything outside `[A-Za-z0-9.-]`, so `_` only ever
/// separates entity from granularity and names never escape the directory.
pub fn encode_entity(entity: &str) -> String {
    let mut out = String::with_capacity(entity.len());
    for b in entity.bytes() {
        if b.is_ascii_alphanumeric() || b == b'-' || (b == b'.' && !out.is_empty()) {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

pub fn decode_entity(encoded: &str) -> Option<String> {
    let bytes = encoded.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = encoded.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

/// Dataset names become directory names.
pub fn is_valid_dataset_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 128
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_' || b == b'-')
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn partition_names() {
        assert_eq!(PartitionKey::Whole.name("markets"), "markets");
        assert_eq!(
            PartitionKey::series("TICK1", Granularity::Hour).name("candles"),
            "TICK1_1h"
        );
        assert_eq!(
            PartitionKey::series("A_B/C", Granularity::Day).name("candles"),
            "A%5FB%2FC_1d"
        );
        assert_eq!(segment_file_name("TICK1_1h", 7), "TICK1_1h-00000007.parquet");
    }

    #[test]
    fn leading_dot_is_encoded() {
        assert_eq!(encode_entity(".."), "%2E.");
    }

    #[test]
    fn dataset_names() {
        assert!(is_valid_dataset_name("candles"));
        assert!(is_valid_dataset_name("series_v2"));
        assert!(!is_valid_dataset_name("../etc"));
        assert!(!is_valid_dataset_name(""));
        assert!(!is_valid_dataset_name("Markets"));
    }

    proptest! {
        #[test]
        fn entity_encoding_roundtrips(s in "\\PC{0,24}") {
            let enc = encode_entity(&s);
            prop_assert!(!enc.contains('_') && !enc.contains('/'));
            prop_assert_eq!(decode_entity(&enc), Some(s));
        }
    }
}
