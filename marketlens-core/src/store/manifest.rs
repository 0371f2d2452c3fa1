//! Per-dataset manifest: the list of live segment files.
//!
//! Readers trust only the manifest; files it does not list are invisible.
//! It is replaced atomically (write temp, fsync, rename) on every commit
//! and compaction.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::Path;

use super::error::StoreError;
use super::partition::PartitionKey;

pub const MANIFEST_FILE: &str = "_manifest.json";
pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetKind {
    /// One partition, fully replaced on refresh.
    Snapshot,
    /// One partition per entity and granularity, ordered by time.
    TimeSeries,
}

/// One immutable segment file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub file: String,
    pub seq: u64,
    pub rows: u64,
    pub bytes: u64,
    /// BLAKE3 of the file contents, hex.
    pub checksum: String,
    pub min_order: Option<i64>,
    pub max_order: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionMeta {
    pub key: PartitionKey,
    pub segments: Vec<Segment>,
    pub last_write: DateTime<Utc>,
}

impl PartitionMeta {
    pub fn rows(&self) -> u64 {
        self.segments.iter().map(|s| s.rows).sum()
    }

    pub fn bytes(&self) -> u64 {
        self.segments.iter().map(|s| s.bytes).sum()
    }

    pub fn min_order(&self) -> Option<i64> {
        self.segments.iter().filter_map(|s| s.min_order).min()
    }

    pub fn max_order(&self) -> Option<i64> {
        self.segments.iter().filter_map(|s| s.max_order).max()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub format_version: u32,
    pub dataset: String,
    pub kind: DatasetKind,
    /// Bumped on every swap.
    pub generation: u64,
    /// Next unused segment sequence number.
    pub next_seq: u64,
    pub updated_at: DateTime<Utc>,
    pub partitions: BTreeMap<String, PartitionMeta>,
}

impl Manifest {
    pub fn new(dataset: &str, kind: DatasetKind) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            dataset: dataset.to_string(),
            kind,
            generation: 0,
            next_seq: 1,
            updated_at: Utc::now(),
            partitions: BTreeMap::new(),
        }
    }

    pub fn rows(&self) -> u64 {
        self.partitions.values().map(|p| p.rows()).sum()
    }

    pub fn bytes(&self) -> u64 {
        self.partitions.values().map(|p| p.bytes()).sum()
    }

    pub fn files(&self) -> usize {
        self.partitions.values().map(|p| p.segments.len()).sum()
    }

    /// Most recent partition write.
    pub fn last_write(&self) -> Option<DateTime<Utc>> {
        self.partitions.values().map(|p| p.last_write).max()
    }

    pub fn is_live(&self, file: &str) -> bool {
        self.partitions
            .values()
            .any(|p| p.segments.iter().any(|s| s.file == file))
    }

    /// Load from `dir`, `Ok(None)` if the dataset has never been committed.
    pub fn load(dir: &Path) -> Result<Option<Self>, StoreError> {
        let path = dir.join(MANIFEST_FILE);
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::io(&path, e)),
        };
        let manifest: Manifest = serde_json::from_slice(&bytes)
            .map_err(|e| StoreError::corrupt(&path, format!("manifest does not decode: {e}")))?;
        if manifest.format_version != FORMAT_VERSION {
            return Err(StoreError::corrupt(
                &path,
                format!("unsupported manifest version {}", manifest.format_version),
            ));
        }
        Ok(Some(manifest))
    }

    /// Atomically replace the manifest in `dir`.
    pub fn store(&self, dir: &Path) -> Result<(), StoreError> {
        let path = dir.join(MANIFEST_FILE);
        let tmp = dir.join(format!("{MANIFEST_FILE}.{}.tmp", std::process::id()));
        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| StoreError::Codec(format!("manifest serialization: {e}")))?;
        {
            let mut f = fs::File::create(&tmp).map_err(|e| StoreError::io(&tmp, e))?;
            f.write_all(&json).map_err(|e| StoreError::io(&tmp, e))?;
            f.sync_all().map_err(|e| StoreError::io(&tmp, e))?;
        }
        fs::rename(&tmp, &path).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            StoreError::io(&path, e)
        })
    }
}
