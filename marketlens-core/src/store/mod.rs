//! Partitioned Parquet cache with manifest-based atomic swaps.

pub mod codec;
pub mod columnar;
pub mod error;
pub mod manifest;
pub mod partition;
pub mod scan;

pub use codec::Record;
pub use columnar::{
    ColumnarStore, CommitSummary, CompactOptions, CompactionReport, Corruption, StagedWrite,
    StorageReport, VerifyReport, WriteMode,
};
pub use error::StoreError;
pub use manifest::{DatasetKind, Manifest, PartitionMeta, Segment};
pub use partition::PartitionKey;
pub use scan::{PartitionBatch, PartitionScan, ReadStats};
