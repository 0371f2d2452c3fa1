//! Lazy partition scans.
//!
//! A scan pins the manifest it was created from and opens a partition's
//! segment files only when `next()` reaches it, so at most one partition's
//! handles are held at a time. A file retired by a compaction that ran after
//! the scan started is re-resolved from the newer manifest; compaction keeps
//! every row, so the partition still reads whole.

use parking_lot::Mutex;
use polars::prelude::*;
use std::collections::{BTreeMap, VecDeque};
use std::fs::File;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

use super::error::StoreError;
use super::manifest::{Manifest, Segment};
use super::partition::PartitionKey;

/// Manifest re-reads when a listed file vanishes under a reader.
const READ_RETRIES: usize = 3;

/// Cumulative read instrumentation for one store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReadStats {
    pub scans: u64,
    /// Partitions whose files were opened for decoding.
    pub partitions_opened: u64,
    /// Partitions ruled out before any file was touched.
    pub partitions_skipped: u64,
    pub files_opened: u64,
    pub rows_read: u64,
    /// Columns materialized from segment files, with how many segments
    /// each was decoded from.
    pub columns_read: BTreeMap<String, u64>,
}

impl ReadStats {
    /// True if `column` was decoded from at least one segment.
    pub fn column_was_read(&self, column: &str) -> bool {
        self.columns_read.contains_key(column)
    }
}

/// A selected partition whose files have not been opened yet.
pub(crate) struct PendingPartition {
    /// Generation of the manifest `segments` was read from.
    pub generation: u64,
    pub name: String,
    pub key: PartitionKey,
    pub segments: Vec<Segment>,
}

struct OpenSegment {
    path: PathBuf,
    file: File,
    segment: Segment,
}

/// One decoded partition.
#[derive(Debug, Clone)]
pub struct PartitionBatch {
    pub partition: String,
    pub key: PartitionKey,
    /// Stored rows of the partition. Equals `frame.height()` unless the
    /// projection was empty, in which case nothing was decoded.
    pub rows: u64,
    pub frame: DataFrame,
}

pub struct PartitionScan {
    dataset: String,
    dir: PathBuf,
    /// Manifest generation the scan was created from.
    generation: u64,
    projection: Option<Vec<String>>,
    pending: VecDeque<PendingPartition>,
    stats: Arc<Mutex<ReadStats>>,
}

impl PartitionScan {
    pub(crate) fn new(
        dataset: &str,
        dir: PathBuf,
        generation: u64,
        projection: Option<Vec<String>>,
        partitions: Vec<PendingPartition>,
        stats: Arc<Mutex<ReadStats>>,
    ) -> Self {
        Self {
            dataset: dataset.to_string(),
            dir,
            generation,
            projection,
            pending: partitions.into(),
            stats,
        }
    }

    pub fn dataset(&self) -> &str {
        &self.dataset
    }

    /// Manifest generation this scan reads from.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Partitions not yet decoded.
    pub fn remaining(&self) -> usize {
        self.pending.len()
    }

    /// Move the next `n` partitions into their own scan, for decoding on
    /// another thread. Both scans share the store's instrumentation and the
    /// pinned manifest generation.
    pub fn split_off(&mut self, n: usize) -> PartitionScan {
        let n = n.min(self.pending.len());
        let taken: Vec<PendingPartition> = self.pending.drain(..n).collect();
        PartitionScan::new(
            &self.dataset,
            self.dir.clone(),
            self.generation,
            self.projection.clone(),
            taken,
            Arc::clone(&self.stats),
        )
    }

    /// Open every segment of `part`, following a concurrent compaction if
    /// a file was retired. `Ok(None)` when retention removed the partition.
    fn open(&self, mut part: PendingPartition) -> Result<Option<(PendingPartition, Vec<OpenSegment>)>, StoreError> {
        let mut attempt = 0;
        loop {
            let vanished = match open_segments(&self.dir, &part.segments)? {
                Ok(files) => {
                    let mut stats = self.stats.lock();
                    stats.partitions_opened += 1;
                    stats.files_opened += files.len() as u64;
                    return Ok(Some((part, files)));
                }
                Err(vanished) => vanished,
            };
            let current = Manifest::load(&self.dir)?.filter(|m| m.generation > part.generation);
            let Some(current) = current.filter(|_| attempt < READ_RETRIES) else {
                warn!(dataset = %self.dataset, file = %vanished.display(), "live segment missing");
                return Err(StoreError::corrupt(vanished, "listed in manifest but missing"));
            };
            attempt += 1;
            debug!(
                dataset = %self.dataset,
                file = %vanished.display(),
                generation = current.generation,
                "segment retired under scan; following newer manifest"
            );
            part.generation = current.generation;
            match current.partitions.get(&part.name) {
                Some(meta) => part.segments = meta.segments.clone(),
                None => return Ok(None),
            }
        }
    }

    fn decode(&self, part: PendingPartition, files: Vec<OpenSegment>) -> Result<PartitionBatch, StoreError> {
        let stored: u64 = files.iter().map(|f| f.segment.rows).sum();
        if self.projection.as_ref().is_some_and(|p| p.is_empty()) {
            self.stats.lock().rows_read += stored;
            return Ok(PartitionBatch {
                partition: part.name,
                key: part.key,
                rows: stored,
                frame: DataFrame::empty(),
            });
        }
        let mut frame: Option<DataFrame> = None;
        for seg in files {
            let df = self.decode_segment(&part.name, seg)?;
            match frame.as_mut() {
                Some(acc) => {
                    acc.vstack_mut(&df).map_err(|e| StoreError::SchemaMismatch {
                        dataset: self.dataset.clone(),
                        partition: part.name.clone(),
                        column: format!("segments disagree on schema: {e}"),
                    })?;
                }
                None => frame = Some(df),
            }
        }
        let frame = frame.unwrap_or_else(DataFrame::empty);
        let rows = frame.height() as u64;
        self.stats.lock().rows_read += rows;
        Ok(PartitionBatch {
            partition: part.name,
            key: part.key,
            rows,
            frame,
        })
    }

    fn decode_segment(&self, partition: &str, seg: OpenSegment) -> Result<DataFrame, StoreError> {
        let OpenSegment {
            path,
            file,
            segment,
        } = seg;
        let mut reader = ParquetReader::new(file);
        let schema = reader
            .schema()
            .map_err(|e| StoreError::corrupt(&path, format!("unreadable footer: {e}")))?;
        let columns: Vec<String> = match &self.projection {
            Some(cols) => {
                for c in cols {
                    if !schema.contains(c.as_str()) {
                        return Err(StoreError::SchemaMismatch {
                            dataset: self.dataset.clone(),
                            partition: partition.to_string(),
                            column: c.clone(),
                        });
                    }
                }
                cols.clone()
            }
            None => schema.iter_names().map(|n| n.to_string()).collect(),
        };
        let df = reader
            .with_columns(Some(columns))
            .finish()
            .map_err(|e| StoreError::corrupt(&path, format!("undecodable segment: {e}")))?;
        if df.width() > 0 && df.height() as u64 != segment.rows {
            return Err(StoreError::corrupt(
                &path,
                format!("expected {} rows, found {}", segment.rows, df.height()),
            ));
        }
        {
            let mut stats = self.stats.lock();
            for name in df.get_column_names() {
                *stats.columns_read.entry(name.to_string()).or_insert(0) += 1;
            }
        }
        Ok(df)
    }
}

impl Iterator for PartitionScan {
    type Item = Result<PartitionBatch, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let part = self.pending.pop_front()?;
            match self.open(part) {
                Ok(Some((part, files))) => return Some(self.decode(part, files)),
                Ok(None) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.pending.len()))
    }
}

/// Open handles for each listed segment. The inner `Err` names a file that
/// no longer exists.
fn open_segments(dir: &Path, segments: &[Segment]) -> Result<Result<Vec<OpenSegment>, PathBuf>, StoreError> {
    let mut out = Vec::with_capacity(segments.len());
    for seg in segments {
        let path = dir.join(&seg.file);
        let file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Err(path)),
            Err(e) => return Err(StoreError::io(&path, e)),
        };
        check_size(&file, &path, seg)?;
        out.push(OpenSegment {
            path,
            file,
            segment: seg.clone(),
        });
    }
    Ok(Ok(out))
}

pub(crate) fn check_size(file: &File, path: &Path, seg: &Segment) -> Result<(), StoreError> {
    let len = file.metadata().map_err(|e| StoreError::io(path, e))?.len();
    if len != seg.bytes {
        return Err(StoreError::corrupt(
            path,
            format!("truncated: {len} bytes on disk, manifest records {}", seg.bytes),
        ));
    }
    Ok(())
}
