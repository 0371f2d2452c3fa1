//! Columnar cache store.
//!
//! Layout: `{root}/{dataset}/_manifest.json` plus immutable segment files
//! `{partition}-{seq}.parquet`. Writes go to a temp file, are renamed into
//! place, and become visible only when the manifest is swapped. Segment
//! files are never rewritten in place, so readers need no locks.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use polars::prelude::*;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::codec::Record;
use super::error::StoreError;
use super::manifest::{DatasetKind, Manifest, PartitionMeta, Segment};
use super::partition::{is_valid_dataset_name, segment_file_name, PartitionKey, SEGMENT_EXT, TMP_SUFFIX};
use super::scan::{check_size, PartitionScan, PendingPartition, ReadStats};
use crate::config::{CompressionCodec, StorageConfig};

/// How a write combines with what a partition already holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Add a new segment. Time-series appends must start after the
    /// partition's stored range.
    Append,
    /// Replace every segment of each written partition.
    ReplacePartition,
}

/// What one committed write changed.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitSummary {
    pub dataset: String,
    /// Manifest generation the write published.
    pub generation: u64,
    pub partitions: Vec<String>,
    /// Rows written, across every partition.
    pub rows: u64,
    /// Segments retired by `ReplacePartition`.
    pub replaced_segments: usize,
}

/// Compaction settings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompactOptions {
    /// Drop time-series rows whose order key is before this instant.
    pub retain_after: Option<DateTime<Utc>>,
}

/// Result of one compaction run over a dataset.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompactionReport {
    pub partitions_compacted: usize,
    /// Partitions skipped because a writer changed them mid-compaction.
    pub partitions_skipped: usize,
    pub segments_removed: usize,
    pub rows_before: u64,
    pub rows_after: u64,
    /// Files in the dataset directory that no manifest referenced.
    pub orphans_removed: usize,
}

/// Size and freshness of one dataset, read from its manifest alone.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageReport {
    pub dataset: String,
    pub kind: DatasetKind,
    pub generation: u64,
    pub partitions: usize,
    pub files: usize,
    pub bytes: u64,
    pub rows: u64,
    pub last_write: Option<DateTime<Utc>>,
}

/// One damaged or missing segment file.
#[derive(Debug, Clone, PartialEq)]
pub struct Corruption {
    pub path: PathBuf,
    pub reason: String,
}

/// Result of checking every live segment against its manifest entry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VerifyReport {
    pub files_checked: usize,
    pub problems: Vec<Corruption>,
}

impl VerifyReport {
    /// No segment failed its size or checksum check.
    pub fn is_clean(&self) -> bool {
        self.problems.is_empty()
    }
}

struct StagedPartition {
    name: String,
    key: PartitionKey,
    seq: u64,
    file: String,
    tmp: PathBuf,
    rows: u64,
    bytes: u64,
    checksum: String,
    min_order: Option<i64>,
    max_order: Option<i64>,
    renamed: bool,
}

impl StagedPartition {
    fn segment(&self) -> Segment {
        Segment {
            file: self.file.clone(),
            seq: self.seq,
            rows: self.rows,
            bytes: self.bytes,
            checksum: self.checksum.clone(),
            min_order: self.min_order,
            max_order: self.max_order,
        }
    }
}

/// Segment files written but not yet visible.
///
/// [`commit`](Self::commit) publishes them; dropping the value instead
/// removes them and leaves the stored partitions untouched.
pub struct StagedWrite<'a> {
    store: &'a ColumnarStore,
    dataset: String,
    kind: DatasetKind,
    mode: WriteMode,
    parts: Vec<StagedPartition>,
    done: bool,
}

impl StagedWrite<'_> {
    pub fn dataset(&self) -> &str {
        &self.dataset
    }

    /// Partition names the commit will touch, in key order.
    pub fn partitions(&self) -> Vec<&str> {
        self.parts.iter().map(|p| p.name.as_str()).collect()
    }

    /// Rows staged across every partition.
    pub fn rows(&self) -> u64 {
        self.parts.iter().map(|p| p.rows).sum()
    }

    /// Temp files holding the staged data.
    pub fn staged_paths(&self) -> Vec<&Path> {
        self.parts.iter().map(|p| p.tmp.as_path()).collect()
    }

    /// Rename staged files into place and swap the manifest.
    pub fn commit(mut self) -> Result<CommitSummary, StoreError> {
        let store = self.store;
        let dir = store.dataset_dir(&self.dataset);
        let lock = store.writer_lock(&self.dataset);
        let _guard = lock.lock();

        if self.parts.is_empty() {
            self.done = true;
            let generation = Manifest::load(&dir)?.map(|m| m.generation).unwrap_or(0);
            return Ok(CommitSummary {
                dataset: self.dataset.clone(),
                generation,
                partitions: Vec::new(),
                rows: 0,
                replaced_segments: 0,
            });
        }

        let mut manifest =
            Manifest::load(&dir)?.unwrap_or_else(|| Manifest::new(&self.dataset, self.kind));
        if manifest.kind != self.kind {
            return Err(StoreError::KindMismatch {
                dataset: self.dataset.clone(),
                expected: self.kind,
                found: manifest.kind,
            });
        }

        if self.mode == WriteMode::Append && self.kind == DatasetKind::TimeSeries {
            for p in &self.parts {
                let stored_max = manifest.partitions.get(&p.name).and_then(|m| m.max_order());
                if let (Some(stored_max), Some(new_min)) = (stored_max, p.min_order) {
                    if new_min <= stored_max {
                        return Err(StoreError::Overlap {
                            dataset: self.dataset.clone(),
                            partition: p.name.clone(),
                            stored_max,
                            new_min,
                        });
                    }
                }
            }
        }

        for p in &mut self.parts {
            let target = dir.join(&p.file);
            fs::rename(&p.tmp, &target).map_err(|e| StoreError::io(&target, e))?;
            p.renamed = true;
        }

        let now = Utc::now();
        let mut replaced: Vec<String> = Vec::new();
        for p in &self.parts {
            let meta = manifest
                .partitions
                .entry(p.name.clone())
                .or_insert_with(|| PartitionMeta {
                    key: p.key.clone(),
                    segments: Vec::new(),
                    last_write: now,
                });
            if self.mode == WriteMode::ReplacePartition {
                replaced.extend(meta.segments.drain(..).map(|s| s.file));
            }
            meta.segments.push(p.segment());
            meta.last_write = now;
            manifest.next_seq = manifest.next_seq.max(p.seq + 1);
        }
        manifest.generation += 1;
        manifest.updated_at = now;
        manifest.store(&dir)?;
        self.done = true;
        store.unregister_staged(self.parts.iter().map(|p| &p.tmp));

        for file in &replaced {
            remove_tolerant(&dir.join(file));
        }

        let summary = CommitSummary {
            dataset: self.dataset.clone(),
            generation: manifest.generation,
            partitions: self.parts.iter().map(|p| p.name.clone()).collect(),
            rows: self.rows(),
            replaced_segments: replaced.len(),
        };
        info!(
            dataset = %summary.dataset,
            generation = summary.generation,
            partitions = summary.partitions.len(),
            rows = summary.rows,
            replaced = summary.replaced_segments,
            "partition commit"
        );
        Ok(summary)
    }
}

impl Drop for StagedWrite<'_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let dir = self.store.dataset_dir(&self.dataset);
        for p in &self.parts {
            if p.renamed {
                remove_tolerant(&dir.join(&p.file));
            } else {
                remove_tolerant(&p.tmp);
            }
        }
        self.store.unregister_staged(self.parts.iter().map(|p| &p.tmp));
        debug!(dataset = %self.dataset, partitions = self.parts.len(), "staged write discarded");
    }
}

/// Parquet segment store with one manifest per dataset.
///
/// Writers of one dataset are serialized; readers never take a writer lock
/// and see whichever manifest generation was current when they started.
/// Shared across threads behind an `Arc`.
pub struct ColumnarStore {
    root: PathBuf,
    compression: CompressionCodec,
    row_group_size: Option<usize>,
    writer_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    reserved_seq: Mutex<HashMap<String, u64>>,
    staged: Mutex<HashSet<PathBuf>>,
    stats: Arc<Mutex<ReadStats>>,
}

impl ColumnarStore {
    /// Store under `config.root`, created if missing. Nothing is read until
    /// a dataset is touched.
    pub fn open(config: &StorageConfig) -> Result<Self, StoreError> {
        fs::create_dir_all(&config.root).map_err(|e| StoreError::io(&config.root, e))?;
        Ok(Self {
            root: config.root.clone(),
            compression: config.compression,
            row_group_size: config.row_group_size,
            writer_locks: Mutex::new(HashMap::new()),
            reserved_seq: Mutex::new(HashMap::new()),
            staged: Mutex::new(HashSet::new()),
            stats: Arc::new(Mutex::new(ReadStats::default())),
        })
    }

    /// Store at `root` with default encoding settings.
    pub fn at(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        Self::open(&StorageConfig {
            root: root.into(),
            ..StorageConfig::default()
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding `dataset`'s manifest and segments.
    pub fn dataset_dir(&self, dataset: &str) -> PathBuf {
        self.root.join(dataset)
    }

    /// Read instrumentation accumulated since open or the last reset.
    pub fn read_stats(&self) -> ReadStats {
        self.stats.lock().clone()
    }

    pub fn reset_read_stats(&self) {
        *self.stats.lock() = ReadStats::default();
    }

    /// Current manifest of `dataset`; `None` before its first commit.
    pub fn manifest(&self, dataset: &str) -> Result<Option<Manifest>, StoreError> {
        check_name(dataset)?;
        Manifest::load(&self.dataset_dir(dataset))
    }

    /// Committed metadata of one partition; `None` if it holds nothing.
    pub fn partition(&self, dataset: &str, key: &PartitionKey) -> Result<Option<PartitionMeta>, StoreError> {
        Ok(self
            .manifest(dataset)?
            .and_then(|mut m| m.partitions.remove(&key.name(dataset))))
    }

    /// Datasets with a committed manifest.
    pub fn datasets(&self) -> Result<Vec<String>, StoreError> {
        let mut out = Vec::new();
        let entries = fs::read_dir(&self.root).map_err(|e| StoreError::io(&self.root, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(&self.root, e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if is_valid_dataset_name(&name) && entry.path().join(super::manifest::MANIFEST_FILE).exists() {
                out.push(name);
            }
        }
        out.sort();
        Ok(out)
    }

    /// Encode `records` into temp segment files, one per partition.
    pub fn stage<R: Record>(
        &self,
        dataset: &str,
        records: &[R],
        mode: WriteMode,
    ) -> Result<StagedWrite<'_>, StoreError> {
        check_name(dataset)?;
        let dir = self.dataset_dir(dataset);
        fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
        if let Some(m) = Manifest::load(&dir)? {
            if m.kind != R::KIND {
                return Err(StoreError::KindMismatch {
                    dataset: dataset.to_string(),
                    expected: R::KIND,
                    found: m.kind,
                });
            }
        }

        let mut groups: BTreeMap<PartitionKey, Vec<R>> = BTreeMap::new();
        if R::KIND == DatasetKind::Snapshot && mode == WriteMode::ReplacePartition {
            groups.entry(PartitionKey::Whole).or_default();
        }
        for r in records {
            groups.entry(r.partition_key()).or_default().push(r.clone());
        }

        let mut staged = StagedWrite {
            store: self,
            dataset: dataset.to_string(),
            kind: R::KIND,
            mode,
            parts: Vec::with_capacity(groups.len()),
            done: false,
        };
        let first_seq = self.reserve_seqs(dataset, &dir, groups.len() as u64)?;
        for (i, (key, group)) in groups.into_iter().enumerate() {
            let rows = normalize(group);
            let part = self.write_temp_segment(&dir, dataset, key, first_seq + i as u64, &rows)?;
            staged.parts.push(part);
        }
        Ok(staged)
    }

    /// Stage and commit in one step.
    pub fn write<R: Record>(
        &self,
        dataset: &str,
        records: &[R],
        mode: WriteMode,
    ) -> Result<CommitSummary, StoreError> {
        self.stage(dataset, records, mode)?.commit()
    }

    /// Open a scan over the partitions accepted by `filter`, reading only
    /// `projection` (all stored columns when `None`).
    ///
    /// The manifest is read once here; no segment file is opened until the
    /// scan reaches its partition.
    pub fn scan(
        &self,
        dataset: &str,
        filter: &dyn Fn(&PartitionKey) -> bool,
        projection: Option<&[String]>,
    ) -> Result<PartitionScan, StoreError> {
        check_name(dataset)?;
        let dir = self.dataset_dir(dataset);
        let projection = projection.map(|p| p.to_vec());
        let manifest = Manifest::load(&dir)?;
        let generation = manifest.as_ref().map_or(0, |m| m.generation);
        let mut selected = Vec::new();
        let mut skipped = 0u64;
        for (name, meta) in manifest.iter().flat_map(|m| &m.partitions) {
            if !filter(&meta.key) {
                skipped += 1;
                continue;
            }
            selected.push(PendingPartition {
                generation,
                name: name.clone(),
                key: meta.key.clone(),
                segments: meta.segments.clone(),
            });
        }
        {
            let mut stats = self.stats.lock();
            stats.scans += 1;
            stats.partitions_skipped += skipped;
        }
        Ok(PartitionScan::new(
            dataset,
            dir,
            generation,
            projection,
            selected,
            Arc::clone(&self.stats),
        ))
    }

    /// Every stored record of a dataset whose partition passes `filter`.
    pub fn read_records<R: Record>(
        &self,
        dataset: &str,
        filter: &dyn Fn(&PartitionKey) -> bool,
    ) -> Result<Vec<R>, StoreError> {
        let columns: Vec<String> = R::columns().iter().map(|c| c.to_string()).collect();
        let dir = self.dataset_dir(dataset);
        let mut out = Vec::new();
        for batch in self.scan(dataset, filter, Some(&columns))? {
            let batch = batch?;
            let records = R::from_frame(&batch.frame)
                .map_err(|e| StoreError::corrupt(dir.join(&batch.partition), e.to_string()))?;
            out.extend(records);
        }
        Ok(out)
    }

    /// Merge each partition's segments into one file.
    ///
    /// Rows are sorted by order key and the latest write of a duplicated
    /// identity wins. Partitions changed by a writer while the merge runs
    /// are left alone. Readers holding old handles keep working.
    pub fn compact<R: Record>(
        &self,
        dataset: &str,
        options: &CompactOptions,
    ) -> Result<CompactionReport, StoreError> {
        check_name(dataset)?;
        let dir = self.dataset_dir(dataset);
        let mut report = CompactionReport::default();
        let Some(before) = Manifest::load(&dir)? else {
            return Ok(report);
        };
        if before.kind != R::KIND {
            return Err(StoreError::KindMismatch {
                dataset: dataset.to_string(),
                expected: R::KIND,
                found: before.kind,
            });
        }
        let cutoff = options.retain_after.map(|t| t.timestamp_millis());

        // Merge outside the writer lock. Index into `staged.parts`, or `None`
        // when retention emptied the partition.
        let mut planned: Vec<(String, Vec<String>, Option<usize>)> = Vec::new();
        let mut staged = StagedWrite {
            store: self,
            dataset: dataset.to_string(),
            kind: R::KIND,
            mode: WriteMode::ReplacePartition,
            parts: Vec::new(),
            done: false,
        };
        for (name, meta) in &before.partitions {
            let needs_retention = match (cutoff, meta.min_order()) {
                (Some(cut), Some(min)) => min < cut,
                _ => false,
            };
            if meta.segments.len() < 2 && !needs_retention {
                continue;
            }
            let mut rows: Vec<R> = Vec::new();
            for seg in &meta.segments {
                rows.extend(read_segment::<R>(&dir.join(&seg.file), seg)?);
            }
            report.rows_before += rows.len() as u64;
            let mut merged = normalize(rows);
            if let Some(cut) = cutoff {
                merged.retain(|r| r.order_key().map_or(true, |k| k >= cut));
            }
            report.rows_after += merged.len() as u64;
            let files: Vec<String> = meta.segments.iter().map(|s| s.file.clone()).collect();
            if merged.is_empty() && R::KIND == DatasetKind::TimeSeries {
                planned.push((name.clone(), files, None));
                continue;
            }
            let seq = self.reserve_seqs(dataset, &dir, 1)?;
            let part = self.write_temp_segment(&dir, dataset, meta.key.clone(), seq, &merged)?;
            staged.parts.push(part);
            planned.push((name.clone(), files, Some(staged.parts.len() - 1)));
        }
        if planned.is_empty() {
            staged.done = true;
            report.orphans_removed = {
                let lock = self.writer_lock(dataset);
                let _guard = lock.lock();
                let current = Manifest::load(&dir)?.unwrap_or(before);
                self.sweep_orphans(&dir, &current)?
            };
            return Ok(report);
        }

        let lock = self.writer_lock(dataset);
        let _guard = lock.lock();
        let mut manifest = Manifest::load(&dir)?.unwrap_or_else(|| Manifest::new(dataset, R::KIND));
        let mut retired: Vec<String> = Vec::new();
        let now = Utc::now();
        for (name, expected_files, part) in planned {
            let current: Option<Vec<String>> = manifest
                .partitions
                .get(&name)
                .map(|m| m.segments.iter().map(|s| s.file.clone()).collect());
            if current.as_ref() != Some(&expected_files) {
                report.partitions_skipped += 1;
                if let Some(i) = part {
                    remove_tolerant(&staged.parts[i].tmp);
                }
                continue;
            }
            match part {
                Some(i) => {
                    let p = &mut staged.parts[i];
                    let target = dir.join(&p.file);
                    fs::rename(&p.tmp, &target).map_err(|e| StoreError::io(&target, e))?;
                    p.renamed = true;
                    if let Some(meta) = manifest.partitions.get_mut(&name) {
                        meta.segments = vec![p.segment()];
                        meta.last_write = now;
                    }
                    manifest.next_seq = manifest.next_seq.max(p.seq + 1);
                }
                None => {
                    manifest.partitions.remove(&name);
                }
            }
            report.partitions_compacted += 1;
            report.segments_removed += expected_files.len();
            retired.extend(expected_files);
        }

        if report.partitions_compacted > 0 {
            manifest.generation += 1;
            manifest.updated_at = now;
            manifest.store(&dir)?;
        }
        staged.done = true;
        self.unregister_staged(staged.parts.iter().map(|p| &p.tmp));

        for file in &retired {
            remove_tolerant(&dir.join(file));
        }
        report.orphans_removed = self.sweep_orphans(&dir, &manifest)?;

        info!(
            dataset,
            compacted = report.partitions_compacted,
            skipped = report.partitions_skipped,
            segments_removed = report.segments_removed,
            rows_before = report.rows_before,
            rows_after = report.rows_after,
            orphans = report.orphans_removed,
            "compaction finished"
        );
        Ok(report)
    }

    /// Check every live file against its recorded size and checksum.
    pub fn verify(&self, dataset: &str) -> Result<VerifyReport, StoreError> {
        let dir = self.dataset_dir(dataset);
        let mut report = VerifyReport::default();
        let Some(manifest) = self.manifest(dataset)? else {
            return Ok(report);
        };
        for meta in manifest.partitions.values() {
            for seg in &meta.segments {
                let path = dir.join(&seg.file);
                report.files_checked += 1;
                let problem = match fs::read(&path) {
                    Err(e) if e.kind() == ErrorKind::NotFound => Some("missing".to_string()),
                    Err(e) => Some(format!("unreadable: {e}")),
                    Ok(bytes) if bytes.len() as u64 != seg.bytes => Some(format!(
                        "size {} does not match manifest {}",
                        bytes.len(),
                        seg.bytes
                    )),
                    Ok(bytes) => {
                        let hash = blake3::hash(&bytes).to_hex().to_string();
                        (hash != seg.checksum).then(|| "checksum mismatch".to_string())
                    }
                };
                if let Some(reason) = problem {
                    warn!(dataset, file = %path.display(), %reason, "corrupt segment");
                    report.problems.push(Corruption { path, reason });
                }
            }
        }
        Ok(report)
    }

    /// Sizes and last write of `dataset`, without opening a segment.
    pub fn storage_report(&self, dataset: &str) -> Result<Option<StorageReport>, StoreError> {
        Ok(self.manifest(dataset)?.map(|m| StorageReport {
            dataset: m.dataset.clone(),
            kind: m.kind,
            generation: m.generation,
            partitions: m.partitions.len(),
            files: m.files(),
            bytes: m.bytes(),
            rows: m.rows(),
            last_write: m.last_write(),
        }))
    }

    fn writer_lock(&self, dataset: &str) -> Arc<Mutex<()>> {
        let mut locks = self.writer_locks.lock();
        Arc::clone(locks.entry(dataset.to_string()).or_default())
    }

    /// Reserve `n` consecutive sequence numbers for new segment files.
    fn reserve_seqs(&self, dataset: &str, dir: &Path, n: u64) -> Result<u64, StoreError> {
        let mut reserved = self.reserved_seq.lock();
        let on_disk = Manifest::load(dir)?.map(|m| m.next_seq).unwrap_or(1);
        let next = reserved.get(dataset).copied().unwrap_or(1).max(on_disk);
        reserved.insert(dataset.to_string(), next + n);
        Ok(next)
    }

    fn unregister_staged<'p>(&self, paths: impl Iterator<Item = &'p PathBuf>) {
        let mut staged = self.staged.lock();
        for p in paths {
            staged.remove(p);
        }
    }

    fn write_temp_segment<R: Record>(
        &self,
        dir: &Path,
        dataset: &str,
        key: PartitionKey,
        seq: u64,
        rows: &[R],
    ) -> Result<StagedPartition, StoreError> {
        let name = key.name(dataset);
        let file = segment_file_name(&name, seq);
        let tmp = dir.join(format!("{file}.{}{TMP_SUFFIX}", std::process::id()));
        self.staged.lock().insert(tmp.clone());

        let mut df = R::to_frame(rows)?;
        let written = write_parquet(&mut df, &tmp, self.compression, self.row_group_size);
        let bytes = match written.and_then(|()| fs::read(&tmp).map_err(|e| StoreError::io(&tmp, e))) {
            Ok(b) => b,
            Err(e) => {
                remove_tolerant(&tmp);
                self.unregister_staged(std::iter::once(&tmp));
                return Err(e);
            }
        };
        let order: Vec<i64> = rows.iter().filter_map(|r| r.order_key()).collect();
        Ok(StagedPartition {
            name,
            key,
            seq,
            file,
            rows: rows.len() as u64,
            bytes: bytes.len() as u64,
            checksum: blake3::hash(&bytes).to_hex().to_string(),
            min_order: order.iter().copied().min(),
            max_order: order.iter().copied().max(),
            tmp,
            renamed: false,
        })
    }

    /// Remove temp files no live writer owns and segments the manifest
    /// does not list. Caller holds the writer lock.
    fn sweep_orphans(&self, dir: &Path, manifest: &Manifest) -> Result<usize, StoreError> {
        let staged = self.staged.lock().clone();
        let mut removed = 0;
        let entries = fs::read_dir(dir).map_err(|e| StoreError::io(dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(dir, e))?;
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            let orphan = if name.ends_with(TMP_SUFFIX) {
                !staged.contains(&path)
            } else if name.ends_with(&format!(".{SEGMENT_EXT}")) {
                !manifest.is_live(&name)
            } else {
                false
            };
            if orphan && fs::remove_file(&path).is_ok() {
                debug!(file = %path.display(), "orphan removed");
                removed += 1;
            }
        }
        Ok(removed)
    }
}

fn check_name(dataset: &str) -> Result<(), StoreError> {
    if is_valid_dataset_name(dataset) {
        Ok(())
    } else {
        Err(StoreError::InvalidName(dataset.to_string()))
    }
}

/// Order rows by order key; the last occurrence of an identity wins and
/// keeps its first position.
fn normalize<R: Record>(rows: Vec<R>) -> Vec<R> {
    let mut out: Vec<R> = Vec::with_capacity(rows.len());
    let mut index: HashMap<String, usize> = HashMap::with_capacity(rows.len());
    for r in rows {
        match index.get(&r.identity()) {
            Some(&i) => out[i] = r,
            None => {
                index.insert(r.identity(), out.len());
                out.push(r);
            }
        }
    }
    if R::KIND == DatasetKind::TimeSeries {
        out.sort_by_key(|r| r.order_key());
    }
    out
}

fn parquet_compression(codec: CompressionCodec) -> ParquetCompression {
    match codec {
        CompressionCodec::Zstd => ParquetCompression::Zstd(None),
        CompressionCodec::Snappy => ParquetCompression::Snappy,
        CompressionCodec::Uncompressed => ParquetCompression::Uncompressed,
    }
}

fn write_parquet(
    df: &mut DataFrame,
    path: &Path,
    codec: CompressionCodec,
    row_group_size: Option<usize>,
) -> Result<(), StoreError> {
    let mut file = fs::File::create(path).map_err(|e| StoreError::io(path, e))?;
    ParquetWriter::new(&mut file)
        .with_compression(parquet_compression(codec))
        .with_row_group_size(row_group_size)
        .finish(df)
        .map_err(|e| StoreError::Codec(format!("write parquet {}: {e}", path.display())))?;
    file.sync_all().map_err(|e| StoreError::io(path, e))
}

/// Decode one whole segment, checking it against the manifest first.
fn read_segment<R: Record>(path: &Path, seg: &Segment) -> Result<Vec<R>, StoreError> {
    let file = match fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(StoreError::corrupt(path, "listed in manifest but missing"))
        }
        Err(e) => return Err(StoreError::io(path, e)),
    };
    check_size(&file, path, seg)?;
    let df = ParquetReader::new(file)
        .finish()
        .map_err(|e| StoreError::corrupt(path, format!("undecodable segment: {e}")))?;
    R::from_frame(&df).map_err(|e| StoreError::corrupt(path, e.to_string()))
}

fn remove_tolerant(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => debug!(file = %path.display(), error = %e, "could not remove file"),
    }
}
