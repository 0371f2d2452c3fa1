//! Query execution over the columnar store and in-memory frames.
//!
//! Only the columns a query mentions are requested from storage, and
//! partitions the predicate rules out are never opened. Partitions are
//! decoded in windows of at most `threads` on a private rayon pool; each
//! window is folded into the running result before the next is decoded.

use polars::prelude::*;
use rayon::prelude::*;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::debug;

use super::aggregate::{Aggregation, GroupedState};
use super::error::QueryError;
use super::predicate::Predicate;
use super::value::{column_values, Value};
use crate::config::QueryConfig;
use crate::store::{ColumnarStore, PartitionScan};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    pub column: String,
    pub descending: bool,
}

impl SortKey {
    pub fn asc(column: &str) -> Self {
        Self {
            column: column.to_string(),
            descending: false,
        }
    }

    pub fn desc(column: &str) -> Self {
        Self {
            column: column.to_string(),
            descending: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Query {
    pub datasets: Vec<String>,
    pub predicate: Predicate,
    /// Output columns; `None` returns every stored column. Ignored when an
    /// aggregation is present.
    pub projection: Option<Vec<String>>,
    pub aggregation: Option<Aggregation>,
    /// Applied to output columns, nulls last in either direction.
    pub sort: Vec<SortKey>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn new<S: Into<String>>(datasets: impl IntoIterator<Item = S>) -> Self {
        Self {
            datasets: datasets.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.predicate = std::mem::take(&mut self.predicate).and(predicate);
        self
    }

    pub fn select<S: Into<String>>(mut self, columns: impl IntoIterator<Item = S>) -> Self {
        self.projection = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    pub fn aggregate(mut self, aggregation: Aggregation) -> Self {
        self.aggregation = Some(aggregation);
        self
    }

    pub fn sort_by(mut self, key: SortKey) -> Self {
        self.sort.push(key);
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    /// Columns that must be read, or `None` for all of them. An aggregation
    /// needing no column (a bare count) reads none.
    fn needed_columns(&self) -> Option<Vec<String>> {
        let mut cols: BTreeSet<String> = self.predicate.columns();
        match (&self.aggregation, &self.projection) {
            (Some(agg), _) => cols.extend(agg.input_columns().map(str::to_string)),
            (None, Some(p)) => {
                cols.extend(p.iter().cloned());
                cols.extend(self.sort.iter().map(|k| k.column.clone()));
            }
            (None, None) => return None,
        }
        Some(cols.into_iter().collect())
    }
}

/// Rows in output column order.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct ResultTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl ResultTable {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// All values of one column.
    pub fn column(&self, name: &str) -> Option<Vec<&Value>> {
        let i = self.column_index(name)?;
        Some(self.rows.iter().map(|r| &r[i]).collect())
    }

    pub fn get(&self, row: usize, column: &str) -> Option<&Value> {
        let i = self.column_index(column)?;
        self.rows.get(row).map(|r| &r[i])
    }
}

/// Output of one partition.
enum Partial {
    Rows {
        columns: Vec<String>,
        rows: Vec<Vec<Value>>,
    },
    Groups(GroupedState),
}

pub struct QueryEngine {
    store: Arc<ColumnarStore>,
    pool: rayon::ThreadPool,
    threads: usize,
    max_rows: usize,
}

impl QueryEngine {
    pub fn new(store: Arc<ColumnarStore>, config: &QueryConfig) -> Result<Self, QueryError> {
        let threads = config.threads.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("marketlens-query-{i}"))
            .build()
            .map_err(|e| QueryError::Pool(e.to_string()))?;
        Ok(Self {
            store,
            pool,
            threads,
            max_rows: config.max_rows,
        })
    }

    pub fn store(&self) -> &Arc<ColumnarStore> {
        &self.store
    }

    /// Run `query` over stored datasets, in dataset order.
    pub fn query(&self, query: &Query) -> Result<ResultTable, QueryError> {
        if query.datasets.is_empty() {
            return Err(QueryError::Invalid("no datasets".into()));
        }
        let mut fold = Fold::new(query, self.max_rows)?;
        let needed = query.needed_columns();
        let pruner = |k: &crate::store::PartitionKey| query.predicate.may_match(k);

        'datasets: for dataset in &query.datasets {
            let mut scan = self.store.scan(dataset, &pruner, needed.as_deref())?;
            while scan.remaining() > 0 {
                let window: Vec<PartitionScan> = (0..self.threads)
                    .map(|_| scan.split_off(1))
                    .filter(|s| s.remaining() > 0)
                    .collect();
                let partials: Vec<Result<Vec<Partial>, QueryError>> = self.pool.install(|| {
                    window
                        .into_par_iter()
                        .map(|s| decode_scan(dataset, s, needed.as_deref(), query))
                        .collect()
                });
                for partial in partials {
                    for p in partial? {
                        fold.absorb(dataset, p)?;
                    }
                }
                if fold.satisfied() {
                    break 'datasets;
                }
            }
        }
        let table = fold.finish()?;
        debug!(
            datasets = ?query.datasets,
            rows = table.len(),
            columns = ?needed,
            "query finished"
        );
        Ok(table)
    }

    /// Run `query` over frames held in memory; `query.datasets` is ignored.
    pub fn query_frames(&self, frames: &[DataFrame], query: &Query) -> Result<ResultTable, QueryError> {
        let mut fold = Fold::new(query, self.max_rows)?;
        let needed = query.needed_columns();
        for frame in frames {
            let partial = process_frame("memory", frame, frame.height(), needed.as_deref(), query)?;
            fold.absorb("memory", partial)?;
            if fold.satisfied() {
                break;
            }
        }
        fold.finish()
    }
}

fn decode_scan(
    dataset: &str,
    scan: PartitionScan,
    needed: Option<&[String]>,
    query: &Query,
) -> Result<Vec<Partial>, QueryError> {
    let mut out = Vec::new();
    for batch in scan {
        let batch = batch?;
        out.push(process_frame(dataset, &batch.frame, batch.rows as usize, needed, query)?);
    }
    Ok(out)
}

/// Filter one frame and either collect its rows or fold them into groups.
/// `height` is passed separately since a frame decoded with no columns has
/// none.
fn process_frame(
    dataset: &str,
    frame: &DataFrame,
    height: usize,
    needed: Option<&[String]>,
    query: &Query,
) -> Result<Partial, QueryError> {
    let names: Vec<String> = match needed {
        Some(cols) => cols.to_vec(),
        None => frame.get_column_names().iter().map(|n| n.to_string()).collect(),
    };
    let mut columns = Vec::with_capacity(names.len());
    for name in &names {
        let col = frame
            .column(name)
            .map_err(|_| QueryError::SchemaMismatch {
                dataset: dataset.to_string(),
                column: name.clone(),
            })?;
        columns.push(column_values(col)?);
    }
    for c in query.predicate.columns() {
        if !names.contains(&c) {
            return Err(QueryError::SchemaMismatch {
                dataset: dataset.to_string(),
                column: c,
            });
        }
    }
    let index: HashMap<&str, usize> = names.iter().enumerate().map(|(i, n)| (n.as_str(), i)).collect();
    let matching = (0..height).filter(|&row| {
        let get = |c: &str| index.get(c).map(|&j| &columns[j][row]);
        query.predicate.matches(&get)
    });

    match &query.aggregation {
        Some(agg) => {
            let lookup = |c: &str| {
                index.get(c).copied().ok_or_else(|| QueryError::SchemaMismatch {
                    dataset: dataset.to_string(),
                    column: c.to_string(),
                })
            };
            let key_idx = agg
                .group_by
                .iter()
                .map(|c| lookup(c.as_str()))
                .collect::<Result<Vec<_>, _>>()?;
            let measure_idx = agg
                .measures
                .iter()
                .map(|m| m.column.as_deref().map(&lookup).transpose())
                .collect::<Result<Vec<_>, _>>()?;
            let mut state = GroupedState::default();
            for row in matching {
                let keys = key_idx.iter().map(|&j| columns[j][row].clone()).collect();
                let values: Vec<Option<&Value>> = measure_idx
                    .iter()
                    .map(|j| j.map(|j| &columns[j][row]))
                    .collect();
                state.update(agg, keys, &values);
            }
            Ok(Partial::Groups(state))
        }
        None => {
            let rows = matching
                .map(|row| columns.iter().map(|c| c[row].clone()).collect())
                .collect();
            Ok(Partial::Rows { columns: names, rows })
        }
    }
}

/// Running result of one query.
///
/// A sorted and limited row query keeps only the current top `limit` rows
/// between windows. `max_rows` bounds what is held, never what was scanned.
struct Fold<'q> {
    query: &'q Query,
    max_rows: usize,
    layout: Option<Vec<String>>,
    /// Sort keys resolved against `layout`.
    keys: Vec<(usize, bool)>,
    rows: Vec<Vec<Value>>,
    groups: GroupedState,
}

impl<'q> Fold<'q> {
    fn new(query: &'q Query, max_rows: usize) -> Result<Self, QueryError> {
        if let Some(agg) = &query.aggregation {
            agg.validate()?;
            let outputs = agg.output_columns();
            if let Some(k) = query.sort.iter().find(|k| !outputs.contains(&k.column)) {
                return Err(QueryError::Invalid(format!(
                    "sort column '{}' is not an output of the aggregation",
                    k.column
                )));
            }
        }
        Ok(Self {
            query,
            max_rows,
            layout: None,
            keys: Vec::new(),
            rows: Vec::new(),
            groups: GroupedState::default(),
        })
    }

    fn absorb(&mut self, dataset: &str, partial: Partial) -> Result<(), QueryError> {
        match partial {
            Partial::Groups(g) => self.groups.merge(g),
            Partial::Rows { columns, rows } => {
                if self.layout.is_none() {
                    self.keys = resolve_sort_keys(dataset, &self.query.sort, &columns)?;
                    self.layout = Some(columns.clone());
                }
                let layout = self.layout.as_deref().unwrap_or_default();
                if layout == columns.as_slice() {
                    self.rows.extend(rows);
                } else {
                    let mut order = Vec::with_capacity(layout.len());
                    for name in layout {
                        let i = columns.iter().position(|c| c == name).ok_or_else(|| {
                            QueryError::SchemaMismatch {
                                dataset: dataset.to_string(),
                                column: name.clone(),
                            }
                        })?;
                        order.push(i);
                    }
                    self.rows
                        .extend(rows.into_iter().map(|r| order.iter().map(|&i| r[i].clone()).collect()));
                }
                if let Some(n) = self.query.limit {
                    if !self.keys.is_empty() {
                        // Stable, so ties keep scan order across windows.
                        let keys = &self.keys;
                        self.rows.sort_by(|a, b| compare_rows(a, b, keys));
                    }
                    self.rows.truncate(n);
                }
                if self.rows.len() > self.max_rows {
                    return Err(QueryError::TooManyRows { limit: self.max_rows });
                }
            }
        }
        Ok(())
    }

    /// True once an unsorted, limited row query has enough rows.
    fn satisfied(&self) -> bool {
        self.query.aggregation.is_none()
            && self.query.sort.is_empty()
            && self.query.limit.is_some_and(|n| self.rows.len() >= n)
    }

    fn finish(self) -> Result<ResultTable, QueryError> {
        let query = self.query;
        let (columns, mut rows, layout, keys) = match &query.aggregation {
            Some(agg) => {
                let columns = agg.output_columns();
                let rows = self.groups.finish(agg);
                let keys = resolve_sort_keys("aggregation", &query.sort, &columns)?;
                (columns.clone(), rows, columns, keys)
            }
            None => {
                let layout = self.layout.unwrap_or_default();
                let columns = query.projection.clone().unwrap_or_else(|| layout.clone());
                (columns, self.rows, layout, self.keys)
            }
        };

        if !keys.is_empty() {
            rows.sort_by(|a, b| compare_rows(a, b, &keys));
        }
        if let Some(n) = query.limit {
            rows.truncate(n);
        }
        if rows.len() > self.max_rows {
            return Err(QueryError::TooManyRows { limit: self.max_rows });
        }
        if columns != layout {
            let order: Vec<usize> = columns
                .iter()
                .filter_map(|c| layout.iter().position(|l| l == c))
                .collect();
            rows = rows
                .into_iter()
                .map(|r| order.iter().map(|&i| r[i].clone()).collect())
                .collect();
        }
        Ok(ResultTable { columns, rows })
    }
}

/// Positions of the sort columns in `columns`, with their direction.
fn resolve_sort_keys(dataset: &str, sort: &[SortKey], columns: &[String]) -> Result<Vec<(usize, bool)>, QueryError> {
    sort.iter()
        .map(|k| {
            columns
                .iter()
                .position(|c| *c == k.column)
                .map(|i| (i, k.descending))
                .ok_or_else(|| QueryError::SchemaMismatch {
                    dataset: dataset.to_string(),
                    column: k.column.clone(),
                })
        })
        .collect()
}

fn compare_rows(a: &[Value], b: &[Value], keys: &[(usize, bool)]) -> Ordering {
    for &(i, descending) in keys {
        let ord = match (a[i].is_null(), b[i].is_null()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) => {
                let o = a[i].total_cmp(&b[i]);
                if descending {
                    o.reverse()
                } else {
                    o
                }
            }
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}
