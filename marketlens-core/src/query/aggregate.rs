//! Group-by aggregation, folded batch by batch.
//!
//! Each partition batch produces a partial [`GroupedState`]; partials are
//! merged in partition order, so no step needs the unfiltered dataset in
//! memory. Percentiles keep the matching values of their group only.

use std::collections::BTreeMap;

use super::error::QueryError;
use super::value::{RowKey, Value};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AggFunc {
    /// Rows, or non-null values when a column is given.
    Count,
    Sum,
    Min,
    Max,
    Mean,
    /// Linear interpolation between closest ranks, `p` in `[0, 1]`.
    Percentile(f64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Measure {
    pub func: AggFunc,
    pub column: Option<String>,
    pub alias: String,
}

impl Measure {
    pub fn count(alias: &str) -> Self {
        Self {
            func: AggFunc::Count,
            column: None,
            alias: alias.to_string(),
        }
    }

    pub fn of(func: AggFunc, column: &str, alias: &str) -> Self {
        Self {
            func,
            column: Some(column.to_string()),
            alias: alias.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Aggregation {
    pub group_by: Vec<String>,
    pub measures: Vec<Measure>,
}

impl Aggregation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn group_by<S: Into<String>>(mut self, columns: impl IntoIterator<Item = S>) -> Self {
        self.group_by.extend(columns.into_iter().map(Into::into));
        self
    }

    pub fn measure(mut self, measure: Measure) -> Self {
        self.measures.push(measure);
        self
    }

    pub fn validate(&self) -> Result<(), QueryError> {
        if self.measures.is_empty() && self.group_by.is_empty() {
            return Err(QueryError::Invalid("aggregation without groups or measures".into()));
        }
        for m in &self.measures {
            match (m.func, &m.column) {
                (AggFunc::Count, _) => {}
                (_, None) => {
                    return Err(QueryError::Invalid(format!("measure '{}' needs a column", m.alias)))
                }
                (AggFunc::Percentile(p), _) if !(0.0..=1.0).contains(&p) => {
                    return Err(QueryError::Invalid(format!("percentile {p} outside [0, 1]")))
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Output column names: group keys, then measure aliases.
    pub fn output_columns(&self) -> Vec<String> {
        self.group_by
            .iter()
            .cloned()
            .chain(self.measures.iter().map(|m| m.alias.clone()))
            .collect()
    }

    /// Input columns read by the aggregation.
    pub fn input_columns(&self) -> impl Iterator<Item = &str> {
        self.group_by
            .iter()
            .map(String::as_str)
            .chain(self.measures.iter().filter_map(|m| m.column.as_deref()))
    }
}

#[derive(Debug, Clone)]
enum Acc {
    Count(u64),
    Sum { int: i128, float: f64, is_float: bool, seen: bool },
    Min(Option<Value>),
    Max(Option<Value>),
    Mean { sum: f64, n: u64 },
    Values(Vec<f64>),
}

impl Acc {
    fn new(func: AggFunc) -> Self {
        match func {
            AggFunc::Count => Acc::Count(0),
            AggFunc::Sum => Acc::Sum {
                int: 0,
                float: 0.0,
                is_float: false,
                seen: false,
            },
            AggFunc::Min => Acc::Min(None),
            AggFunc::Max => Acc::Max(None),
            AggFunc::Mean => Acc::Mean { sum: 0.0, n: 0 },
            AggFunc::Percentile(_) => Acc::Values(Vec::new()),
        }
    }

    /// `value` is `None` for a bare row count.
    fn update(&mut self, value: Option<&Value>) {
        match self {
            Acc::Count(n) => {
                if value.map_or(true, |v| !v.is_null()) {
                    *n += 1;
                }
            }
            Acc::Sum {
                int,
                float,
                is_float,
                seen,
            } => match value {
                Some(Value::Int(v)) => {
                    *int += i128::from(*v);
                    *seen = true;
                }
                Some(Value::UInt(v)) => {
                    *int += i128::from(*v);
                    *seen = true;
                }
                Some(Value::Float(v)) => {
                    *float += v;
                    *is_float = true;
                    *seen = true;
                }
                _ => {}
            },
            Acc::Min(cur) => {
                if let Some(v) = value.filter(|v| !v.is_null()) {
                    if cur.as_ref().map_or(true, |c| v.total_cmp(c).is_lt()) {
                        *cur = Some(v.clone());
                    }
                }
            }
            Acc::Max(cur) => {
                if let Some(v) = value.filter(|v| !v.is_null()) {
                    if cur.as_ref().map_or(true, |c| v.total_cmp(c).is_gt()) {
                        *cur = Some(v.clone());
                    }
                }
            }
            Acc::Mean { sum, n } => {
                if let Some(x) = value.and_then(Value::as_f64) {
                    *sum += x;
                    *n += 1;
                }
            }
            Acc::Values(vs) => {
                if let Some(x) = value.and_then(Value::as_f64) {
                    vs.push(x);
                }
            }
        }
    }

    fn merge(&mut self, other: Acc) {
        match (self, other) {
            (Acc::Count(a), Acc::Count(b)) => *a += b,
            (
                Acc::Sum {
                    int,
                    float,
                    is_float,
                    seen,
                },
                Acc::Sum {
                    int: i2,
                    float: f2,
                    is_float: if2,
                    seen: s2,
                },
            ) => {
                *int += i2;
                *float += f2;
                *is_float |= if2;
                *seen |= s2;
            }
            (Acc::Min(a), Acc::Min(b)) => {
                if let Some(b) = b {
                    if a.as_ref().map_or(true, |c| b.total_cmp(c).is_lt()) {
                        *a = Some(b);
                    }
                }
            }
            (Acc::Max(a), Acc::Max(b)) => {
                if let Some(b) = b {
                    if a.as_ref().map_or(true, |c| b.total_cmp(c).is_gt()) {
                        *a = Some(b);
                    }
                }
            }
            (Acc::Mean { sum, n }, Acc::Mean { sum: s2, n: n2 }) => {
                *sum += s2;
                *n += n2;
            }
            (Acc::Values(a), Acc::Values(b)) => a.extend(b),
            _ => {}
        }
    }

    fn finish(self, func: AggFunc) -> Value {
        match self {
            Acc::Count(n) => Value::UInt(n),
            Acc::Sum { seen: false, .. } => Value::Null,
            Acc::Sum {
                int,
                float,
                is_float: true,
                ..
            } => Value::Float(int as f64 + float),
            Acc::Sum { int, .. } => match i64::try_from(int) {
                Ok(v) => Value::Int(v),
                Err(_) => Value::Float(int as f64),
            },
            Acc::Min(v) | Acc::Max(v) => v.unwrap_or(Value::Null),
            Acc::Mean { n: 0, .. } => Value::Null,
            Acc::Mean { sum, n } => Value::Float(sum / n as f64),
            Acc::Values(mut vs) => {
                let AggFunc::Percentile(p) = func else {
                    return Value::Null;
                };
                percentile(&mut vs, p).map_or(Value::Null, Value::Float)
            }
        }
    }
}

/// Linear-interpolated percentile; sorts `values` in place.
pub fn percentile(values: &mut [f64], p: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(f64::total_cmp);
    let rank = p.clamp(0.0, 1.0) * (values.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = rank - lo as f64;
    Some(values[lo] + (values[hi] - values[lo]) * frac)
}

/// Partial aggregation state keyed by group.
#[derive(Debug, Clone, Default)]
pub(crate) struct GroupedState {
    groups: BTreeMap<RowKey, Vec<Acc>>,
}

impl GroupedState {
    /// Fold one row; `measure_values` lines up with `agg.measures`.
    pub fn update(&mut self, agg: &Aggregation, keys: Vec<Value>, measure_values: &[Option<&Value>]) {
        let accs = self
            .groups
            .entry(RowKey(keys))
            .or_insert_with(|| agg.measures.iter().map(|m| Acc::new(m.func)).collect());
        for (acc, v) in accs.iter_mut().zip(measure_values) {
            acc.update(*v);
        }
    }

    pub fn merge(&mut self, other: GroupedState) {
        for (key, accs) in other.groups {
            match self.groups.get_mut(&key) {
                Some(mine) => {
                    for (a, b) in mine.iter_mut().zip(accs) {
                        a.merge(b);
                    }
                }
                None => {
                    self.groups.insert(key, accs);
                }
            }
        }
    }

    /// Finished rows in group-key order. With no group columns and no
    /// input rows, a single row of empty measures is produced.
    pub fn finish(self, agg: &Aggregation) -> Vec<Vec<Value>> {
        let mut groups = self.groups;
        if groups.is_empty() && agg.group_by.is_empty() {
            groups.insert(
                RowKey(Vec::new()),
                agg.measures.iter().map(|m| Acc::new(m.func)).collect(),
            );
        }
        groups
            .into_iter()
            .map(|(key, accs)| {
                let mut row = key.0;
                row.extend(
                    accs.into_iter()
                        .zip(&agg.measures)
                        .map(|(acc, m)| acc.finish(m.func)),
                );
                row
            })
            .collect()
    }
}
