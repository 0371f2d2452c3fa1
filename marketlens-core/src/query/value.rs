//! Scalar cell values and column extraction.

use polars::prelude::*;
use serde::Serialize;
use std::cmp::Ordering;
use std::fmt;

use super::error::QueryError;

/// One cell of a result table. Prices come out as integer ticks and
/// timestamps as epoch milliseconds, exactly as stored.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Str(String),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::UInt(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::UInt(v) => Some(*v),
            Value::Int(v) => u64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::UInt(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    fn as_i128(&self) -> Option<i128> {
        match self {
            Value::Int(v) => Some(i128::from(*v)),
            Value::UInt(v) => Some(i128::from(*v)),
            _ => None,
        }
    }

    /// SQL-style comparison: `None` when either side is null or the types
    /// are not comparable. Integers and floats compare numerically.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Null, _) | (_, Value::Null) => None,
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
            (a, b) => match (a.as_i128(), b.as_i128()) {
                (Some(x), Some(y)) => Some(x.cmp(&y)),
                _ => a.as_f64()?.partial_cmp(&b.as_f64()?),
            },
        }
    }

    /// Total order used for grouping and sorting: nulls first, then
    /// booleans, numbers, strings.
    pub fn total_cmp(&self, other: &Value) -> Ordering {
        fn rank(v: &Value) -> u8 {
            match v {
                Value::Null => 0,
                Value::Bool(_) => 1,
                Value::Int(_) | Value::UInt(_) | Value::Float(_) => 2,
                Value::Str(_) => 3,
            }
        }
        match rank(self).cmp(&rank(other)) {
            Ordering::Equal => {}
            o => return o,
        }
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Str(a), Value::Str(b)) => a.cmp(b),
            (a, b) => match (a.as_i128(), b.as_i128()) {
                (Some(x), Some(y)) => x.cmp(&y),
                _ => a
                    .as_f64()
                    .unwrap_or(f64::NAN)
                    .total_cmp(&b.as_f64().unwrap_or(f64::NAN)),
            },
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::UInt(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Str(v) => f.write_str(v),
        }
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::UInt(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::UInt(u64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

/// Key wrapper giving `Value` rows a total order for use in maps.
#[derive(Debug, Clone)]
pub(crate) struct RowKey(pub Vec<Value>);

impl PartialEq for RowKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for RowKey {}

impl PartialOrd for RowKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RowKey {
    fn cmp(&self, other: &Self) -> Ordering {
        for (a, b) in self.0.iter().zip(&other.0) {
            match a.total_cmp(b) {
                Ordering::Equal => {}
                o => return o,
            }
        }
        self.0.len().cmp(&other.0.len())
    }
}

/// Extract one column as values, whatever its chunk layout.
pub(crate) fn column_values(col: &Column) -> Result<Vec<Value>, QueryError> {
    let name = col.name().to_string();
    let type_err = |e: PolarsError| QueryError::Codec(format!("column {name}: {e}"));
    let values = match col.dtype() {
        DataType::Boolean => col.bool().map_err(type_err)?.into_iter().map(Value::from).collect(),
        DataType::String => col
            .str()
            .map_err(type_err)?
            .into_iter()
            .map(|v| v.map_or(Value::Null, Value::from))
            .collect(),
        DataType::UInt32 => col.u32().map_err(type_err)?.into_iter().map(Value::from).collect(),
        DataType::UInt64 => col.u64().map_err(type_err)?.into_iter().map(Value::from).collect(),
        DataType::Int32 => col
            .i32()
            .map_err(type_err)?
            .into_iter()
            .map(|v| v.map_or(Value::Null, |x| Value::Int(i64::from(x))))
            .collect(),
        DataType::Int64 => col.i64().map_err(type_err)?.into_iter().map(Value::from).collect(),
        DataType::Float64 => col.f64().map_err(type_err)?.into_iter().map(Value::from).collect(),
        DataType::Float32 => col
            .f32()
            .map_err(type_err)?
            .into_iter()
            .map(|v| v.map_or(Value::Null, |x| Value::Float(f64::from(x))))
            .collect(),
        other => {
            return Err(QueryError::Codec(format!(
                "column {name} has unsupported type {other}"
            )))
        }
    };
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_comparison_crosses_types() {
        assert_eq!(Value::UInt(5).compare(&Value::Int(5)), Some(Ordering::Equal));
        assert_eq!(Value::Int(-1).compare(&Value::UInt(0)), Some(Ordering::Less));
        assert_eq!(Value::Float(2.5).compare(&Value::UInt(2)), Some(Ordering::Greater));
        assert_eq!(Value::Null.compare(&Value::Int(1)), None);
        assert_eq!(Value::from("a").compare(&Value::Int(1)), None);
    }

    #[test]
    fn total_order_puts_nulls_first() {
        let mut v = vec![Value::from("b"), Value::Int(3), Value::Null, Value::Float(1.5)];
        v.sort_by(|a, b| a.total_cmp(b));
        assert_eq!(v, vec![Value::Null, Value::Float(1.5), Value::Int(3), Value::from("b")]);
    }

    #[test]
    fn column_extraction_handles_nulls_and_chunks() {
        let mut a = DataFrame::new(vec![Column::new("p".into(), vec![Some(1u32), None])]).unwrap();
        let b = DataFrame::new(vec![Column::new("p".into(), vec![Some(7u32)])]).unwrap();
        a.vstack_mut(&b).unwrap();
        let values = column_values(a.column("p").unwrap()).unwrap();
        assert_eq!(values, vec![Value::UInt(1), Value::Null, Value::UInt(7)]);
    }
}
