//! Analytical queries over cached datasets.

pub mod aggregate;
pub mod engine;
pub mod error;
pub mod predicate;
pub mod value;
pub mod views;

pub use aggregate::{percentile, AggFunc, Aggregation, Measure};
pub use engine::{Query, QueryEngine, ResultTable, SortKey};
pub use error::QueryError;
pub use predicate::{CmpOp, Predicate, Truth};
pub use value::Value;
