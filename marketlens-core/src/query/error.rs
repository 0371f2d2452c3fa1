use thiserror::Error;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("dataset {dataset}: column '{column}' is not in the stored schema")]
    SchemaMismatch { dataset: String, column: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("invalid query: {0}")]
    Invalid(String),

    #[error("result exceeds {limit} rows")]
    TooManyRows { limit: usize },

    #[error("decode error: {0}")]
    Codec(String),

    #[error("query pool: {0}")]
    Pool(String),
}

impl QueryError {
    /// Whether the stored data cannot answer this query as asked.
    pub fn is_schema_mismatch(&self) -> bool {
        matches!(
            self,
            QueryError::SchemaMismatch { .. } | QueryError::Store(StoreError::SchemaMismatch { .. })
        )
    }

    pub fn is_corruption(&self) -> bool {
        matches!(self, QueryError::Store(e) if e.is_corruption())
    }
}
