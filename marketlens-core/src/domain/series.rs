//! Series metadata records.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

use super::{DataSource, ValidationError};

/// A series: a recurring family of events and the markets that belong to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesRecord {
    pub series_ticker: String,
    pub title: String,
    pub category: String,
    /// Member market tickers, kept ordered so snapshots compare stably.
    pub members: BTreeSet<String>,
    pub source: DataSource,
}

impl SeriesRecord {
    pub fn new(series_ticker: impl Into<String>, title: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            series_ticker: series_ticker.into(),
            title: title.into(),
            category: category.into(),
            members: BTreeSet::new(),
            source: DataSource::Kalshi,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.series_ticker.trim().is_empty() {
            return Err(ValidationError::EmptyTicker);
        }
        if self.members.iter().any(|m| m.trim().is_empty()) {
            return Err(ValidationError::EmptyTicker);
        }
        Ok(())
    }
}

/// Reject a snapshot in which one market ticker appears in two series.
pub fn validate_series_membership(series: &[SeriesRecord]) -> Result<(), ValidationError> {
    let mut owner: HashMap<&str, &str> = HashMap::new();
    for s in series {
        s.validate()?;
        for m in &s.members {
            if let Some(prev) = owner.insert(m.as_str(), s.series_ticker.as_str()) {
                if prev != s.series_ticker {
                    return Err(ValidationError::DuplicateMembership {
                        ticker: m.clone(),
                        first: prev.to_string(),
                        second: s.series_ticker.clone(),
                    });
                }
            }
        }
    }
    Ok(())
}
