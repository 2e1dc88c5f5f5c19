use thiserror::Error;

use crate::model::{HarvestId, IntentionId};

/// Core error type for harvest scheduling.
#[derive(Error, Debug)]
pub enum HarvestError {
    /// A fetch intention was built with `start_date >= end_date`.
    #[error("Invalid date range: {start} is not before {end}")]
    InvalidDateRange {
        start: chrono::NaiveDate,
        end: chrono::NaiveDate,
    },

    /// Configuration could not be loaded or failed validation.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Persistence layer failure.
    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// The protocol client failed without producing a provider response.
    #[error("Report client failed for intention {intention}: {reason}")]
    Client { intention: IntentionId, reason: String },

    /// A referenced record does not exist.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// A persisted value could not be turned back into its model type.
    #[error("Invalid stored value: {0}")]
    Decode(String),

    /// The harvest is owned by an automatic plan and cannot be wiped directly.
    #[error("Harvest {0} belongs to an automatic plan")]
    AutomaticHarvest(HarvestId),

    /// A blocking storage task panicked or was cancelled.
    #[error("Blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for harvest operations.
pub type Result<T> = std::result::Result<T, HarvestError>;

impl From<config::ConfigError> for HarvestError {
    fn from(err: config::ConfigError) -> Self {
        HarvestError::Config(err.to_string())
    }
}

impl HarvestError {
    pub(crate) fn not_found(kind: &'static str, id: impl ToString) -> Self {
        HarvestError::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}
