//! Error types for the cohort_core library.

use std::io;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for cohort_core operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// IO error occurred
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// CSV error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// TOML parsing error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Configuration validation error (bad config file, invalid variable table)
    #[error("Configuration error: {0}")]
    Config(String),

    /// The same code was given two different categories while building a code set
    #[error("Code set '{set}': code '{code}' has conflicting categories {first:?} and {second:?}")]
    CodeSetConflict {
        set: String,
        code: String,
        first: Option<String>,
        second: Option<String>,
    },

    /// A record row could not be parsed
    #[error("Record error: {0}")]
    Record(String),

    /// A source could not be read for a subject
    #[error("Source {source_kind} unavailable: {reason}")]
    SourceUnavailable { source_kind: String, reason: String },

    /// The record store has no such subject
    #[error("Unknown subject: {0}")]
    UnknownSubject(String),

    /// Variable derivation error
    #[error("Derivation error: {0}")]
    Derivation(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}
