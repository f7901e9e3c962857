#![forbid(unsafe_code)]

//! Core domain model and derivation engine for cohortvars.
//!
//! This crate provides:
//! - Domain types (subjects, events, derived values)
//! - Code sets and code list loading
//! - Event source adapters and the windowed matcher
//! - Multi-source date combination and categorisation
//! - The declarative variable table and its deriver
//! - Record loading, batch execution and output sinks

pub mod types;
pub mod error;
pub mod codeset;
pub mod window;
pub mod source;
pub mod matcher;
pub mod combine;
pub mod categorize;
pub mod variables;
pub mod derive;
pub mod cohort;
pub mod store;
pub mod batch;
pub mod sink;
pub mod config;
pub mod logging;

// Re-export commonly used types
pub use error::{Error, Result};
pub use types::*;
pub use codeset::{CodeLibrary, CodeSet};
pub use window::Window;
pub use source::{
    CauseScope, ClinicalCoding, DeathSource, DiagnosisScope, EventSource, HospitalSource,
    LabSource, MedicationSource, PrimaryCareSource, SourceRef,
};
pub use matcher::{match_event, Direction};
pub use combine::{combine, CombinePolicy};
pub use categorize::{categorize, classify_with_history, StatusRule};
pub use variables::{build_default_table, get_default_table, VariableTable};
pub use derive::{Derivation, Deriver, Issue, IssueKind};
pub use cohort::{CohortConfig, IndexDates};
pub use store::{MemoryStore, RecordStore};
pub use batch::{run_batch, BatchOutput, BatchReport};
pub use sink::{CsvSink, JsonlSink, RowSink};
pub use config::Config;
