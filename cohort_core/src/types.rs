//! Core domain types for cohort variable derivation.
//!
//! This module defines the fundamental types used throughout the system:
//! - Source kinds and the coded fields an event can carry
//! - Events, demographics and per-subject snapshots
//! - Derived values and per-subject output rows

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::{Error, Result};

/// Opaque subject identifier
pub type SubjectId = String;

// ============================================================================
// Source and Code Field Types
// ============================================================================

/// The kind of record source an event came from
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    PrimaryCare,
    Hospital,
    Death,
    Lab,
    Medication,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::PrimaryCare => "primary_care",
            SourceKind::Hospital => "hospital",
            SourceKind::Death => "death",
            SourceKind::Lab => "lab",
            SourceKind::Medication => "medication",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where on a source row a code was recorded
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CodeField {
    /// Primary-care SNOMED CT concept
    Snomed,
    /// Primary-care Read v3 (CTV3) code
    Ctv3,
    /// Medication dm+d code
    Dmd,
    PrimaryDiagnosis,
    SecondaryDiagnosis,
    /// Any further diagnosis listed on an admission
    OtherDiagnosis,
    UnderlyingCause,
    ContributingCause,
    /// Laboratory test code
    TestCode,
}

/// A single code carried by an event
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventCode {
    pub field: CodeField,
    pub code: String,
}

impl EventCode {
    pub fn new(field: CodeField, code: impl Into<String>) -> Self {
        Self {
            field,
            code: code.into(),
        }
    }
}

// ============================================================================
// Event and Subject Types
// ============================================================================

/// A dated, coded record for one subject from one source
///
/// `row_id` is the source-internal row number and is the tie-break key when
/// two events share a date.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Event {
    pub source: SourceKind,
    pub row_id: u64,
    pub date: Option<NaiveDate>,
    pub codes: Vec<EventCode>,
    /// Lab result flag; `None` for every other source
    pub is_positive: Option<bool>,
}

impl Event {
    pub fn new(source: SourceKind, row_id: u64, date: Option<NaiveDate>) -> Self {
        Self {
            source,
            row_id,
            date,
            codes: Vec::new(),
            is_positive: None,
        }
    }

    pub fn with_code(mut self, field: CodeField, code: impl Into<String>) -> Self {
        self.codes.push(EventCode::new(field, code));
        self
    }

    pub fn with_result(mut self, is_positive: bool) -> Self {
        self.is_positive = Some(is_positive);
        self
    }
}

/// Single-row demographic source
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Demographics {
    pub date_of_birth: Option<NaiveDate>,
    pub sex: Option<String>,
    pub date_of_death: Option<NaiveDate>,
}

/// Events held for one source of one subject
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceEvents {
    Loaded(Vec<Event>),
    /// The source could not be read for this subject
    Unreadable(String),
}

/// Read-only snapshot of everything known about one subject
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Subject {
    pub id: SubjectId,
    pub demographics: Demographics,
    sources: HashMap<SourceKind, SourceEvents>,
}

impl Subject {
    pub fn new(id: impl Into<SubjectId>) -> Self {
        Self {
            id: id.into(),
            demographics: Demographics::default(),
            sources: HashMap::new(),
        }
    }

    pub fn with_demographics(mut self, demographics: Demographics) -> Self {
        self.demographics = demographics;
        self
    }

    /// Builder form of [`Subject::push_event`]
    pub fn with_event(mut self, event: Event) -> Self {
        self.push_event(event);
        self
    }

    /// Add an event to its source. Ignored once the source is unreadable.
    pub fn push_event(&mut self, event: Event) {
        match self
            .sources
            .entry(event.source)
            .or_insert_with(|| SourceEvents::Loaded(Vec::new()))
        {
            SourceEvents::Loaded(events) => events.push(event),
            SourceEvents::Unreadable(_) => {}
        }
    }

    /// Mark a source unreadable; its events are discarded.
    pub fn mark_unreadable(&mut self, kind: SourceKind, reason: impl Into<String>) {
        let reason = reason.into();
        match self.sources.get_mut(&kind) {
            // keep the first reason
            Some(SourceEvents::Unreadable(_)) => {}
            _ => {
                self.sources.insert(kind, SourceEvents::Unreadable(reason));
            }
        }
    }

    /// Events of one source; a source with no rows is an empty slice
    pub fn events(&self, kind: SourceKind) -> Result<&[Event]> {
        match self.sources.get(&kind) {
            None => Ok(&[]),
            Some(SourceEvents::Loaded(events)) => Ok(events),
            Some(SourceEvents::Unreadable(reason)) => Err(Error::SourceUnavailable {
                source_kind: kind.to_string(),
                reason: reason.clone(),
            }),
        }
    }
}

// ============================================================================
// Derived Values
// ============================================================================

/// A derived variable value
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Date(Option<NaiveDate>),
    Flag(bool),
    Category(Option<String>),
    Integer(Option<i64>),
    /// Derivation failed; distinct from "no data"
    Failed(String),
}

impl Value {
    pub fn is_failed(&self) -> bool {
        matches!(self, Value::Failed(_))
    }

    /// Flat text form used by the CSV sink
    pub fn to_field(&self) -> String {
        match self {
            Value::Date(Some(date)) => date.format("%Y-%m-%d").to_string(),
            Value::Flag(true) => "T".into(),
            Value::Flag(false) => "F".into(),
            Value::Category(Some(category)) => category.clone(),
            Value::Integer(Some(n)) => n.to_string(),
            Value::Date(None) | Value::Category(None) | Value::Integer(None) => String::new(),
            Value::Failed(_) => "!failed".into(),
        }
    }
}

/// All derived values for one subject, in variable-table order
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct DerivedRow {
    pub subject_id: SubjectId,
    pub values: Vec<(String, Value)>,
}

impl DerivedRow {
    pub fn new(subject_id: impl Into<SubjectId>) -> Self {
        Self {
            subject_id: subject_id.into(),
            values: Vec::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, value)| value)
    }

    pub fn push(&mut self, name: impl Into<String>, value: Value) {
        self.values.push((name.into(), value));
    }
}
