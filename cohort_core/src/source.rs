//! Event source adapters.
//!
//! Every record source exposes the same capability set to the matcher: which
//! code fields take part in code-set matching and which rows are eligible at
//! all. Source-specific shape differences stay behind this trait.

use crate::{CodeField, CodeSet, Event, SourceKind};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Uniform accessor over one kind of record source
pub trait EventSource: fmt::Debug + Send + Sync {
    fn kind(&self) -> SourceKind;

    /// Code fields this adapter inspects
    fn fields(&self) -> &[CodeField];

    /// Source-specific row predicate
    fn accepts(&self, _event: &Event) -> bool {
        true
    }

    /// First code on `event` (in event order) that is in `codes` and sits in
    /// an inspected field
    fn matched_code<'e>(&self, event: &'e Event, codes: &CodeSet) -> Option<&'e str> {
        if !self.accepts(event) {
            return None;
        }
        event
            .codes
            .iter()
            .filter(|c| self.fields().contains(&c.field))
            .map(|c| c.code.as_str())
            .find(|code| codes.contains(code))
    }

    fn matches(&self, event: &Event, codes: &CodeSet) -> bool {
        self.matched_code(event, codes).is_some()
    }
}

// ============================================================================
// Adapters
// ============================================================================

/// Coding system used for primary-care events
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ClinicalCoding {
    #[default]
    Snomed,
    Ctv3,
}

#[derive(Debug)]
pub struct PrimaryCareSource {
    fields: [CodeField; 1],
}

impl PrimaryCareSource {
    pub fn new(coding: ClinicalCoding) -> Self {
        let field = match coding {
            ClinicalCoding::Snomed => CodeField::Snomed,
            ClinicalCoding::Ctv3 => CodeField::Ctv3,
        };
        Self { fields: [field] }
    }
}

impl EventSource for PrimaryCareSource {
    fn kind(&self) -> SourceKind {
        SourceKind::PrimaryCare
    }

    fn fields(&self) -> &[CodeField] {
        &self.fields
    }
}

/// Which diagnosis positions on an admission count
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosisScope {
    Primary,
    PrimaryOrSecondary,
    #[default]
    Any,
}

#[derive(Debug)]
pub struct HospitalSource {
    scope: DiagnosisScope,
}

impl HospitalSource {
    pub fn new(scope: DiagnosisScope) -> Self {
        Self { scope }
    }
}

impl EventSource for HospitalSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Hospital
    }

    fn fields(&self) -> &[CodeField] {
        match self.scope {
            DiagnosisScope::Primary => &[CodeField::PrimaryDiagnosis],
            DiagnosisScope::PrimaryOrSecondary => {
                &[CodeField::PrimaryDiagnosis, CodeField::SecondaryDiagnosis]
            }
            DiagnosisScope::Any => &[
                CodeField::PrimaryDiagnosis,
                CodeField::SecondaryDiagnosis,
                CodeField::OtherDiagnosis,
            ],
        }
    }
}

/// Which causes on a death registration count
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CauseScope {
    Underlying,
    #[default]
    Any,
}

/// Death registrations; a match contributes the registered date of death
#[derive(Debug)]
pub struct DeathSource {
    scope: CauseScope,
}

impl DeathSource {
    pub fn new(scope: CauseScope) -> Self {
        Self { scope }
    }
}

impl EventSource for DeathSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Death
    }

    fn fields(&self) -> &[CodeField] {
        match self.scope {
            CauseScope::Underlying => &[CodeField::UnderlyingCause],
            CauseScope::Any => &[CodeField::UnderlyingCause, CodeField::ContributingCause],
        }
    }
}

#[derive(Debug)]
pub struct LabSource {
    positive_only: bool,
}

impl LabSource {
    pub fn new(positive_only: bool) -> Self {
        Self { positive_only }
    }
}

impl EventSource for LabSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Lab
    }

    fn fields(&self) -> &[CodeField] {
        &[CodeField::TestCode]
    }

    fn accepts(&self, event: &Event) -> bool {
        !self.positive_only || event.is_positive == Some(true)
    }
}

#[derive(Debug)]
pub struct MedicationSource;

impl EventSource for MedicationSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Medication
    }

    fn fields(&self) -> &[CodeField] {
        &[CodeField::Dmd]
    }
}

// ============================================================================
// Serializable adapter reference
// ============================================================================

/// Adapter selection as written in a variable table
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum SourceRef {
    PrimaryCare {
        #[serde(default)]
        coding: ClinicalCoding,
    },
    Hospital {
        #[serde(default)]
        scope: DiagnosisScope,
    },
    Death {
        #[serde(default)]
        scope: CauseScope,
    },
    Lab {
        #[serde(default)]
        positive_only: bool,
    },
    Medication,
}

impl SourceRef {
    pub fn kind(&self) -> SourceKind {
        match self {
            SourceRef::PrimaryCare { .. } => SourceKind::PrimaryCare,
            SourceRef::Hospital { .. } => SourceKind::Hospital,
            SourceRef::Death { .. } => SourceKind::Death,
            SourceRef::Lab { .. } => SourceKind::Lab,
            SourceRef::Medication => SourceKind::Medication,
        }
    }

    /// Build the adapter this reference describes
    pub fn adapter(&self) -> Box<dyn EventSource> {
        match *self {
            SourceRef::PrimaryCare { coding } => Box::new(PrimaryCareSource::new(coding)),
            SourceRef::Hospital { scope } => Box::new(HospitalSource::new(scope)),
            SourceRef::Death { scope } => Box::new(DeathSource::new(scope)),
            SourceRef::Lab { positive_only } => Box::new(LabSource::new(positive_only)),
            SourceRef::Medication => Box::new(MedicationSource),
        }
    }
}
