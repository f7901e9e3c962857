//! Declarative variable table.
//!
//! Each entry names a variable and says how to derive it: which sources and
//! code sets contribute, which window applies, and how results combine. The
//! built-in table covers the post-COVID cardiovascular cohort study; other
//! studies load their own table from TOML.

use crate::{
    CauseScope, ClinicalCoding, CodeLibrary, CombinePolicy, DiagnosisScope, Direction, Error,
    Result, SourceRef, StatusRule,
};
use chrono::NaiveDate;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// Cached default table - built once and reused across all operations
static DEFAULT_TABLE: Lazy<VariableTable> = Lazy::new(build_default_table_internal);

/// Get a reference to the cached default table
pub fn get_default_table() -> &'static VariableTable {
    &DEFAULT_TABLE
}

/// Builds the default variable table
pub fn build_default_table() -> VariableTable {
    build_default_table_internal()
}

// ============================================================================
// Table Types
// ============================================================================

/// One or more code set names; several names are unioned left to right
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum CodeRef {
    One(String),
    Union(Vec<String>),
}

impl CodeRef {
    pub fn names(&self) -> Vec<&str> {
        match self {
            CodeRef::One(name) => vec![name.as_str()],
            CodeRef::Union(names) => names.iter().map(|n| n.as_str()).collect(),
        }
    }
}

impl From<&str> for CodeRef {
    fn from(name: &str) -> Self {
        CodeRef::One(name.to_string())
    }
}

impl From<&[&str]> for CodeRef {
    fn from(names: &[&str]) -> Self {
        CodeRef::Union(names.iter().map(|n| n.to_string()).collect())
    }
}

/// A contributing source: adapter plus code set(s)
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceSpec {
    #[serde(flatten)]
    pub source: SourceRef,
    pub codes: CodeRef,
    /// Keep only codes in these categories
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub categories: Option<Vec<String>>,
}

impl SourceSpec {
    pub fn new(source: SourceRef, codes: impl Into<CodeRef>) -> Self {
        Self {
            source,
            codes: codes.into(),
            categories: None,
        }
    }

    pub fn with_categories(mut self, categories: &[&str]) -> Self {
        self.categories = Some(categories.iter().map(|c| c.to_string()).collect());
        self
    }
}

/// A window bound relative to the derivation dates
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "anchor", rename_all = "snake_case")]
pub enum Anchor {
    Unbounded,
    Index {
        #[serde(default)]
        offset_days: i64,
    },
    /// Outcome end date; unbounded when the end date is null
    End {
        #[serde(default)]
        offset_days: i64,
    },
    /// Exposure end date, falling back to the outcome end date
    ExposureEnd {
        #[serde(default)]
        offset_days: i64,
    },
    Date {
        date: NaiveDate,
    },
    /// An earlier date-valued variable
    Variable {
        name: String,
        #[serde(default)]
        offset_days: i64,
    },
}

impl Anchor {
    pub fn index() -> Self {
        Anchor::Index { offset_days: 0 }
    }

    pub fn end() -> Self {
        Anchor::End { offset_days: 0 }
    }

    pub fn exposure_end() -> Self {
        Anchor::ExposureEnd { offset_days: 0 }
    }
}

/// Window bounds written in terms of anchors
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct WindowSpec {
    pub start: Anchor,
    pub end: Anchor,
}

impl WindowSpec {
    /// `(None, index]`
    pub fn history() -> Self {
        Self {
            start: Anchor::Unbounded,
            end: Anchor::index(),
        }
    }

    /// `(None, index - 1 day]`, i.e. strictly before index
    pub fn before_index() -> Self {
        Self {
            start: Anchor::Unbounded,
            end: Anchor::Index { offset_days: -1 },
        }
    }

    /// `[index, end]`
    pub fn follow_up() -> Self {
        Self {
            start: Anchor::index(),
            end: Anchor::end(),
        }
    }

    /// `[index, exposure_end]`
    pub fn exposure() -> Self {
        Self {
            start: Anchor::index(),
            end: Anchor::exposure_end(),
        }
    }

    fn anchors(&self) -> [&Anchor; 2] {
        [&self.start, &self.end]
    }
}

/// Labels produced by an escalation variable
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct EscalationLabels {
    pub escalated: String,
    pub not_escalated: String,
    pub no_anchor: String,
}

impl Default for EscalationLabels {
    fn default() -> Self {
        Self {
            escalated: "hospitalised".into(),
            not_escalated: "non_hospitalised".into(),
            no_anchor: "no_infection".into(),
        }
    }
}

fn last_direction() -> Direction {
    Direction::Last
}

/// How a variable is derived
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VariableKind {
    /// Any qualifying event in any source
    Flag {
        sources: Vec<SourceSpec>,
        #[serde(default = "WindowSpec::history")]
        window: WindowSpec,
    },
    /// Per-source first/last date, combined across sources
    Date {
        sources: Vec<SourceSpec>,
        #[serde(default = "WindowSpec::follow_up")]
        window: WindowSpec,
        #[serde(default)]
        direction: Direction,
        #[serde(default)]
        policy: CombinePolicy,
    },
    /// Category of the selected event's code
    Category {
        source: SourceSpec,
        #[serde(default = "WindowSpec::history")]
        window: WindowSpec,
        #[serde(default = "last_direction")]
        direction: Direction,
    },
    /// Latest category reclassified by history of the "ever" subset
    Status {
        source: SourceSpec,
        #[serde(default = "WindowSpec::history")]
        window: WindowSpec,
        #[serde(default)]
        rule: StatusRule,
    },
    /// Number of qualifying events, optionally capped
    Count {
        sources: Vec<SourceSpec>,
        #[serde(default = "WindowSpec::follow_up")]
        window: WindowSpec,
        #[serde(default)]
        cap: Option<i64>,
    },
    /// Whether a qualifying event follows an earlier date variable closely
    Escalation {
        anchor: String,
        sources: Vec<SourceSpec>,
        within_days: i64,
        #[serde(default)]
        labels: EscalationLabels,
    },
    /// No recorded death on or before `at`
    Alive {
        #[serde(default = "Anchor::index")]
        at: Anchor,
    },
    /// Earliest of the demographic and registered death dates
    DeathDate,
}

impl VariableKind {
    /// True for kinds whose value is a date
    pub fn is_date_valued(&self) -> bool {
        matches!(self, VariableKind::Date { .. } | VariableKind::DeathDate)
    }

    fn source_specs(&self) -> Vec<&SourceSpec> {
        match self {
            VariableKind::Flag { sources, .. }
            | VariableKind::Date { sources, .. }
            | VariableKind::Count { sources, .. }
            | VariableKind::Escalation { sources, .. } => sources.iter().collect(),
            VariableKind::Category { source, .. } | VariableKind::Status { source, .. } => {
                vec![source]
            }
            VariableKind::Alive { .. } | VariableKind::DeathDate => Vec::new(),
        }
    }

    fn window(&self) -> Option<&WindowSpec> {
        match self {
            VariableKind::Flag { window, .. }
            | VariableKind::Date { window, .. }
            | VariableKind::Category { window, .. }
            | VariableKind::Status { window, .. }
            | VariableKind::Count { window, .. } => Some(window),
            _ => None,
        }
    }
}

/// A named variable definition
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct VariableDef {
    pub name: String,
    #[serde(flatten)]
    pub kind: VariableKind,
}

impl VariableDef {
    pub fn new(name: impl Into<String>, kind: VariableKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// Ordered variable table; order is evaluation order
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct VariableTable {
    #[serde(default)]
    pub variables: Vec<VariableDef>,
}

impl VariableTable {
    pub fn names(&self) -> Vec<&str> {
        self.variables.iter().map(|v| v.name.as_str()).collect()
    }

    /// Code set names referenced anywhere in the table, deduplicated in order
    pub fn code_set_names(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.variables
            .iter()
            .flat_map(|v| v.kind.source_specs())
            .flat_map(|s| s.codes.names())
            .filter(|name| seen.insert(*name))
            .collect()
    }

    /// Load a table from a TOML file of `[[variables]]` entries
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let table: VariableTable = toml::from_str(&contents)?;
        tracing::info!("Loaded {} variables from {:?}", table.variables.len(), path);
        Ok(table)
    }

    /// Validate the table against a code library
    ///
    /// Returns a list of validation errors (empty if valid)
    pub fn validate(&self, library: &CodeLibrary) -> Vec<String> {
        let mut errors = Vec::new();
        // name -> is date valued, for variables defined so far
        let mut defined: Vec<(&str, bool)> = Vec::new();

        if self.variables.is_empty() {
            errors.push("Variable table is empty".to_string());
        }

        for var in &self.variables {
            let name = var.name.as_str();
            if name.trim().is_empty() {
                errors.push("Variable with empty name".to_string());
            }
            if defined.iter().any(|(n, _)| *n == name) {
                errors.push(format!("Variable '{}' is defined twice", name));
            }

            let specs = var.kind.source_specs();
            let needs_sources = !matches!(
                var.kind,
                VariableKind::Alive { .. } | VariableKind::DeathDate
            );
            if needs_sources && specs.is_empty() {
                errors.push(format!("Variable '{}' has no sources", name));
            }
            for spec in specs {
                let names = spec.codes.names();
                if names.is_empty() {
                    errors.push(format!("Variable '{}' has a source with no code sets", name));
                }
                if spec.categories.as_ref().is_some_and(|c| c.is_empty()) {
                    errors.push(format!("Variable '{}' has an empty category filter", name));
                }
                for code_set in names {
                    if library.get(code_set).is_none() {
                        errors.push(format!(
                            "Variable '{}' references unknown code set '{}'",
                            name, code_set
                        ));
                    }
                }
            }

            let mut anchors: Vec<&Anchor> = var
                .kind
                .window()
                .map(|w| w.anchors().to_vec())
                .unwrap_or_default();
            let mut anchor_names: Vec<&str> = Vec::new();

            match &var.kind {
                VariableKind::Status { rule, .. } => {
                    errors.extend(rule.validate().into_iter().map(|e| format!("Variable '{}': {}", name, e)));
                }
                VariableKind::Count { cap: Some(cap), .. } if *cap < 0 => {
                    errors.push(format!("Variable '{}': cap {} is negative", name, cap));
                }
                VariableKind::Escalation {
                    anchor, within_days, ..
                } => {
                    if *within_days < 0 {
                        errors.push(format!(
                            "Variable '{}': within_days {} is negative",
                            name, within_days
                        ));
                    }
                    anchor_names.push(anchor.as_str());
                }
                VariableKind::Alive { at } => {
                    if matches!(at, Anchor::Unbounded | Anchor::Variable { .. }) {
                        errors.push(format!(
                            "Variable '{}': alive must be anchored on index, end, exposure_end or a date",
                            name
                        ));
                    }
                    anchors.push(at);
                }
                _ => {}
            }

            for anchor in anchors {
                if let Anchor::Variable { name: target, .. } = anchor {
                    anchor_names.push(target.as_str());
                }
            }
            for target in anchor_names {
                match defined.iter().find(|(n, _)| *n == target) {
                    Some((_, true)) => {}
                    Some((_, false)) => errors.push(format!(
                        "Variable '{}' is anchored on '{}', which is not a date",
                        name, target
                    )),
                    None => errors.push(format!(
                        "Variable '{}' is anchored on '{}', which is not defined before it",
                        name, target
                    )),
                }
            }

            defined.push((name, var.kind.is_date_valued()));
        }

        errors
    }

    /// Validate and turn the error list into a configuration error
    pub fn check(&self, library: &CodeLibrary) -> Result<()> {
        let errors = self.validate(library);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Config(format!(
                "Invalid variable table:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

// ============================================================================
// Default table
// ============================================================================

fn gp(codes: impl Into<CodeRef>) -> SourceSpec {
    SourceSpec::new(SourceRef::PrimaryCare { coding: ClinicalCoding::Snomed }, codes)
}

fn gp_ctv3(codes: impl Into<CodeRef>) -> SourceSpec {
    SourceSpec::new(SourceRef::PrimaryCare { coding: ClinicalCoding::Ctv3 }, codes)
}

fn apc(codes: impl Into<CodeRef>) -> SourceSpec {
    SourceSpec::new(SourceRef::Hospital { scope: DiagnosisScope::Any }, codes)
}

fn death(codes: impl Into<CodeRef>) -> SourceSpec {
    SourceSpec::new(SourceRef::Death { scope: CauseScope::Any }, codes)
}

fn med(codes: impl Into<CodeRef>) -> SourceSpec {
    SourceSpec::new(SourceRef::Medication, codes)
}

fn history_flag(name: &str, sources: Vec<SourceSpec>) -> VariableDef {
    VariableDef::new(
        name,
        VariableKind::Flag {
            sources,
            window: WindowSpec::history(),
        },
    )
}

fn first_date(name: &str, sources: Vec<SourceSpec>, window: WindowSpec) -> VariableDef {
    VariableDef::new(
        name,
        VariableKind::Date {
            sources,
            window,
            direction: Direction::First,
            policy: CombinePolicy::Earliest,
        },
    )
}

/// Combined outcome date plus one per-source date for each contributing source
fn outcome(name: &str, snomed: &str, icd10: &str) -> Vec<VariableDef> {
    vec![
        first_date(&format!("tmp_out_date_{}_gp", name), vec![gp(snomed)], WindowSpec::follow_up()),
        first_date(&format!("tmp_out_date_{}_apc", name), vec![apc(icd10)], WindowSpec::follow_up()),
        first_date(&format!("tmp_out_date_{}_death", name), vec![death(icd10)], WindowSpec::follow_up()),
        first_date(
            &format!("out_date_{}", name),
            vec![gp(snomed), apc(icd10), death(icd10)],
            WindowSpec::follow_up(),
        ),
    ]
}

fn build_default_table_internal() -> VariableTable {
    let covid_gp: &[&str] = &[
        "covid_primary_care_code",
        "covid_primary_care_positive_test",
        "covid_primary_care_sequalae",
    ];

    let mut variables = vec![
        // Inclusion
        VariableDef::new("inex_bin_alive", VariableKind::Alive { at: Anchor::index() }),
        // Censoring
        VariableDef::new("cens_date_death", VariableKind::DeathDate),
        // Exposure: COVID-19
        first_date(
            "exp_date_covid",
            vec![
                SourceSpec::new(SourceRef::Lab { positive_only: true }, "covid_lab_test"),
                gp_ctv3(covid_gp),
                SourceSpec::new(
                    SourceRef::Hospital { scope: DiagnosisScope::PrimaryOrSecondary },
                    "covid_codes",
                ),
                death("covid_codes"),
            ],
            WindowSpec::exposure(),
        ),
        // Quality assurance
        history_flag(
            "qa_bin_prostate_cancer",
            vec![gp("prostate_cancer_snomed"), apc("prostate_cancer_icd10")],
        ),
        history_flag("qa_bin_pregnancy", vec![gp("pregnancy_snomed")]),
        history_flag("qa_bin_hrtcocp", vec![med(&["cocp_dmd", "hrt_dmd"][..])]),
    ];

    // Outcomes
    variables.extend(outcome("ami", "ami_snomed", "ami_icd10"));
    variables.extend(outcome("stroke_sahhs", "stroke_sahhs_snomed", "stroke_sahhs_icd10"));

    // Core covariates
    variables.push(VariableDef::new(
        "cov_cat_ethnicity",
        VariableKind::Category {
            source: gp("ethnicity_snomed"),
            window: WindowSpec::history(),
            direction: Direction::Last,
        },
    ));
    variables.push(VariableDef::new(
        "cov_cat_smoking",
        VariableKind::Status {
            source: gp_ctv3("smoking_clear"),
            window: WindowSpec::history(),
            rule: StatusRule::default(),
        },
    ));

    let dementia: &[&str] = &["dementia_nonvas_snomed", "dementia_vas_snomed"];
    let dementia_icd10: &[&str] = &["dementia_nonvas_icd10", "dementia_vas_icd10"];
    let stroke: &[&str] = &["stroke_isch_snomed", "stroke_sahhs_snomed"];
    let stroke_icd10: &[&str] = &["stroke_isch_icd10", "stroke_sahhs_icd10"];
    let vte: &[&str] = &[
        "dvt_nonpreg_snomed",
        "dvt_preg_snomed",
        "icvt_snomed",
        "other_dvt_snomed",
        "pe_snomed",
        "pvt_snomed",
    ];
    let vte_icd10: &[&str] = &[
        "dvt_nonpreg_icd10",
        "dvt_preg_icd10",
        "icvt_nonpreg_icd10",
        "icvt_preg_icd10",
        "other_dvt_icd10",
        "pe_icd10",
        "pvt_icd10",
    ];
    let ami_icd10: &[&str] = &["ami_icd10", "ami_prior_icd10"];

    variables.extend([
        history_flag("cov_bin_dementia", vec![gp(dementia), apc(dementia_icd10)]),
        history_flag(
            "cov_bin_liver_disease",
            vec![gp("liver_disease_snomed"), apc("liver_disease_icd10")],
        ),
        history_flag("cov_bin_ckd", vec![gp("ckd_snomed"), apc("ckd_icd10")]),
        history_flag("cov_bin_cancer", vec![gp("cancer_snomed"), apc("cancer_icd10")]),
        history_flag(
            "cov_bin_hypertension",
            vec![
                gp("hypertension_snomed"),
                med("hypertension_drugs_dmd"),
                apc("hypertension_icd10"),
            ],
        ),
        history_flag(
            "cov_bin_diabetes",
            vec![gp("diabetes_snomed"), med("diabetes_drugs_dmd"), apc("diabetes_icd10")],
        ),
        history_flag("cov_bin_obesity", vec![gp("obesity_snomed"), apc("obesity_icd10")]),
        history_flag("cov_bin_copd", vec![gp_ctv3("copd_ctv3"), apc("copd_icd10")]),
        history_flag("cov_bin_ami", vec![gp("ami_snomed"), apc(ami_icd10)]),
        history_flag(
            "cov_bin_depression",
            vec![gp("depression_snomed"), apc("depression_icd10")],
        ),
        // Project specific covariates
        history_flag("cov_bin_stroke_all", vec![gp(stroke), apc(stroke_icd10)]),
        history_flag("cov_bin_other_ae", vec![gp("other_ae_snomed"), apc("other_ae_icd10")]),
        history_flag("cov_bin_vte", vec![gp(vte), apc(vte_icd10)]),
        history_flag("cov_bin_hf", vec![gp("hf_snomed"), apc("hf_icd10")]),
        history_flag("cov_bin_angina", vec![gp("angina_snomed"), apc("angina_icd10")]),
        history_flag("cov_bin_lipidmed", vec![med("lipid_lowering_dmd")]),
        history_flag("cov_bin_antiplatelet", vec![med("antiplatelet_dmd")]),
        history_flag("cov_bin_anticoagulant", vec![med("anticoagulant_dmd")]),
        history_flag("cov_bin_cocp", vec![med("cocp_dmd")]),
        history_flag("cov_bin_hrt", vec![med("hrt_dmd")]),
    ]);

    // Subgroups
    variables.push(VariableDef::new(
        "sub_bin_covidhistory",
        VariableKind::Flag {
            sources: vec![
                SourceSpec::new(SourceRef::Lab { positive_only: true }, "covid_lab_test"),
                gp_ctv3(covid_gp),
                SourceSpec::new(
                    SourceRef::Hospital { scope: DiagnosisScope::PrimaryOrSecondary },
                    "covid_codes",
                ),
            ],
            window: WindowSpec::before_index(),
        },
    ));
    variables.push(VariableDef::new(
        "sub_cat_covidhospital",
        VariableKind::Escalation {
            anchor: "exp_date_covid".into(),
            sources: vec![SourceSpec::new(
                SourceRef::Hospital { scope: DiagnosisScope::Primary },
                "covid_codes",
            )],
            within_days: 28,
            labels: EscalationLabels::default(),
        },
    ));

    VariableTable { variables }
}
