//! Variable derivation.
//!
//! A [`Deriver`] is compiled once from a variable table and a code library,
//! then evaluated per subject. Evaluation is read-only: the deriver holds no
//! per-subject state, so one instance serves every cohort regime and thread.
//!
//! Variables are evaluated in table order and later variables may read the
//! values of earlier ones (window and escalation anchors).

use crate::categorize::{categorize_from, classify_with_history};
use crate::matcher::{count, exists, find_event};
use crate::variables::{Anchor, CodeRef, EscalationLabels, SourceSpec, VariableKind, WindowSpec};
use crate::{
    combine, CodeLibrary, CodeSet, CombinePolicy, DerivedRow, Direction, Error, Event,
    EventSource, IndexDates, Result, SourceKind, StatusRule, Subject, Value, VariableTable,
    Window,
};
use chrono::{Days, NaiveDate};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A problem recorded while deriving one variable
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub variable: String,
    #[serde(flatten)]
    pub kind: IssueKind,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "issue", rename_all = "snake_case")]
pub enum IssueKind {
    Failed {
        reason: String,
    },
    /// Window start after end; evaluated as no match
    DegenerateWindow {
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    },
}

/// Output of one subject's derivation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Derivation {
    pub row: DerivedRow,
    pub issues: Vec<Issue>,
}

impl Derivation {
    pub fn has_failures(&self) -> bool {
        self.row.values.iter().any(|(_, v)| v.is_failed())
    }
}

// ============================================================================
// Compiled table
// ============================================================================

/// Adapter and code set resolved for evaluation
#[derive(Debug)]
struct Resolved {
    adapter: Box<dyn EventSource>,
    codes: Arc<CodeSet>,
}

impl Resolved {
    fn kind(&self) -> SourceKind {
        self.adapter.kind()
    }

    fn events<'s>(&self, subject: &'s Subject) -> Result<&'s [Event]> {
        subject.events(self.kind())
    }
}

#[derive(Debug)]
enum Plan {
    Flag {
        sources: Vec<Resolved>,
        window: WindowSpec,
    },
    Date {
        sources: Vec<Resolved>,
        window: WindowSpec,
        direction: Direction,
        policy: CombinePolicy,
    },
    Category {
        source: Resolved,
        window: WindowSpec,
        direction: Direction,
    },
    Status {
        source: Resolved,
        ever: Arc<CodeSet>,
        window: WindowSpec,
        rule: StatusRule,
    },
    Count {
        sources: Vec<Resolved>,
        window: WindowSpec,
        cap: Option<i64>,
    },
    Escalation {
        anchor: String,
        sources: Vec<Resolved>,
        within_days: i64,
        labels: EscalationLabels,
    },
    Alive {
        at: Anchor,
    },
    DeathDate,
}

#[derive(Debug)]
struct Compiled {
    name: String,
    plan: Plan,
}

/// Compiled, immutable variable table
#[derive(Debug)]
pub struct Deriver {
    variables: Vec<Compiled>,
}

fn resolve_codes(codes: &CodeRef, library: &CodeLibrary) -> Result<Arc<CodeSet>> {
    let lookup = |name: &str| {
        library
            .get(name)
            .cloned()
            .ok_or_else(|| Error::Config(format!("Unknown code set '{}'", name)))
    };

    let names = codes.names();
    let (first, rest) = names
        .split_first()
        .ok_or_else(|| Error::Config("Empty code set reference".to_string()))?;

    let mut merged = lookup(*first)?;
    for name in rest {
        let next = lookup(*name)?;
        merged = Arc::new(merged.union(&next));
    }
    Ok(merged)
}

fn resolve_source(spec: &SourceSpec, library: &CodeLibrary) -> Result<Resolved> {
    let mut codes = resolve_codes(&spec.codes, library)?;
    if let Some(categories) = &spec.categories {
        codes = Arc::new(codes.filter_categories(&categories[..]));
    }
    Ok(Resolved {
        adapter: spec.source.adapter(),
        codes,
    })
}

fn resolve_sources(specs: &[SourceSpec], library: &CodeLibrary) -> Result<Vec<Resolved>> {
    specs.iter().map(|s| resolve_source(s, library)).collect()
}

impl Deriver {
    /// Validate `table` against `library` and compile it
    pub fn new(table: &VariableTable, library: &CodeLibrary) -> Result<Self> {
        table.check(library)?;

        let mut variables = Vec::with_capacity(table.variables.len());
        for var in &table.variables {
            let plan = match &var.kind {
                VariableKind::Flag { sources, window } => Plan::Flag {
                    sources: resolve_sources(sources, library)?,
                    window: window.clone(),
                },
                VariableKind::Date {
                    sources,
                    window,
                    direction,
                    policy,
                } => Plan::Date {
                    sources: resolve_sources(sources, library)?,
                    window: window.clone(),
                    direction: *direction,
                    policy: *policy,
                },
                VariableKind::Category {
                    source,
                    window,
                    direction,
                } => Plan::Category {
                    source: resolve_source(source, library)?,
                    window: window.clone(),
                    direction: *direction,
                },
                VariableKind::Status {
                    source,
                    window,
                    rule,
                } => {
                    let source = resolve_source(source, library)?;
                    let ever = Arc::new(source.codes.filter_categories(&rule.ever_labels()[..]));
                    Plan::Status {
                        source,
                        ever,
                        window: window.clone(),
                        rule: rule.clone(),
                    }
                }
                VariableKind::Count {
                    sources,
                    window,
                    cap,
                } => Plan::Count {
                    sources: resolve_sources(sources, library)?,
                    window: window.clone(),
                    cap: *cap,
                },
                VariableKind::Escalation {
                    anchor,
                    sources,
                    within_days,
                    labels,
                } => Plan::Escalation {
                    anchor: anchor.clone(),
                    sources: resolve_sources(sources, library)?,
                    within_days: *within_days,
                    labels: labels.clone(),
                },
                VariableKind::Alive { at } => Plan::Alive { at: at.clone() },
                VariableKind::DeathDate => Plan::DeathDate,
            };
            variables.push(Compiled {
                name: var.name.clone(),
                plan,
            });
        }

        tracing::info!("Compiled {} variables", variables.len());
        Ok(Self { variables })
    }

    /// Variable names in output order
    pub fn names(&self) -> Vec<&str> {
        self.variables.iter().map(|v| v.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.variables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }

    /// Derive every variable for one subject
    pub fn derive(&self, subject: &Subject, dates: &IndexDates) -> Derivation {
        let mut row = DerivedRow::new(subject.id.clone());
        let mut issues = Vec::new();

        for var in &self.variables {
            let mut eval = Evaluation {
                subject,
                dates,
                row: &row,
                variable: &var.name,
                issues: &mut issues,
            };
            let value = eval.evaluate(&var.plan);
            if let Value::Failed(reason) = &value {
                tracing::debug!("Subject {}: {} failed: {}", subject.id, var.name, reason);
                issues.push(Issue {
                    variable: var.name.clone(),
                    kind: IssueKind::Failed {
                        reason: reason.clone(),
                    },
                });
            }
            row.push(var.name.clone(), value);
        }

        Derivation { row, issues }
    }

    /// Two-date form: index plus a single end date
    pub fn derive_between(
        &self,
        subject: &Subject,
        index: NaiveDate,
        end: Option<NaiveDate>,
    ) -> Derivation {
        self.derive(subject, &IndexDates::new(index, end))
    }

    /// A row in which every variable failed for the same reason
    pub fn failed(&self, subject_id: &str, reason: &str) -> Derivation {
        let mut row = DerivedRow::new(subject_id);
        let mut issues = Vec::with_capacity(self.variables.len());
        for var in &self.variables {
            row.push(var.name.clone(), Value::Failed(reason.to_string()));
            issues.push(Issue {
                variable: var.name.clone(),
                kind: IssueKind::Failed {
                    reason: reason.to_string(),
                },
            });
        }
        Derivation { row, issues }
    }
}

// ============================================================================
// Evaluation
// ============================================================================

/// A resolved window bound
enum Bound {
    At(Option<NaiveDate>),
    /// Anchored on a variable with no value
    Unresolvable,
}

fn shift(date: NaiveDate, offset_days: i64) -> Result<NaiveDate> {
    let days = Days::new(offset_days.unsigned_abs());
    let shifted = if offset_days >= 0 {
        date.checked_add_days(days)
    } else {
        date.checked_sub_days(days)
    };
    shifted.ok_or_else(|| {
        Error::Derivation(format!("{} shifted by {} days is out of range", date, offset_days))
    })
}

fn failed(err: Error) -> Value {
    Value::Failed(err.to_string())
}

struct Evaluation<'a> {
    subject: &'a Subject,
    dates: &'a IndexDates,
    row: &'a DerivedRow,
    variable: &'a str,
    issues: &'a mut Vec<Issue>,
}

impl Evaluation<'_> {
    fn evaluate(&mut self, plan: &Plan) -> Value {
        match plan {
            Plan::Flag { sources, window } => match self.window(window) {
                Ok(Some(window)) => self.flag(sources, &window).unwrap_or_else(failed),
                Ok(None) => Value::Flag(false),
                Err(e) => failed(e),
            },
            Plan::Date {
                sources,
                window,
                direction,
                policy,
            } => match self.window(window) {
                Ok(Some(window)) => self
                    .date(sources, &window, *direction, *policy)
                    .unwrap_or_else(failed),
                Ok(None) => Value::Date(None),
                Err(e) => failed(e),
            },
            Plan::Category {
                source,
                window,
                direction,
            } => match self.window(window) {
                Ok(Some(window)) => self
                    .category(source, &window, *direction)
                    .unwrap_or_else(failed),
                Ok(None) => Value::Category(None),
                Err(e) => failed(e),
            },
            Plan::Status {
                source,
                ever,
                window,
                rule,
            } => match self.window(window) {
                Ok(Some(window)) => self
                    .status(source, ever, &window, rule)
                    .unwrap_or_else(failed),
                Ok(None) => Value::Category(Some(rule.missing.clone())),
                Err(e) => failed(e),
            },
            Plan::Count {
                sources,
                window,
                cap,
            } => match self.window(window) {
                Ok(Some(window)) => self.count(sources, &window, *cap).unwrap_or_else(failed),
                Ok(None) => Value::Integer(Some(0)),
                Err(e) => failed(e),
            },
            Plan::Escalation {
                anchor,
                sources,
                within_days,
                labels,
            } => self
                .escalation(anchor, sources, *within_days, labels)
                .unwrap_or_else(failed),
            Plan::Alive { at } => self.alive(at).unwrap_or_else(failed),
            Plan::DeathDate => self.death_date().map(Value::Date).unwrap_or_else(failed),
        }
    }

    fn anchor(&self, anchor: &Anchor) -> Result<Bound> {
        let bound = match anchor {
            Anchor::Unbounded => Bound::At(None),
            Anchor::Index { offset_days } => Bound::At(Some(shift(self.dates.index, *offset_days)?)),
            Anchor::End { offset_days } => match self.dates.end {
                Some(end) => Bound::At(Some(shift(end, *offset_days)?)),
                None => Bound::At(None),
            },
            Anchor::ExposureEnd { offset_days } => match self.dates.exposure_end_or_end() {
                Some(end) => Bound::At(Some(shift(end, *offset_days)?)),
                None => Bound::At(None),
            },
            Anchor::Date { date } => Bound::At(Some(*date)),
            Anchor::Variable { name, offset_days } => match self.earlier_date(name)? {
                Some(date) => Bound::At(Some(shift(date, *offset_days)?)),
                None => Bound::Unresolvable,
            },
        };
        Ok(bound)
    }

    /// Value of an earlier date variable
    fn earlier_date(&self, name: &str) -> Result<Option<NaiveDate>> {
        match self.row.get(name) {
            Some(Value::Date(date)) => Ok(*date),
            Some(Value::Failed(reason)) => Err(Error::Derivation(format!(
                "anchor '{}' failed: {}",
                name, reason
            ))),
            Some(_) => Err(Error::Derivation(format!("anchor '{}' is not a date", name))),
            None => Err(Error::Derivation(format!("anchor '{}' is not derived", name))),
        }
    }

    /// Resolve a window; `Ok(None)` when an anchor is unresolvable
    fn window(&mut self, spec: &WindowSpec) -> Result<Option<Window>> {
        let (start, end) = match (self.anchor(&spec.start)?, self.anchor(&spec.end)?) {
            (Bound::At(start), Bound::At(end)) => (start, end),
            _ => return Ok(None),
        };
        let window = Window::new(start, end);
        self.check_window(&window);
        Ok(Some(window))
    }

    fn check_window(&mut self, window: &Window) {
        if window.is_degenerate() {
            tracing::warn!(
                "Subject {}: {} has degenerate window {}",
                self.subject.id,
                self.variable,
                window
            );
            self.issues.push(Issue {
                variable: self.variable.to_string(),
                kind: IssueKind::DegenerateWindow {
                    start: window.start,
                    end: window.end,
                },
            });
        }
    }

    fn flag(&self, sources: &[Resolved], window: &Window) -> Result<Value> {
        let mut found = false;
        // every source is read so an unreadable one fails the flag
        for source in sources {
            let events = source.events(self.subject)?;
            found |= exists(&source.codes, source.adapter.as_ref(), events, window);
        }
        Ok(Value::Flag(found))
    }

    fn date(
        &self,
        sources: &[Resolved],
        window: &Window,
        direction: Direction,
        policy: CombinePolicy,
    ) -> Result<Value> {
        let mut candidates = Vec::with_capacity(sources.len());
        for source in sources {
            let events = source.events(self.subject)?;
            let event = find_event(&source.codes, source.adapter.as_ref(), events, window, direction);
            candidates.push(event.and_then(|e| e.date));
        }
        Ok(Value::Date(combine(candidates, policy)))
    }

    fn category(&self, source: &Resolved, window: &Window, direction: Direction) -> Result<Value> {
        let events = source.events(self.subject)?;
        let event = find_event(&source.codes, source.adapter.as_ref(), events, window, direction);
        Ok(Value::Category(categorize_from(
            event,
            source.adapter.as_ref(),
            &source.codes,
        )))
    }

    fn status(
        &self,
        source: &Resolved,
        ever: &CodeSet,
        window: &Window,
        rule: &StatusRule,
    ) -> Result<Value> {
        let events = source.events(self.subject)?;
        let adapter = source.adapter.as_ref();
        let latest = find_event(&source.codes, adapter, events, window, Direction::Last);
        let latest_category = categorize_from(latest, adapter, &source.codes);
        let ever_matched = exists(ever, adapter, events, window);
        Ok(Value::Category(Some(classify_with_history(
            latest_category.as_deref(),
            ever_matched,
            rule,
        ))))
    }

    fn count(&self, sources: &[Resolved], window: &Window, cap: Option<i64>) -> Result<Value> {
        let mut total = 0usize;
        for source in sources {
            let events = source.events(self.subject)?;
            total += count(&source.codes, source.adapter.as_ref(), events, window);
        }
        let total = i64::try_from(total).unwrap_or(i64::MAX);
        Ok(Value::Integer(Some(cap.map_or(total, |cap| total.min(cap)))))
    }

    fn escalation(
        &mut self,
        anchor: &str,
        sources: &[Resolved],
        within_days: i64,
        labels: &EscalationLabels,
    ) -> Result<Value> {
        let Some(start) = self.earlier_date(anchor)? else {
            return Ok(Value::Category(Some(labels.no_anchor.clone())));
        };
        let window = Window::between(start, shift(start, within_days)?);
        self.check_window(&window);

        let mut escalated = false;
        for source in sources {
            let events = source.events(self.subject)?;
            escalated |= exists(&source.codes, source.adapter.as_ref(), events, &window);
        }
        let label = if escalated {
            &labels.escalated
        } else {
            &labels.not_escalated
        };
        Ok(Value::Category(Some(label.clone())))
    }

    /// Earliest of the demographic death date and any registered death
    fn death_date(&self) -> Result<Option<NaiveDate>> {
        let registered = self
            .subject
            .events(SourceKind::Death)?
            .iter()
            .filter_map(|e| e.date)
            .min();
        Ok(combine(
            [self.subject.demographics.date_of_death, registered],
            CombinePolicy::Earliest,
        ))
    }

    fn alive(&self, at: &Anchor) -> Result<Value> {
        let at = match self.anchor(at)? {
            Bound::At(at) => at,
            Bound::Unresolvable => return Ok(Value::Flag(false)),
        };
        let alive = match (self.death_date()?, at) {
            (None, _) => true,
            (Some(died), Some(at)) => died > at,
            // open-ended: any recorded death counts
            (Some(_), None) => false,
        };
        Ok(Value::Flag(alive))
    }
}
