//! Parallel batch derivation over a record store.

use crate::derive::{Derivation, Issue, IssueKind};
use crate::{DerivedRow, Deriver, Error, IndexDates, RecordStore, Result, SubjectId};
use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One issue tagged with its subject
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportEntry {
    pub subject_id: SubjectId,
    #[serde(flatten)]
    pub issue: Issue,
}

/// Summary of one batch run
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BatchReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(default)]
    pub cohort: Option<String>,
    pub subjects: usize,
    /// Subjects with at least one failed value
    pub failed_subjects: usize,
    pub failed_values: usize,
    pub degenerate_windows: usize,
    pub entries: Vec<ReportEntry>,
}

pub struct BatchOutput {
    /// Sorted by subject id
    pub rows: Vec<DerivedRow>,
    pub report: BatchReport,
}

/// Derive every `(subject, dates)` pair of `plan`.
///
/// Subjects are independent; a subject the store cannot produce gets a row
/// of failed values and the batch carries on. `threads == 0` uses rayon's
/// default pool size.
pub fn run_batch(
    store: &dyn RecordStore,
    deriver: &Deriver,
    plan: &[(SubjectId, IndexDates)],
    threads: usize,
) -> Result<BatchOutput> {
    let started_at = Utc::now();
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build()
        .map_err(|e| Error::Other(format!("Failed to build thread pool: {}", e)))?;

    tracing::info!(
        "Deriving {} variables for {} subjects on {} threads",
        deriver.len(),
        plan.len(),
        pool.current_num_threads()
    );

    let mut derivations: Vec<Derivation> = pool.install(|| {
        plan.par_iter()
            .map(|(id, dates)| match store.subject(id) {
                Ok(subject) => deriver.derive(&subject, dates),
                Err(e) => {
                    tracing::warn!("Subject {}: {}", id, e);
                    deriver.failed(id, &e.to_string())
                }
            })
            .collect()
    });
    derivations.sort_by(|a, b| a.row.subject_id.cmp(&b.row.subject_id));

    let mut rows = Vec::with_capacity(derivations.len());
    let mut entries = Vec::new();
    let mut failed_subjects = 0;
    for derivation in derivations {
        if derivation.has_failures() {
            failed_subjects += 1;
        }
        entries.extend(derivation.issues.into_iter().map(|issue| ReportEntry {
            subject_id: derivation.row.subject_id.clone(),
            issue,
        }));
        rows.push(derivation.row);
    }

    let failed_values = entries
        .iter()
        .filter(|e| matches!(e.issue.kind, IssueKind::Failed { .. }))
        .count();
    let degenerate_windows = entries.len() - failed_values;

    let report = BatchReport {
        run_id: Uuid::new_v4(),
        started_at,
        finished_at: Utc::now(),
        cohort: None,
        subjects: rows.len(),
        failed_subjects,
        failed_values,
        degenerate_windows,
        entries,
    };

    tracing::info!(
        "Derived {} subjects ({} with failures, {} degenerate windows)",
        report.subjects,
        report.failed_subjects,
        report.degenerate_windows
    );

    Ok(BatchOutput { rows, report })
}

/// Plan that evaluates every subject in the store on the same dates
pub fn plan_for_all(store: &dyn RecordStore, dates: IndexDates) -> Vec<(SubjectId, IndexDates)> {
    store
        .subject_ids()
        .into_iter()
        .map(|id| (id, dates))
        .collect()
}
