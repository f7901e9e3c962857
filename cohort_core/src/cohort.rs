//! Cohort regimes and per-subject derivation dates.

use crate::{Error, Result, SubjectId};
use chrono::NaiveDate;
use csv::ReaderBuilder;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Dates a derivation is evaluated against
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDates {
    pub index: NaiveDate,
    /// Outcome end; `None` leaves follow-up open
    pub end: Option<NaiveDate>,
    /// Exposure end; falls back to `end`
    pub exposure_end: Option<NaiveDate>,
}

impl IndexDates {
    pub fn new(index: NaiveDate, end: Option<NaiveDate>) -> Self {
        Self {
            index,
            end,
            exposure_end: None,
        }
    }

    pub fn with_exposure_end(mut self, exposure_end: Option<NaiveDate>) -> Self {
        self.exposure_end = exposure_end;
        self
    }

    pub fn exposure_end_or_end(&self) -> Option<NaiveDate> {
        self.exposure_end.or(self.end)
    }
}

/// A named regime with fixed study dates
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CohortConfig {
    pub name: String,
    pub index_date: NaiveDate,
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
    #[serde(default)]
    pub exposure_end_date: Option<NaiveDate>,
}

impl CohortConfig {
    pub fn dates(&self) -> IndexDates {
        IndexDates::new(self.index_date, self.end_date).with_exposure_end(self.exposure_end_date)
    }
}

fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap_or_default()
}

/// Pre-vaccination, vaccinated and unvaccinated regimes
pub fn default_cohorts() -> Vec<CohortConfig> {
    let delta_end = ymd(2021, 12, 14);
    vec![
        CohortConfig {
            name: "prevax".into(),
            index_date: ymd(2020, 1, 1),
            end_date: Some(delta_end),
            exposure_end_date: Some(ymd(2021, 6, 18)),
        },
        CohortConfig {
            name: "vax".into(),
            index_date: ymd(2021, 6, 1),
            end_date: Some(delta_end),
            exposure_end_date: Some(delta_end),
        },
        CohortConfig {
            name: "unvax".into(),
            index_date: ymd(2021, 6, 1),
            end_date: Some(delta_end),
            exposure_end_date: Some(delta_end),
        },
    ]
}

/// Find a cohort by name
pub fn find_cohort<'a>(cohorts: &'a [CohortConfig], name: &str) -> Result<&'a CohortConfig> {
    cohorts.iter().find(|c| c.name == name).ok_or_else(|| {
        let known: Vec<&str> = cohorts.iter().map(|c| c.name.as_str()).collect();
        Error::Config(format!(
            "Unknown cohort '{}' (known: {})",
            name,
            known.join(", ")
        ))
    })
}

pub(crate) fn parse_date(field: &str, value: &str) -> Result<Option<NaiveDate>> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(None);
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map(Some)
        .map_err(|e| Error::Record(format!("Invalid {} '{}': {}", field, value, e)))
}

/// Load per-subject dates for one cohort from a wide index-dates CSV.
///
/// Columns: `patient_id, index_<c>, end_<c>_exposure, end_<c>_outcome`.
/// Subjects with a null index date are not in the cohort and are skipped.
pub fn load_index_dates(path: &Path, cohort: &str) -> Result<Vec<(SubjectId, IndexDates)>> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)?;

    let headers = reader.headers()?.clone();
    let column = |name: &str| -> Result<usize> {
        headers.iter().position(|h| h.trim() == name).ok_or_else(|| {
            Error::Config(format!("Column '{}' not found in {:?}", name, path))
        })
    };
    let id_col = column("patient_id")?;
    let index_col = column(&format!("index_{}", cohort))?;
    let exposure_col = column(&format!("end_{}_exposure", cohort))?;
    let outcome_col = column(&format!("end_{}_outcome", cohort))?;

    let mut dates = Vec::new();
    let mut excluded = 0usize;
    let mut seen: HashMap<String, usize> = HashMap::new();

    for (line, record) in reader.records().enumerate() {
        let record = record?;
        let field = |i: usize| record.get(i).unwrap_or("");
        let id = field(id_col).trim();
        if id.is_empty() {
            tracing::warn!("Skipping index-dates row {} without patient_id", line + 2);
            continue;
        }
        let Some(index) = parse_date("index date", field(index_col))? else {
            excluded += 1;
            continue;
        };
        let end = parse_date("outcome end date", field(outcome_col))?;
        let exposure_end = parse_date("exposure end date", field(exposure_col))?;

        if let Some(prev) = seen.insert(id.to_string(), line) {
            return Err(Error::Record(format!(
                "Patient '{}' appears twice in {:?} (rows {} and {})",
                id,
                path,
                prev + 2,
                line + 2
            )));
        }
        dates.push((
            id.to_string(),
            IndexDates::new(index, end).with_exposure_end(exposure_end),
        ));
    }

    tracing::info!(
        "Loaded {} '{}' index dates from {:?} ({} without index excluded)",
        dates.len(),
        cohort,
        path,
        excluded
    );
    Ok(dates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn test_default_cohorts() {
        let cohorts = default_cohorts();
        let names: Vec<&str> = cohorts.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["prevax", "vax", "unvax"]);

        let prevax = find_cohort(&cohorts, "prevax").unwrap().dates();
        assert_eq!(prevax.index, d("2020-01-01"));
        assert!(prevax.exposure_end_or_end() < prevax.end);
        assert!(find_cohort(&cohorts, "boosted").is_err());
    }

    #[test]
    fn test_exposure_end_falls_back() {
        let dates = IndexDates::new(d("2021-01-01"), Some(d("2021-12-31")));
        assert_eq!(dates.exposure_end_or_end(), Some(d("2021-12-31")));
        let dates = dates.with_exposure_end(Some(d("2021-06-30")));
        assert_eq!(dates.exposure_end_or_end(), Some(d("2021-06-30")));
    }

    #[test]
    fn test_load_index_dates() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("index_dates.csv");
        fs::write(
            &path,
            "patient_id,index_prevax,end_prevax_exposure,end_prevax_outcome,index_vax,end_vax_exposure,end_vax_outcome\n\
             1,2020-01-01,2021-06-18,2021-12-14,,,\n\
             2,,,,2021-06-01,2021-12-14,2021-12-14\n\
             3,2020-01-01,,2021-03-01,2021-06-01,,\n",
        )
        .unwrap();

        let prevax = load_index_dates(&path, "prevax").unwrap();
        assert_eq!(prevax.len(), 2);
        assert_eq!(prevax[0].0, "1");
        assert_eq!(prevax[0].1.exposure_end, Some(d("2021-06-18")));
        assert_eq!(prevax[1].1.exposure_end_or_end(), Some(d("2021-03-01")));

        let vax = load_index_dates(&path, "vax").unwrap();
        let ids: Vec<&str> = vax.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["2", "3"]);
        assert_eq!(vax[1].1.end, None);

        assert!(load_index_dates(&path, "unvax").is_err());
    }

    #[test]
    fn test_load_index_dates_bad_date() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("index_dates.csv");
        fs::write(
            &path,
            "patient_id,index_vax,end_vax_exposure,end_vax_outcome\n1,01/06/2021,,\n",
        )
        .unwrap();
        assert!(matches!(load_index_dates(&path, "vax"), Err(Error::Record(_))));
    }
}
