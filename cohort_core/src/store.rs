//! Record store: subjects and their per-source event lists.
//!
//! `MemoryStore::load_dir` reads one CSV per source from a directory. Every
//! file is optional. A row that cannot be decoded or converted marks that source
//! unreadable for the row's subject; other subjects are unaffected.

use crate::cohort::parse_date;
use crate::{CodeField, Demographics, Error, Event, Result, SourceKind, Subject, SubjectId};
use csv::{ByteRecord, Reader, ReaderBuilder};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;

/// Read access to subjects, shared across batch workers
pub trait RecordStore: Send + Sync {
    /// All subject ids, sorted
    fn subject_ids(&self) -> Vec<SubjectId>;

    fn subject(&self, id: &str) -> Result<Cow<'_, Subject>>;
}

/// In-memory store keyed by subject id
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    subjects: BTreeMap<SubjectId, Subject>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, subject: Subject) {
        self.subjects.insert(subject.id.clone(), subject);
    }

    pub fn with(mut self, subject: Subject) -> Self {
        self.insert(subject);
        self
    }

    pub fn len(&self) -> usize {
        self.subjects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subjects.is_empty()
    }

    fn entry(&mut self, id: &str) -> &mut Subject {
        self.subjects
            .entry(id.to_string())
            .or_insert_with(|| Subject::new(id))
    }

    /// Load every known record file present in `dir`
    pub fn load_dir(dir: &Path) -> Result<Self> {
        if !dir.is_dir() {
            return Err(Error::Config(format!(
                "Record directory {:?} does not exist",
                dir
            )));
        }

        let mut store = Self::new();
        store.load_patients(&dir.join(PATIENTS_FILE))?;
        store.load_source::<ClinicalEventRow>(dir)?;
        store.load_source::<AdmissionRow>(dir)?;
        store.load_source::<DeathRow>(dir)?;
        store.load_source::<LabTestRow>(dir)?;
        store.load_source::<MedicationRow>(dir)?;

        tracing::info!("Loaded {} subjects from {:?}", store.len(), dir);
        Ok(store)
    }

    fn load_patients(&mut self, path: &Path) -> Result<()> {
        if !path.exists() {
            tracing::debug!("No {:?}, demographics left empty", path);
            return Ok(());
        }
        let (mut reader, headers, id_column) = open_records(path, PATIENTS_FILE)?;

        let mut loaded = 0;
        for (line, result) in reader.byte_records().enumerate() {
            let Some((id, record)) = subject_row(result, id_column, PATIENTS_FILE, line) else {
                continue;
            };

            let row = match record.deserialize::<PatientRow>(Some(&headers)) {
                Ok(row) => row,
                Err(e) => {
                    // death date unknown: anything reading deaths must fail
                    tracing::warn!("Patient {}: {} row {} unreadable: {}", id, PATIENTS_FILE, line + 2, e);
                    self.entry(&id).mark_unreadable(
                        SourceKind::Death,
                        format!("{} row {}: {}", PATIENTS_FILE, line + 2, e),
                    );
                    continue;
                }
            };

            let date_of_birth = parse_date("date_of_birth", &row.date_of_birth).unwrap_or_else(|e| {
                tracing::warn!("Patient {}: {}", id, e);
                None
            });
            let subject = self.entry(&id);
            subject.demographics = Demographics {
                date_of_birth,
                sex: non_blank(&row.sex).map(str::to_string),
                date_of_death: None,
            };
            match parse_date("date_of_death", &row.date_of_death) {
                Ok(date) => subject.demographics.date_of_death = date,
                Err(e) => {
                    tracing::warn!("Patient {}: {}", id, e);
                    subject.mark_unreadable(
                        SourceKind::Death,
                        format!("{} row {}: {}", PATIENTS_FILE, line + 2, e),
                    );
                }
            }
            loaded += 1;
        }
        tracing::debug!("Loaded {} patients from {:?}", loaded, path);
        Ok(())
    }

    fn load_source<R: SourceRow>(&mut self, dir: &Path) -> Result<()> {
        let path = dir.join(R::FILE);
        if !path.exists() {
            tracing::debug!("No {:?}, {} source left empty", path, R::KIND);
            return Ok(());
        }
        let (mut reader, headers, id_column) = open_records(&path, R::FILE)?;

        let mut loaded = 0;
        let mut unreadable = 0;
        for (line, result) in reader.byte_records().enumerate() {
            let row_id = line as u64 + 1;
            let Some((id, record)) = subject_row(result, id_column, R::FILE, line) else {
                continue;
            };

            let event = record
                .deserialize::<R>(Some(&headers))
                .map_err(Error::from)
                .and_then(|row| row.into_event(row_id));
            match event {
                Ok(event) => {
                    self.entry(&id).push_event(event);
                    loaded += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        "Patient {}: {} row {} unreadable: {}",
                        id,
                        R::FILE,
                        line + 2,
                        e
                    );
                    self.entry(&id)
                        .mark_unreadable(R::KIND, format!("{} row {}: {}", R::FILE, line + 2, e));
                    unreadable += 1;
                }
            }
        }

        tracing::debug!(
            "Loaded {} {} events from {:?} ({} unreadable rows)",
            loaded,
            R::KIND,
            path,
            unreadable
        );
        Ok(())
    }
}

/// Open a record file as raw rows; the patient id column must exist
fn open_records(path: &Path, file: &str) -> Result<(Reader<File>, ByteRecord, usize)> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)?;
    let headers = reader.byte_headers()?.clone();
    let id_column = headers
        .iter()
        .position(|h| String::from_utf8_lossy(h).trim() == "patient_id")
        .ok_or_else(|| Error::Record(format!("{} has no 'patient_id' column", file)))?;
    Ok((reader, headers, id_column))
}

/// The row's subject id, recovered even when other fields do not decode.
/// Rows without a usable id are skipped.
fn subject_row(
    result: csv::Result<ByteRecord>,
    id_column: usize,
    file: &str,
    line: usize,
) -> Option<(SubjectId, ByteRecord)> {
    let record = match result {
        Ok(record) => record,
        Err(e) => {
            tracing::warn!("Failed to read {} row {}: {}", file, line + 2, e);
            return None;
        }
    };
    let id = record
        .get(id_column)
        .map(|raw| String::from_utf8_lossy(raw).trim().to_string())
        .unwrap_or_default();
    if id.is_empty() {
        tracing::warn!("Skipping {} row {} without patient_id", file, line + 2);
        return None;
    }
    Some((id, record))
}

impl RecordStore for MemoryStore {
    fn subject_ids(&self) -> Vec<SubjectId> {
        self.subjects.keys().cloned().collect()
    }

    fn subject(&self, id: &str) -> Result<Cow<'_, Subject>> {
        self.subjects
            .get(id)
            .map(Cow::Borrowed)
            .ok_or_else(|| Error::UnknownSubject(id.to_string()))
    }
}

// ============================================================================
// Record files
// ============================================================================

pub const PATIENTS_FILE: &str = "patients.csv";
pub const CLINICAL_EVENTS_FILE: &str = "clinical_events.csv";
pub const ADMISSIONS_FILE: &str = "apcs.csv";
pub const DEATHS_FILE: &str = "ons_deaths.csv";
pub const LAB_TESTS_FILE: &str = "lab_tests.csv";
pub const MEDICATIONS_FILE: &str = "medications.csv";

fn non_blank(value: &str) -> Option<&str> {
    let value = value.trim();
    (!value.is_empty()).then_some(value)
}

/// Semicolon-separated code list
fn split_codes(value: &str) -> impl Iterator<Item = &str> {
    value.split(';').filter_map(non_blank)
}

fn parse_flag(field: &str, value: &str) -> Result<Option<bool>> {
    match value.trim().to_ascii_lowercase().as_str() {
        "" => Ok(None),
        "t" | "true" | "1" | "y" | "yes" => Ok(Some(true)),
        "f" | "false" | "0" | "n" | "no" => Ok(Some(false)),
        other => Err(Error::Record(format!("Invalid {} '{}'", field, other))),
    }
}

/// One CSV row of an event source
trait SourceRow: DeserializeOwned {
    const FILE: &'static str;
    const KIND: SourceKind;

    fn into_event(self, row_id: u64) -> Result<Event>;
}

#[derive(Debug, Deserialize)]
struct PatientRow {
    #[serde(default)]
    date_of_birth: String,
    #[serde(default)]
    sex: String,
    #[serde(default)]
    date_of_death: String,
}

#[derive(Debug, Deserialize)]
struct ClinicalEventRow {
    #[serde(default)]
    date: String,
    #[serde(default)]
    snomedct_code: String,
    #[serde(default)]
    ctv3_code: String,
}

impl SourceRow for ClinicalEventRow {
    const FILE: &'static str = CLINICAL_EVENTS_FILE;
    const KIND: SourceKind = SourceKind::PrimaryCare;

    fn into_event(self, row_id: u64) -> Result<Event> {
        let mut event = Event::new(Self::KIND, row_id, parse_date("date", &self.date)?);
        if let Some(code) = non_blank(&self.snomedct_code) {
            event = event.with_code(CodeField::Snomed, code);
        }
        if let Some(code) = non_blank(&self.ctv3_code) {
            event = event.with_code(CodeField::Ctv3, code);
        }
        Ok(event)
    }
}

#[derive(Debug, Deserialize)]
struct AdmissionRow {
    #[serde(default)]
    admission_date: String,
    #[serde(default)]
    primary_diagnosis: String,
    #[serde(default)]
    secondary_diagnosis: String,
    #[serde(default)]
    all_diagnoses: String,
}

impl SourceRow for AdmissionRow {
    const FILE: &'static str = ADMISSIONS_FILE;
    const KIND: SourceKind = SourceKind::Hospital;

    fn into_event(self, row_id: u64) -> Result<Event> {
        let mut event = Event::new(
            Self::KIND,
            row_id,
            parse_date("admission_date", &self.admission_date)?,
        );
        if let Some(code) = non_blank(&self.primary_diagnosis) {
            event = event.with_code(CodeField::PrimaryDiagnosis, code);
        }
        if let Some(code) = non_blank(&self.secondary_diagnosis) {
            event = event.with_code(CodeField::SecondaryDiagnosis, code);
        }
        for code in split_codes(&self.all_diagnoses) {
            event = event.with_code(CodeField::OtherDiagnosis, code);
        }
        Ok(event)
    }
}

#[derive(Debug, Deserialize)]
struct DeathRow {
    #[serde(default)]
    date: String,
    #[serde(default)]
    underlying_cause_of_death: String,
    #[serde(default)]
    cause_of_death: String,
}

impl SourceRow for DeathRow {
    const FILE: &'static str = DEATHS_FILE;
    const KIND: SourceKind = SourceKind::Death;

    fn into_event(self, row_id: u64) -> Result<Event> {
        let mut event = Event::new(Self::KIND, row_id, parse_date("date", &self.date)?);
        if let Some(code) = non_blank(&self.underlying_cause_of_death) {
            event = event.with_code(CodeField::UnderlyingCause, code);
        }
        for code in split_codes(&self.cause_of_death) {
            event = event.with_code(CodeField::ContributingCause, code);
        }
        Ok(event)
    }
}

#[derive(Debug, Deserialize)]
struct LabTestRow {
    #[serde(default)]
    specimen_taken_date: String,
    #[serde(default)]
    test_code: String,
    #[serde(default)]
    is_positive: String,
}

impl SourceRow for LabTestRow {
    const FILE: &'static str = LAB_TESTS_FILE;
    const KIND: SourceKind = SourceKind::Lab;

    fn into_event(self, row_id: u64) -> Result<Event> {
        let mut event = Event::new(
            Self::KIND,
            row_id,
            parse_date("specimen_taken_date", &self.specimen_taken_date)?,
        );
        if let Some(code) = non_blank(&self.test_code) {
            event = event.with_code(CodeField::TestCode, code);
        }
        if let Some(positive) = parse_flag("is_positive", &self.is_positive)? {
            event = event.with_result(positive);
        }
        Ok(event)
    }
}

#[derive(Debug, Deserialize)]
struct MedicationRow {
    #[serde(default)]
    date: String,
    #[serde(default)]
    dmd_code: String,
}

impl SourceRow for MedicationRow {
    const FILE: &'static str = MEDICATIONS_FILE;
    const KIND: SourceKind = SourceKind::Medication;

    fn into_event(self, row_id: u64) -> Result<Event> {
        let mut event = Event::new(Self::KIND, row_id, parse_date("date", &self.date)?);
        if let Some(code) = non_blank(&self.dmd_code) {
            event = event.with_code(CodeField::Dmd, code);
        }
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::fs;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn write(dir: &Path, file: &str, contents: &str) {
        fs::write(dir.join(file), contents).unwrap();
    }

    #[test]
    fn test_load_dir() {
        let temp_dir = tempfile::tempdir().unwrap();
        let dir = temp_dir.path();
        write(
            dir,
            PATIENTS_FILE,
            "patient_id,date_of_birth,sex,date_of_death\n1,1950-02-01,female,\n2,1962-07-15,male,2021-05-01\n",
        );
        write(
            dir,
            CLINICAL_EVENTS_FILE,
            "patient_id,date,snomedct_code,ctv3_code\n1,2021-03-01,22298006,\n1,,,137R.\n",
        );
        write(
            dir,
            ADMISSIONS_FILE,
            "patient_id,admission_date,primary_diagnosis,secondary_diagnosis,all_diagnoses\n1,2021-03-05,I21,U071,I21;I10; E11\n",
        );
        write(
            dir,
            DEATHS_FILE,
            "patient_id,date,underlying_cause_of_death,cause_of_death\n2,2021-05-01,I21,I21;J18\n",
        );
        write(
            dir,
            LAB_TESTS_FILE,
            "patient_id,specimen_taken_date,test_code,is_positive\n3,2020-12-20,covid_test,T\n3,2021-01-02,covid_test,\n",
        );

        let store = MemoryStore::load_dir(dir).unwrap();
        assert_eq!(store.subject_ids(), vec!["1", "2", "3"]);

        let one = store.subject("1").unwrap();
        assert_eq!(one.demographics.sex.as_deref(), Some("female"));
        let gp = one.events(SourceKind::PrimaryCare).unwrap();
        assert_eq!(gp.len(), 2);
        assert_eq!(gp[0].row_id, 1);
        assert_eq!(gp[1].date, None);

        let apc = one.events(SourceKind::Hospital).unwrap();
        let fields: Vec<CodeField> = apc[0].codes.iter().map(|c| c.field).collect();
        assert_eq!(
            fields,
            vec![
                CodeField::PrimaryDiagnosis,
                CodeField::SecondaryDiagnosis,
                CodeField::OtherDiagnosis,
                CodeField::OtherDiagnosis,
                CodeField::OtherDiagnosis,
            ]
        );
        assert_eq!(apc[0].codes[4].code, "E11");
        assert!(one.events(SourceKind::Medication).unwrap().is_empty());

        let two = store.subject("2").unwrap();
        assert_eq!(two.demographics.date_of_death, Some(d("2021-05-01")));
        assert_eq!(two.events(SourceKind::Death).unwrap()[0].codes.len(), 3);

        let three = store.subject("3").unwrap();
        let labs = three.events(SourceKind::Lab).unwrap();
        assert_eq!(labs[0].is_positive, Some(true));
        assert_eq!(labs[1].is_positive, None);
    }

    #[test]
    fn test_bad_row_marks_source_unreadable_for_that_subject() {
        let temp_dir = tempfile::tempdir().unwrap();
        let dir = temp_dir.path();
        write(
            dir,
            ADMISSIONS_FILE,
            "patient_id,admission_date,primary_diagnosis,secondary_diagnosis,all_diagnoses\n\
             1,2021-13-45,I21,,\n\
             2,2021-03-05,I21,,\n\
             ,2021-03-05,I21,,\n",
        );
        write(
            dir,
            CLINICAL_EVENTS_FILE,
            "patient_id,date,snomedct_code,ctv3_code\n1,2021-03-01,22298006,\n",
        );

        let store = MemoryStore::load_dir(dir).unwrap();
        assert_eq!(store.len(), 2);

        let one = store.subject("1").unwrap();
        assert!(matches!(
            one.events(SourceKind::Hospital),
            Err(Error::SourceUnavailable { .. })
        ));
        assert_eq!(one.events(SourceKind::PrimaryCare).unwrap().len(), 1);

        let two = store.subject("2").unwrap();
        assert_eq!(two.events(SourceKind::Hospital).unwrap().len(), 1);
    }

    #[test]
    fn test_undecodable_row_marks_source_unreadable() {
        let temp_dir = tempfile::tempdir().unwrap();
        let dir = temp_dir.path();
        let mut events = b"patient_id,date,snomedct_code,ctv3_code\n".to_vec();
        events.extend_from_slice(b"1,2020-03-01,22298006,X\xff\xfe\n");
        events.extend_from_slice(b"2,2020-03-01,22298006,\n");
        fs::write(dir.join(CLINICAL_EVENTS_FILE), events).unwrap();

        let mut patients = b"patient_id,date_of_birth,sex,date_of_death\n".to_vec();
        patients.extend_from_slice(b"3,1970-01-01,f\xe9minin,\n");
        fs::write(dir.join(PATIENTS_FILE), patients).unwrap();

        let store = MemoryStore::load_dir(dir).unwrap();
        assert_eq!(store.subject_ids(), vec!["1", "2", "3"]);

        let one = store.subject("1").unwrap();
        match one.events(SourceKind::PrimaryCare) {
            Err(Error::SourceUnavailable { reason, .. }) => {
                assert!(reason.contains("clinical_events.csv row 2"), "{}", reason)
            }
            other => panic!("Expected unreadable source, got {:?}", other),
        }
        assert_eq!(store.subject("2").unwrap().events(SourceKind::PrimaryCare).unwrap().len(), 1);

        let three = store.subject("3").unwrap();
        assert!(three.events(SourceKind::Death).is_err());
        assert_eq!(three.events(SourceKind::PrimaryCare).unwrap().len(), 0);
    }

    #[test]
    fn test_missing_patient_id_column() {
        let temp_dir = tempfile::tempdir().unwrap();
        write(temp_dir.path(), MEDICATIONS_FILE, "id,date,dmd_code\n1,2021-01-01,123\n");
        assert!(matches!(
            MemoryStore::load_dir(temp_dir.path()),
            Err(Error::Record(_))
        ));
    }

    #[test]
    fn test_bad_death_date_marks_deaths_unreadable() {
        let temp_dir = tempfile::tempdir().unwrap();
        write(
            temp_dir.path(),
            PATIENTS_FILE,
            "patient_id,date_of_birth,sex,date_of_death\n1,not-a-date,female,sometime\n",
        );
        let store = MemoryStore::load_dir(temp_dir.path()).unwrap();
        let one = store.subject("1").unwrap();
        assert_eq!(one.demographics.date_of_birth, None);
        assert!(one.events(SourceKind::Death).is_err());
    }

    #[test]
    fn test_unknown_subject() {
        let store = MemoryStore::new().with(Subject::new("1"));
        assert!(matches!(store.subject("2"), Err(Error::UnknownSubject(_))));
    }

    #[test]
    fn test_missing_dir() {
        let temp_dir = tempfile::tempdir().unwrap();
        assert!(MemoryStore::load_dir(&temp_dir.path().join("nope")).is_err());
    }

    #[test]
    fn test_parse_flag() {
        assert_eq!(parse_flag("x", "TRUE").unwrap(), Some(true));
        assert_eq!(parse_flag("x", "0").unwrap(), Some(false));
        assert_eq!(parse_flag("x", " ").unwrap(), None);
        assert!(parse_flag("x", "maybe").is_err());
    }
}
