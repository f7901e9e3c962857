//! Output sinks for derived rows and batch reports.
//!
//! Rows go to a wide CSV or to JSON Lines. Reports are appended as JSON
//! Lines under an exclusive file lock so concurrent runs can share one
//! report file.

use crate::{BatchReport, DerivedRow, Result, Value};
use fs2::FileExt;
use serde_json::{json, Map};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Destination for derived rows
pub trait RowSink {
    /// Write all rows; `names` fixes the column order
    fn write_rows(&mut self, names: &[&str], rows: &[DerivedRow]) -> Result<usize>;
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

/// Open `path` for rewriting. The file is truncated only once the
/// exclusive lock is held.
fn open_for_rewrite(path: &Path) -> Result<File> {
    ensure_parent_dir(path)?;
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path)?;
    file.lock_exclusive()?;
    file.set_len(0)?;
    Ok(file)
}

/// Wide CSV: `patient_id` then one column per variable
pub struct CsvSink {
    path: PathBuf,
}

impl CsvSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl RowSink for CsvSink {
    fn write_rows(&mut self, names: &[&str], rows: &[DerivedRow]) -> Result<usize> {
        let file = open_for_rewrite(&self.path)?;
        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);

        let mut header = Vec::with_capacity(names.len() + 1);
        header.push("patient_id");
        header.extend_from_slice(names);
        writer.write_record(&header)?;

        for row in rows {
            let mut record = Vec::with_capacity(names.len() + 1);
            record.push(row.subject_id.clone());
            record.extend(
                names
                    .iter()
                    .map(|name| row.get(name).map(Value::to_field).unwrap_or_default()),
            );
            writer.write_record(&record)?;
        }

        // Flush and sync to disk
        writer.flush()?;
        let file = writer
            .into_inner()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
        file.sync_all()?;
        file.unlock()?;

        tracing::info!("Wrote {} rows to {:?}", rows.len(), self.path);
        Ok(rows.len())
    }
}

/// Plain JSON form of a value; failures become `{"failed": reason}`
pub fn value_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Date(date) => json!(date.map(|d| d.format("%Y-%m-%d").to_string())),
        Value::Flag(flag) => json!(flag),
        Value::Category(category) => json!(category),
        Value::Integer(n) => json!(n),
        Value::Failed(reason) => json!({ "failed": reason }),
    }
}

/// One JSON object per subject
pub struct JsonlSink {
    path: PathBuf,
}

impl JsonlSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl RowSink for JsonlSink {
    fn write_rows(&mut self, names: &[&str], rows: &[DerivedRow]) -> Result<usize> {
        let file = open_for_rewrite(&self.path)?;

        let mut writer = BufWriter::new(&file);
        for row in rows {
            let mut object = Map::new();
            object.insert("patient_id".into(), json!(row.subject_id));
            for name in names {
                let value = row.get(name).map(value_to_json).unwrap_or(serde_json::Value::Null);
                object.insert((*name).to_string(), value);
            }
            serde_json::to_writer(&mut writer, &object)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        drop(writer);

        file.unlock()?;
        tracing::info!("Wrote {} rows to {:?}", rows.len(), self.path);
        Ok(rows.len())
    }
}

/// Append a batch report as one JSON line
pub fn write_report(path: &Path, report: &BatchReport) -> Result<()> {
    ensure_parent_dir(path)?;

    let file = OpenOptions::new().create(true).append(true).open(path)?;
    file.lock_exclusive()?;

    let mut writer = BufWriter::new(&file);
    let line = serde_json::to_string(report)?;
    writer.write_all(line.as_bytes())?;
    writer.write_all(b"\n")?;
    writer.flush()?;
    drop(writer);

    file.unlock()?;
    tracing::debug!("Appended report {} to {:?}", report.run_id, path);
    Ok(())
}

/// Read every report in a report file; unparseable lines are skipped
pub fn read_reports(path: &Path) -> Result<Vec<BatchReport>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let file = File::open(path)?;
    file.lock_shared()?;

    let reader = BufReader::new(&file);
    let mut reports = Vec::new();
    for (line_num, line_result) in reader.lines().enumerate() {
        let line = line_result?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<BatchReport>(&line) {
            Ok(report) => reports.push(report),
            Err(e) => {
                tracing::warn!("Failed to parse report at line {}: {}", line_num + 1, e);
            }
        }
    }

    file.unlock()?;
    Ok(reports)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Utc};
    use std::fs;
    use uuid::Uuid;

    fn rows() -> Vec<DerivedRow> {
        let mut one = DerivedRow::new("1");
        one.push("out_date_ami", Value::Date(NaiveDate::from_ymd_opt(2021, 3, 1)));
        one.push("cov_bin_ami", Value::Flag(true));
        one.push("cov_cat_smoking", Value::Category(Some("E".into())));

        let mut two = DerivedRow::new("2");
        two.push("out_date_ami", Value::Date(None));
        two.push("cov_bin_ami", Value::Failed("Source hospital unavailable".into()));
        two.push("cov_cat_smoking", Value::Category(Some("M".into())));
        vec![one, two]
    }

    const NAMES: [&str; 3] = ["out_date_ami", "cov_bin_ami", "cov_cat_smoking"];

    fn report() -> BatchReport {
        BatchReport {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            cohort: Some("vax".into()),
            subjects: 2,
            failed_subjects: 0,
            failed_values: 0,
            degenerate_windows: 0,
            entries: Vec::new(),
        }
    }

    #[test]
    fn test_csv_sink() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("out/input_vax.csv");

        let written = CsvSink::new(&path).write_rows(&NAMES, &rows()).unwrap();
        assert_eq!(written, 2);

        let contents = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines[0], "patient_id,out_date_ami,cov_bin_ami,cov_cat_smoking");
        assert_eq!(lines[1], "1,2021-03-01,T,E");
        assert_eq!(lines[2], "2,,!failed,M");
    }

    #[test]
    fn test_csv_sink_overwrites() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("out.csv");
        CsvSink::new(&path).write_rows(&NAMES, &rows()).unwrap();
        CsvSink::new(&path).write_rows(&NAMES, &rows()[..1]).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap().lines().count(), 2);
    }

    #[test]
    fn test_jsonl_sink() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("out.jsonl");

        JsonlSink::new(&path).write_rows(&NAMES, &rows()).unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        let parsed: Vec<serde_json::Value> = contents
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0]["patient_id"], "1");
        assert_eq!(parsed[0]["out_date_ami"], "2021-03-01");
        assert_eq!(parsed[0]["cov_bin_ami"], true);
        assert!(parsed[1]["out_date_ami"].is_null());
        assert_eq!(parsed[1]["cov_bin_ami"]["failed"], "Source hospital unavailable");
    }

    #[test]
    fn test_jsonl_sink_waits_for_lock_before_truncating() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("out.jsonl");
        fs::write(&path, "previous run\nwith more lines\nthan the next one\n").unwrap();

        let holder = File::open(&path).unwrap();
        holder.lock_exclusive().unwrap();

        let writer_path = path.clone();
        let handle = std::thread::spawn(move || {
            JsonlSink::new(&writer_path).write_rows(&NAMES, &rows()[..1]).unwrap()
        });
        std::thread::sleep(std::time::Duration::from_millis(100));
        assert_eq!(fs::read_to_string(&path).unwrap().lines().count(), 3);

        holder.unlock().unwrap();
        assert_eq!(handle.join().unwrap(), 1);

        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 1);
        let row: serde_json::Value = serde_json::from_str(contents.trim()).unwrap();
        assert_eq!(row["patient_id"], "1");
    }

    #[test]
    fn test_reports_append() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("reports.jsonl");

        let first = report();
        let second = report();
        write_report(&path, &first).unwrap();
        write_report(&path, &second).unwrap();

        let reports = read_reports(&path).unwrap();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].run_id, first.run_id);
        assert_eq!(reports[1].run_id, second.run_id);
        assert_eq!(reports[1].cohort.as_deref(), Some("vax"));
    }

    #[test]
    fn test_read_reports_skips_bad_lines() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("reports.jsonl");
        write_report(&path, &report()).unwrap();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "{{not json").unwrap();
        write_report(&path, &report()).unwrap();

        assert_eq!(read_reports(&path).unwrap().len(), 2);
        assert!(read_reports(&temp_dir.path().join("missing.jsonl")).unwrap().is_empty());
    }
}
