//! Shared fixtures for the CLI tests.

#![allow(dead_code)]

use assert_cmd::Command;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

pub const VARIABLES: &str = r#"
[[variables]]
name = "out_date_ami"
kind = "date"
sources = [
  { source = "primary_care", codes = "ami_snomed" },
  { source = "hospital", codes = "ami_icd10" },
  { source = "death", codes = "ami_icd10" },
]

[[variables]]
name = "cov_bin_ami"
kind = "flag"
sources = [
  { source = "primary_care", codes = "ami_snomed" },
  { source = "hospital", codes = "ami_icd10" },
]

[[variables]]
name = "cov_cat_smoking"
kind = "status"
source = { source = "primary_care", coding = "ctv3", codes = "smoking_clear" }

[[variables]]
name = "exp_date_covid"
kind = "date"
sources = [{ source = "hospital", scope = "primary_or_secondary", codes = "covid_codes" }]
window = { start = { anchor = "index" }, end = { anchor = "exposure_end" } }

[[variables]]
name = "sub_cat_covidhospital"
kind = "escalation"
anchor = "exp_date_covid"
sources = [{ source = "hospital", scope = "primary", codes = "covid_codes" }]
within_days = 28
"#;

/// A data directory with code lists, records, a variable table and an
/// empty config file
pub struct Fixture {
    pub dir: TempDir,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let fixture = Self { dir };

        fixture.write("codelists/ami_snomed.csv", "code,term\n22298006,Myocardial infarction\n");
        fixture.write("codelists/ami_icd10.csv", "code\nI21\nI22\n");
        fixture.write("codelists/covid_codes.csv", "code\nU071\nU072\n");
        fixture.write(
            "codelists/smoking_clear.csv",
            "code,category\n137R.,S\n137S.,E\n137K.,E\n1371.,N\n",
        );
        fixture.write("variables.toml", VARIABLES);
        fixture.write("config.toml", "");

        fixture.write(
            "patients.csv",
            "patient_id,date_of_birth,sex,date_of_death\n\
             1,1950-02-01,female,\n\
             2,1962-07-15,male,\n\
             3,1971-11-30,female,\n",
        );
        fixture.write(
            "clinical_events.csv",
            "patient_id,date,snomedct_code,ctv3_code\n\
             1,2021-03-01,22298006,\n\
             2,2015-04-01,,137R.\n\
             2,2019-06-01,,1371.\n",
        );
        fixture.write(
            "apcs.csv",
            "patient_id,admission_date,primary_diagnosis,secondary_diagnosis,all_diagnoses\n\
             1,2021-03-05,I21,,I21\n\
             3,2021-07-01,J18,U071,J18;U071\n\
             3,2021-07-10,U071,,U071\n",
        );
        fixture
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn join(&self, rel: &str) -> PathBuf {
        self.dir.path().join(rel)
    }

    pub fn write(&self, rel: &str, contents: &str) {
        let path = self.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, contents).unwrap();
    }

    pub fn read(&self, rel: &str) -> String {
        fs::read_to_string(self.join(rel)).unwrap_or_else(|e| panic!("Failed to read {}: {}", rel, e))
    }

    /// CLI command pointed at this fixture's data directory and config
    pub fn cli(&self) -> Command {
        let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("cohortvars"));
        cmd.arg("--data-dir")
            .arg(self.path())
            .arg("--config")
            .arg(self.join("config.toml"))
            .env_remove("RUST_LOG");
        cmd
    }

    /// `derive` over 2021 with the fixture's variable table
    pub fn derive_2021(&self) -> Command {
        let mut cmd = self.cli();
        cmd.arg("derive")
            .arg("--index")
            .arg("2021-01-01")
            .arg("--end")
            .arg("2021-12-31")
            .arg("--variables")
            .arg(self.join("variables.toml"));
        cmd
    }
}

/// Parse a wide CSV into header + rows
pub fn read_csv(contents: &str) -> (Vec<String>, Vec<Vec<String>>) {
    let mut lines = contents.lines();
    let header = lines
        .next()
        .unwrap_or_default()
        .split(',')
        .map(str::to_string)
        .collect();
    let rows = lines
        .map(|l| l.split(',').map(str::to_string).collect())
        .collect();
    (header, rows)
}
