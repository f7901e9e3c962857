//! Configuration file support for cohortvars.
//!
//! Configuration is loaded from `$XDG_CONFIG_HOME/cohortvars/config.toml`.

use crate::cohort::{default_cohorts, CohortConfig};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const APP_NAME: &str = "cohortvars";

/// Application configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub data: DataConfig,

    #[serde(default)]
    pub codelists: CodelistConfig,

    #[serde(default)]
    pub batch: BatchConfig,

    #[serde(default = "default_cohorts")]
    pub cohorts: Vec<CohortConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data: DataConfig::default(),
            codelists: CodelistConfig::default(),
            batch: BatchConfig::default(),
            cohorts: default_cohorts(),
        }
    }
}

/// Data locations
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DataConfig {
    /// Directory holding the record CSVs
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Variable table to use instead of the built-in one
    #[serde(default)]
    pub variables: Option<PathBuf>,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            variables: None,
        }
    }
}

/// Code list loading
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CodelistConfig {
    /// Defaults to `<data_dir>/codelists`
    #[serde(default)]
    pub dir: Option<PathBuf>,

    #[serde(default = "default_code_column")]
    pub code_column: String,

    #[serde(default = "default_category_column")]
    pub category_column: Option<String>,
}

impl Default for CodelistConfig {
    fn default() -> Self {
        Self {
            dir: None,
            code_column: default_code_column(),
            category_column: default_category_column(),
        }
    }
}

/// Batch execution
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct BatchConfig {
    /// Worker threads; 0 lets rayon decide
    #[serde(default)]
    pub threads: usize,
}

// Default value functions
fn default_data_dir() -> PathBuf {
    let base = dirs::data_local_dir().unwrap_or_else(|| {
        std::env::var_os("HOME")
            .map(|home| PathBuf::from(home).join(".local/share"))
            .unwrap_or_else(|| PathBuf::from("."))
    });
    base.join(APP_NAME)
}

fn default_code_column() -> String {
    "code".into()
}

fn default_category_column() -> Option<String> {
    Some("category".into())
}

impl Config {
    /// Load configuration from the standard config path
    pub fn load() -> Result<Self> {
        let config_path = Self::default_config_path();
        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            tracing::info!(
                "No config file found at {:?}, using defaults",
                config_path
            );
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        tracing::info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        let base = dirs::config_dir().unwrap_or_else(|| {
            std::env::var_os("HOME")
                .map(|home| PathBuf::from(home).join(".config"))
                .unwrap_or_else(|| PathBuf::from("."))
        });
        base.join(APP_NAME).join("config.toml")
    }

    /// Code list directory, defaulting to `<data_dir>/codelists`
    pub fn codelist_dir(&self) -> PathBuf {
        self.codelists
            .dir
            .clone()
            .unwrap_or_else(|| self.data.data_dir.join("codelists"))
    }

    fn validate(&self) -> Result<()> {
        if self.codelists.code_column.trim().is_empty() {
            return Err(Error::Config("codelists.code_column is empty".into()));
        }
        for (i, cohort) in self.cohorts.iter().enumerate() {
            if self.cohorts[..i].iter().any(|c| c.name == cohort.name) {
                return Err(Error::Config(format!(
                    "Cohort '{}' is defined twice",
                    cohort.name
                )));
            }
        }
        Ok(())
    }

    /// Save the current configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, contents)?;
        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }
}
