//! Code sets and the library of named code sets.
//!
//! A code set maps a canonical code to an optional category label. Code sets
//! are built once at startup from CSV code lists and never change afterwards.

use crate::{Error, Result};
use csv::ReaderBuilder;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

/// Immutable mapping of code -> optional category
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CodeSet {
    name: String,
    codes: BTreeMap<String, Option<String>>,
}

impl CodeSet {
    /// Build a code set from `(code, category)` entries.
    ///
    /// Codes are trimmed and blank codes skipped. A code listed twice with the
    /// same category is accepted; with different categories it is a
    /// [`Error::CodeSetConflict`].
    pub fn new<I, C>(name: impl Into<String>, entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = (C, Option<String>)>,
        C: AsRef<str>,
    {
        let name = name.into();
        let mut codes: BTreeMap<String, Option<String>> = BTreeMap::new();

        for (code, category) in entries {
            let code = code.as_ref().trim();
            if code.is_empty() {
                continue;
            }
            let category = normalize_category(category);

            match codes.get(code) {
                Some(existing) if existing != &category => {
                    return Err(Error::CodeSetConflict {
                        set: name,
                        code: code.to_string(),
                        first: existing.clone(),
                        second: category,
                    });
                }
                Some(_) => {}
                None => {
                    codes.insert(code.to_string(), category);
                }
            }
        }

        Ok(Self { name, codes })
    }

    /// Build an uncategorised code set
    pub fn from_codes<I, C>(name: impl Into<String>, codes: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: AsRef<str>,
    {
        let codes = codes
            .into_iter()
            .filter_map(|c| {
                let c = c.as_ref().trim();
                (!c.is_empty()).then(|| (c.to_string(), None))
            })
            .collect();
        Self {
            name: name.into(),
            codes,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    pub fn contains(&self, code: &str) -> bool {
        self.codes.contains_key(code.trim())
    }

    /// Category of `code`, if the code is present and categorised
    pub fn category(&self, code: &str) -> Option<&str> {
        self.codes.get(code.trim()).and_then(|c| c.as_deref())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.codes.iter().map(|(k, v)| (k.as_str(), v.as_deref()))
    }

    /// Distinct category labels in this set, sorted
    pub fn categories(&self) -> Vec<&str> {
        let mut labels: Vec<&str> = self.codes.values().filter_map(|c| c.as_deref()).collect();
        labels.sort_unstable();
        labels.dedup();
        labels
    }

    /// Merge two code sets.
    ///
    /// When a code appears in both with different categories, `other` wins
    /// (including when its category is `None`). Conflicts are logged.
    pub fn union(&self, other: &CodeSet) -> CodeSet {
        let mut codes = self.codes.clone();
        for (code, category) in &other.codes {
            if let Some(previous) = codes.insert(code.clone(), category.clone()) {
                if &previous != category {
                    tracing::warn!(
                        "Code '{}' has category {:?} in '{}' and {:?} in '{}'; using {:?}",
                        code,
                        previous,
                        self.name,
                        category,
                        other.name,
                        category
                    );
                }
            }
        }

        CodeSet {
            name: format!("{}+{}", self.name, other.name),
            codes,
        }
    }

    /// Subset containing only codes whose category is in `include`
    pub fn filter_categories<S: AsRef<str>>(&self, include: &[S]) -> CodeSet {
        let codes = self
            .codes
            .iter()
            .filter(|(_, category)| {
                category
                    .as_deref()
                    .is_some_and(|c| include.iter().any(|i| i.as_ref() == c))
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let labels: Vec<&str> = include.iter().map(|i| i.as_ref()).collect();
        CodeSet {
            name: format!("{}[{}]", self.name, labels.join(",")),
            codes,
        }
    }

    /// Load a code list from CSV.
    ///
    /// `category_column` is optional; when given but missing from the file the
    /// set is loaded uncategorised.
    pub fn load_csv(
        name: impl Into<String>,
        path: &Path,
        code_column: &str,
        category_column: Option<&str>,
    ) -> Result<Self> {
        let name = name.into();
        let mut reader = ReaderBuilder::new().has_headers(true).from_path(path)?;
        let headers = reader.headers()?.clone();

        let code_idx = headers
            .iter()
            .position(|h| h.trim() == code_column)
            .ok_or_else(|| {
                Error::Config(format!(
                    "Code list {:?} has no '{}' column",
                    path, code_column
                ))
            })?;
        let category_idx =
            category_column.and_then(|col| headers.iter().position(|h| h.trim() == col));

        let mut entries = Vec::new();
        for record in reader.records() {
            let record = record?;
            let code = record.get(code_idx).unwrap_or_default().to_string();
            let category = category_idx
                .and_then(|idx| record.get(idx))
                .map(|c| c.to_string());
            entries.push((code, category));
        }

        let set = CodeSet::new(name, entries)?;
        tracing::debug!("Loaded code set '{}' ({} codes) from {:?}", set.name, set.len(), path);
        Ok(set)
    }
}

fn normalize_category(category: Option<String>) -> Option<String> {
    category.and_then(|c| {
        let c = c.trim();
        (!c.is_empty()).then(|| c.to_string())
    })
}

/// Named code sets available to a variable table
#[derive(Clone, Debug, Default)]
pub struct CodeLibrary {
    sets: HashMap<String, Arc<CodeSet>>,
}

impl CodeLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, set: CodeSet) {
        self.sets.insert(set.name().to_string(), Arc::new(set));
    }

    /// Builder form of [`CodeLibrary::insert`]
    pub fn with(mut self, set: CodeSet) -> Self {
        self.insert(set);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Arc<CodeSet>> {
        self.sets.get(name)
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    /// Code set names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.sets.keys().map(|k| k.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Load every `*.csv` in `dir`; the file stem is the code set name.
    pub fn load_dir(dir: &Path, code_column: &str, category_column: Option<&str>) -> Result<Self> {
        let mut library = Self::new();
        if !dir.exists() {
            tracing::warn!("Code list directory {:?} does not exist", dir);
            return Ok(library);
        }

        let mut paths: Vec<_> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().is_some_and(|ext| ext == "csv"))
            .collect();
        paths.sort();

        for path in paths {
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let set = CodeSet::load_csv(stem, &path, code_column, category_column)?;
            library.insert(set);
        }

        tracing::info!("Loaded {} code sets from {:?}", library.len(), dir);
        Ok(library)
    }
}
