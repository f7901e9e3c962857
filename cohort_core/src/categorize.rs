//! Mapping matched events to categories.
//!
//! `classify_with_history` applies a fixed priority chain. Real records can
//! satisfy more than one branch, so the first branch that holds wins:
//!
//! 1. latest category is `current` -> `current`
//! 2. latest category is `former` -> `former`
//! 3. latest category is `never` and an ever-subset code matched -> `former`
//! 4. latest category is `never` and nothing matched -> `never`
//! 5. anything else (no record, unknown category) -> `missing`

use crate::{CodeSet, Event, EventSource};
use serde::{Deserialize, Serialize};

/// Category of the first code on `event` that the code set categorises
pub fn categorize(event: Option<&Event>, codes: &CodeSet) -> Option<String> {
    event?
        .codes
        .iter()
        .find_map(|c| codes.category(&c.code))
        .map(str::to_string)
}

/// Like [`categorize`], but only codes the adapter inspects are considered
pub fn categorize_from(
    event: Option<&Event>,
    source: &dyn EventSource,
    codes: &CodeSet,
) -> Option<String> {
    let event = event?;
    event
        .codes
        .iter()
        .filter(|c| source.fields().contains(&c.field))
        .find_map(|c| codes.category(&c.code))
        .map(str::to_string)
}

/// Labels for a current/former/never status classification
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusRule {
    #[serde(default = "default_current")]
    pub current: String,
    #[serde(default = "default_former")]
    pub former: String,
    #[serde(default = "default_never")]
    pub never: String,
    #[serde(default = "default_missing")]
    pub missing: String,
}

impl Default for StatusRule {
    fn default() -> Self {
        Self {
            current: default_current(),
            former: default_former(),
            never: default_never(),
            missing: default_missing(),
        }
    }
}

impl StatusRule {
    /// Category labels that make up the "ever" subset (current and former)
    pub fn ever_labels(&self) -> [&str; 2] {
        [self.current.as_str(), self.former.as_str()]
    }

    /// Configuration problems, if any
    pub fn validate(&self) -> Vec<String> {
        let labels = [&self.current, &self.former, &self.never, &self.missing];
        let mut errors = Vec::new();
        if labels.iter().any(|l| l.trim().is_empty()) {
            errors.push("status rule has an empty label".to_string());
        }
        for (i, a) in labels.iter().enumerate() {
            if labels[i + 1..].contains(a) {
                errors.push(format!("status rule label '{}' is used twice", a));
            }
        }
        errors
    }
}

// Default value functions (smoking code list categories)
fn default_current() -> String {
    "S".into()
}

fn default_former() -> String {
    "E".into()
}

fn default_never() -> String {
    "N".into()
}

fn default_missing() -> String {
    "M".into()
}

/// Classify a status from the latest recorded category and history
pub fn classify_with_history(
    latest_category: Option<&str>,
    ever_matched: bool,
    rule: &StatusRule,
) -> String {
    let label = match latest_category {
        Some(c) if c == rule.current => &rule.current,
        Some(c) if c == rule.former => &rule.former,
        Some(c) if c == rule.never && ever_matched => &rule.former,
        Some(c) if c == rule.never => &rule.never,
        _ => &rule.missing,
    };
    label.clone()
}
