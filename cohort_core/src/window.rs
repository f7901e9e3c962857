//! Date windows bounding eligible events.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Closed date interval; a `None` bound is open on that side
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Window {
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
}

impl Window {
    pub fn new(start: Option<NaiveDate>, end: Option<NaiveDate>) -> Self {
        Self { start, end }
    }

    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn between(start: NaiveDate, end: NaiveDate) -> Self {
        Self::new(Some(start), Some(end))
    }

    pub fn on_or_before(end: NaiveDate) -> Self {
        Self::new(None, Some(end))
    }

    pub fn on_or_after(start: NaiveDate) -> Self {
        Self::new(Some(start), None)
    }

    /// `start > end`; a degenerate window contains nothing
    pub fn is_degenerate(&self) -> bool {
        matches!((self.start, self.end), (Some(s), Some(e)) if s > e)
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start.map_or(true, |s| date >= s) && self.end.map_or(true, |e| date <= e)
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bound = |d: Option<NaiveDate>| d.map_or_else(|| "..".to_string(), |d| d.to_string());
        write!(f, "[{}, {}]", bound(self.start), bound(self.end))
    }
}
