//! Windowed event matching.
//!
//! An event qualifies when the source accepts it, one of its inspected codes
//! is in the code set, and its date is non-null and inside the window
//! (closed on both ends, open where a bound is `None`).
//!
//! Ties on the selected date go to the smallest `row_id`, in both
//! directions, so FIRST and LAST agree on a single-day window.

use crate::{CodeSet, Event, EventSource, Result, Subject, Window};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;

/// Which end of the qualifying events to select
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    #[default]
    #[serde(alias = "FIRST")]
    First,
    #[serde(alias = "LAST", alias = "latest", alias = "LATEST")]
    Last,
}

/// Qualifying events with their (non-null) dates, in storage order
pub fn qualifying<'a, 'e: 'a>(
    codes: &'a CodeSet,
    source: &'a dyn EventSource,
    events: &'e [Event],
    window: &Window,
) -> impl Iterator<Item = (NaiveDate, &'e Event)> + 'a {
    let window = *window;
    let events: &'e [Event] = if window.is_degenerate() { &[] } else { events };
    events
        .iter()
        .filter_map(|event| event.date.map(|date| (date, event)))
        .filter(move |(date, _)| window.contains(*date))
        .filter(move |(_, event)| source.matches(event, codes))
}

/// Select the first or last qualifying event
pub fn find_event<'e>(
    codes: &CodeSet,
    source: &dyn EventSource,
    events: &'e [Event],
    window: &Window,
    direction: Direction,
) -> Option<&'e Event> {
    if window.is_degenerate() {
        tracing::debug!("Degenerate window {} matches nothing", window);
        return None;
    }

    let candidates = qualifying(codes, source, events, window);
    let selected = match direction {
        Direction::First => candidates.min_by_key(|(date, event)| (*date, event.row_id)),
        Direction::Last => candidates.max_by_key(|(date, event)| (*date, Reverse(event.row_id))),
    };

    selected.map(|(_, event)| event)
}

/// Subject-level form: read the adapter's source from `subject` and match.
///
/// Errors only when the source is unreadable for this subject.
pub fn match_event<'s>(
    codes: &CodeSet,
    source: &dyn EventSource,
    subject: &'s Subject,
    window: &Window,
    direction: Direction,
) -> Result<Option<&'s Event>> {
    let events = subject.events(source.kind())?;
    Ok(find_event(codes, source, events, window, direction))
}

pub fn exists(codes: &CodeSet, source: &dyn EventSource, events: &[Event], window: &Window) -> bool {
    qualifying(codes, source, events, window).next().is_some()
}

pub fn count(codes: &CodeSet, source: &dyn EventSource, events: &[Event], window: &Window) -> usize {
    qualifying(codes, source, events, window).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ClinicalCoding, CodeField, PrimaryCareSource, SourceKind};

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn gp(row_id: u64, date: Option<&str>, code: &str) -> Event {
        Event::new(SourceKind::PrimaryCare, row_id, date.map(d)).with_code(CodeField::Snomed, code)
    }

    fn ami() -> CodeSet {
        CodeSet::from_codes("ami", ["22298006", "399211009"])
    }

    fn source() -> PrimaryCareSource {
        PrimaryCareSource::new(ClinicalCoding::Snomed)
    }

    #[test]
    fn test_first_and_last() {
        let events = vec![
            gp(1, Some("2021-06-01"), "22298006"),
            gp(2, Some("2021-02-01"), "399211009"),
            gp(3, Some("2021-09-01"), "22298006"),
            gp(4, Some("2021-01-15"), "38341003"),
        ];
        let window = Window::between(d("2021-01-01"), d("2021-12-31"));

        let first = find_event(&ami(), &source(), &events, &window, Direction::First).unwrap();
        let last = find_event(&ami(), &source(), &events, &window, Direction::Last).unwrap();
        assert_eq!(first.row_id, 2);
        assert_eq!(last.row_id, 3);
    }

    #[test]
    fn test_window_bounds_are_inclusive() {
        let events = vec![gp(1, Some("2021-01-01"), "22298006"), gp(2, Some("2021-12-31"), "22298006")];
        let window = Window::between(d("2021-01-01"), d("2021-12-31"));

        assert_eq!(count(&ami(), &source(), &events, &window), 2);
    }

    #[test]
    fn test_singleton_window_first_and_last_agree() {
        let events = vec![
            gp(7, Some("2021-03-01"), "22298006"),
            gp(3, Some("2021-03-01"), "399211009"),
            gp(5, Some("2021-03-02"), "22298006"),
        ];
        let window = Window::between(d("2021-03-01"), d("2021-03-01"));

        let first = find_event(&ami(), &source(), &events, &window, Direction::First).unwrap();
        let last = find_event(&ami(), &source(), &events, &window, Direction::Last).unwrap();
        assert_eq!(first, last);
        assert_eq!(first.row_id, 3);
    }

    #[test]
    fn test_singleton_window_requires_matching_code() {
        let events = vec![gp(1, Some("2021-03-01"), "38341003")];
        let window = Window::between(d("2021-03-01"), d("2021-03-01"));

        assert!(find_event(&ami(), &source(), &events, &window, Direction::First).is_none());
        assert!(find_event(&ami(), &source(), &events, &window, Direction::Last).is_none());
    }

    #[test]
    fn test_tie_break_on_same_date() {
        let events = vec![
            gp(9, Some("2021-05-01"), "22298006"),
            gp(4, Some("2021-05-01"), "22298006"),
            gp(6, Some("2021-05-01"), "22298006"),
        ];
        let window = Window::unbounded();

        let first = find_event(&ami(), &source(), &events, &window, Direction::First).unwrap();
        let last = find_event(&ami(), &source(), &events, &window, Direction::Last).unwrap();
        assert_eq!(first.row_id, 4);
        assert_eq!(last.row_id, 4);
    }

    #[test]
    fn test_null_dates_never_match() {
        let events = vec![gp(1, None, "22298006")];
        assert!(find_event(&ami(), &source(), &events, &Window::unbounded(), Direction::First).is_none());
        assert!(!exists(&ami(), &source(), &events, &Window::unbounded()));
    }

    #[test]
    fn test_degenerate_window_is_no_match() {
        let events = vec![gp(1, Some("2021-03-01"), "22298006")];
        let window = Window::between(d("2021-04-01"), d("2021-02-01"));

        assert!(find_event(&ami(), &source(), &events, &window, Direction::First).is_none());
        assert!(!exists(&ami(), &source(), &events, &window));
        assert_eq!(count(&ami(), &source(), &events, &window), 0);
    }

    #[test]
    fn test_selection_and_count_share_predicate() {
        let events = vec![
            Event::new(SourceKind::PrimaryCare, 1, Some(d("2021-02-01")))
                .with_code(CodeField::Ctv3, "22298006"),
            gp(2, Some("2021-03-01"), "22298006"),
            gp(3, Some("2020-12-31"), "22298006"),
        ];
        let window = Window::between(d("2021-01-01"), d("2021-12-31"));

        let first = find_event(&ami(), &source(), &events, &window, Direction::First).unwrap();
        let last = find_event(&ami(), &source(), &events, &window, Direction::Last).unwrap();
        assert_eq!((first.row_id, last.row_id), (2, 2));
        assert_eq!(count(&ami(), &source(), &events, &window), 1);
    }

    #[test]
    fn test_direction_names() {
        #[derive(Deserialize)]
        struct Row {
            direction: Direction,
        }
        let parse = |s: &str| {
            toml::from_str::<Row>(&format!("direction = \"{}\"", s))
                .map(|r| r.direction)
                .ok()
        };
        assert_eq!(parse("first"), Some(Direction::First));
        assert_eq!(parse("FIRST"), Some(Direction::First));
        assert_eq!(parse("LAST"), Some(Direction::Last));
        assert_eq!(parse("LATEST"), Some(Direction::Last));
        assert_eq!(parse("sideways"), None);
    }

    #[test]
    fn test_match_event_on_subject() {
        let subject = Subject::new("p1").with_event(gp(1, Some("2021-03-01"), "22298006"));
        let found = match_event(&ami(), &source(), &subject, &Window::unbounded(), Direction::Last)
            .unwrap();
        assert_eq!(found.map(|e| e.row_id), Some(1));

        let empty = Subject::new("p2");
        assert!(match_event(&ami(), &source(), &empty, &Window::unbounded(), Direction::Last)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_match_event_unreadable_source() {
        let mut subject = Subject::new("p1");
        subject.mark_unreadable(SourceKind::PrimaryCare, "row 2: bad date");
        assert!(match_event(&ami(), &source(), &subject, &Window::unbounded(), Direction::First)
            .is_err());
    }
}
