use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

/// Windows that govern `date` for a service at `location_id`.
///
/// Blockers are included so callers can carve them out of the bookable ones.
/// A bookable window is dropped for the day when a more specific date-based
/// bookable window covers its whole interval; otherwise overlapping bookable
/// windows stay as separate capacity pools.
///
/// Ordered by specificity (most specific first), then start time, then id.
pub fn windows_for_date(
    state: &ServiceState,
    location_id: Option<Ulid>,
    date: NaiveDate,
) -> Vec<&AvailabilityWindow> {
    let candidates: Vec<&AvailabilityWindow> = state
        .windows
        .iter()
        .filter(|w| w.is_active && w.applies_to(location_id) && w.pattern.matches(date))
        .collect();

    let mut out: Vec<&AvailabilityWindow> = candidates
        .iter()
        .copied()
        .filter(|w| w.is_blocker() || !is_overridden(w, &candidates, date))
        .collect();

    out.sort_by(|a, b| {
        b.pattern
            .specificity()
            .cmp(&a.pattern.specificity())
            .then(a.start_time.cmp(&b.start_time))
            .then(a.id.cmp(&b.id))
    });
    out
}

fn is_overridden(w: &AvailabilityWindow, candidates: &[&AvailabilityWindow], date: NaiveDate) -> bool {
    let span = w.span_on(date);
    candidates.iter().any(|other| {
        other.id != w.id
            && !other.is_blocker()
            && other.pattern.is_date_based()
            && other.pattern.specificity() > w.pattern.specificity()
            && other.span_on(date).contains_span(&span)
    })
}

/// Spans of `date` closed by blockers among `windows`, sorted and merged.
pub fn blocked_spans(windows: &[&AvailabilityWindow], date: NaiveDate) -> Vec<Span> {
    let mut spans: Vec<Span> = windows
        .iter()
        .filter(|w| w.is_blocker())
        .map(|w| w.span_on(date))
        .collect();
    spans.sort_by_key(|s| s.start);
    super::intervals::merge_overlapping(&spans)
}
