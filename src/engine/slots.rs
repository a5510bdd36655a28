use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::intervals::{compute_saturated_spans, merge_overlapping, peak_concurrency, subtract_intervals};
use super::windows::{blocked_spans, windows_for_date};
use super::EngineError;

/// What a caller wants slots for. `to` is inclusive.
#[derive(Debug, Clone)]
pub struct SlotQuery {
    pub location_id: Option<Ulid>,
    pub from: NaiveDate,
    pub to: NaiveDate,
    /// Service duration plus every selected add-on's duration.
    pub duration_min: u32,
    /// Booking whose own capacity usage is ignored (the one being rescheduled).
    pub exclude_booking: Option<Ulid>,
}

/// Service duration + Σ(add-on duration × quantity). Unknown add-ons add nothing;
/// pricing rejects them separately. Saturates, so an absurd selection simply
/// fits no window.
pub fn total_duration_min(state: &ServiceState, addons: &[AddOnSelection]) -> u32 {
    addons
        .iter()
        .filter_map(|sel| state.addon(sel.addon_id).map(|a| a.duration_min.saturating_mul(sel.quantity)))
        .fold(state.service.duration_min, u32::saturating_add)
}

/// Earliest and latest allowed start for `window`. Window settings override
/// the service's.
fn advance_bounds(state: &ServiceState, window: &AvailabilityWindow, now: Ms) -> (Ms, Option<Ms>) {
    let min_hours = window.min_advance_hours.or(state.service.min_advance_hours);
    let max_days = window.max_advance_days.or(state.service.max_advance_days);
    let earliest = now + min_hours.map_or(0, |h| h as Ms * HOUR_MS);
    let latest = max_days.map(|d| now + d as Ms * DAY_MS);
    (earliest, latest)
}

/// Occupancy spans of live bookings that satisfy `in_pool`, each extended by
/// the service buffer, restricted to those touching `around`.
fn pool_occupancy(
    state: &ServiceState,
    around: &Span,
    exclude: Option<Ulid>,
    in_pool: impl Fn(&Booking) -> bool,
) -> Vec<Span> {
    let buffer = minutes(state.service.buffer_min);
    let search = Span::new(around.start - buffer, around.end);
    let mut occupied: Vec<Span> = state
        .overlapping(&search)
        .filter(|b| b.occupies_capacity() && Some(b.id) != exclude && in_pool(b))
        .map(|b| b.span.with_buffer(buffer))
        .filter(|occ| occ.overlaps(around))
        .collect();
    occupied.sort_by_key(|s| s.start);
    occupied
}

/// Bookings that still fit in `occupancy` under the stricter of the window
/// and location limits. With neither limit the service holds one at a time.
fn remaining_capacity(
    state: &ServiceState,
    window: &AvailabilityWindow,
    location_id: Option<Ulid>,
    occupancy: &Span,
    exclude: Option<Ulid>,
) -> u32 {
    let location = location_id.and_then(|id| state.location(id));
    let mut remaining: Option<u32> = None;

    if let Some(limit) = window.max_bookings {
        let occupied = pool_occupancy(state, occupancy, exclude, |b| b.window_id == window.id);
        let left = limit.saturating_sub(peak_concurrency(&occupied, occupancy));
        remaining = Some(remaining.map_or(left, |r: u32| r.min(left)));
    }
    if let Some(loc) = location {
        let occupied = pool_occupancy(state, occupancy, exclude, |b| b.location_id == Some(loc.id));
        let left = loc.max_capacity.saturating_sub(peak_concurrency(&occupied, occupancy));
        remaining = Some(remaining.map_or(left, |r: u32| r.min(left)));
    }

    match remaining {
        Some(r) => r,
        None => {
            let occupied = pool_occupancy(state, occupancy, exclude, |b| b.location_id == location_id);
            1u32.saturating_sub(peak_concurrency(&occupied, occupancy))
        }
    }
}

/// Every candidate start on `date`, full ones included (`remaining == 0`).
/// Slots that are blocked, outside advance bounds or in the past are omitted.
pub fn day_candidates(state: &ServiceState, query: &SlotQuery, date: NaiveDate, now: Ms) -> Vec<Slot> {
    let windows = windows_for_date(state, query.location_id, date);
    let blocked = blocked_spans(&windows, date);
    let duration = minutes(query.duration_min.max(1));
    let buffer = minutes(state.service.buffer_min);

    let mut slots = Vec::new();
    for window in windows.iter().filter(|w| !w.is_blocker()) {
        let window_span = window.span_on(date);
        let open = subtract_intervals(&[window_span], &blocked);
        if open.is_empty() {
            continue;
        }

        let step_min = window.slot_duration_min.unwrap_or(state.service.duration_min) + window.break_min;
        let step = minutes(step_min.max(1));
        let (earliest, latest) = advance_bounds(state, window, now);

        let mut start = window_span.start;
        while start + duration <= window_span.end {
            let span = Span::new(start, start + duration);
            start += step;

            if span.start < now || span.start < earliest {
                continue;
            }
            if latest.is_some_and(|l| span.start > l) {
                continue;
            }
            if !open.iter().any(|o| o.contains_span(&span)) {
                continue;
            }

            let occupancy = span.with_buffer(buffer);
            slots.push(Slot {
                service_id: state.service.id,
                location_id: query.location_id,
                window_id: window.id,
                span,
                remaining: remaining_capacity(state, window, query.location_id, &occupancy, query.exclude_booking),
            });
        }
    }

    slots.sort_by(|a, b| a.span.start.cmp(&b.span.start).then(a.window_id.cmp(&b.window_id)));
    slots
}

/// Bookable slots across `query.from..=query.to`, chronological.
///
/// Lazy over days and a pure function of its inputs, so it can be restarted
/// or abandoned part-way.
pub fn generate_slots<'a>(state: &'a ServiceState, query: &'a SlotQuery, now: Ms) -> impl Iterator<Item = Slot> + 'a {
    query
        .from
        .iter_days()
        .take_while(move |d| *d <= query.to)
        .flat_map(move |date| {
            day_candidates(state, query, date, now)
                .into_iter()
                .filter(|s| s.remaining > 0)
        })
}

/// The slot a booking at `start` would take. Unknown start (or wrong window)
/// is a validation error; a known but full slot is a capacity error.
pub fn resolve_slot(
    state: &ServiceState,
    query: &SlotQuery,
    start: Ms,
    window_id: Option<Ulid>,
    now: Ms,
) -> Result<Slot, EngineError> {
    let date = date_of(start).ok_or_else(|| EngineError::validation("scheduled_at", "timestamp out of range"))?;
    let matching: Vec<Slot> = day_candidates(state, query, date, now)
        .into_iter()
        .filter(|s| s.span.start == start && window_id.is_none_or(|w| s.window_id == w))
        .collect();

    if matching.is_empty() {
        return Err(EngineError::validation(
            "scheduled_at",
            format!("{start} is not an available slot for service {}", state.service.id),
        ));
    }
    matching
        .into_iter()
        .find(|s| s.remaining > 0)
        .ok_or(EngineError::Capacity {
            service_id: state.service.id,
            start,
        })
}

/// Free time per day in `from..=to`: open window time minus blockers minus
/// spans where a capacity pool is saturated. Sorted and merged.
pub fn compute_availability(
    state: &ServiceState,
    location_id: Option<Ulid>,
    from: NaiveDate,
    to: NaiveDate,
    now: Ms,
    min_duration_ms: Option<Ms>,
) -> Vec<Span> {
    let location = location_id.and_then(|id| state.location(id));
    let mut free: Vec<Span> = Vec::new();

    for date in from.iter_days().take_while(|d| *d <= to) {
        let windows = windows_for_date(state, location_id, date);
        let blocked = blocked_spans(&windows, date);

        for window in windows.iter().filter(|w| !w.is_blocker()) {
            let span = window.span_on(date);
            let mut open = subtract_intervals(&[span], &blocked);

            let mut saturated: Vec<Span> = Vec::new();
            if let Some(limit) = window.max_bookings {
                let occupied = pool_occupancy(state, &span, None, |b| b.window_id == window.id);
                saturated.extend(compute_saturated_spans(&occupied, limit));
            }
            if let Some(loc) = location {
                let occupied = pool_occupancy(state, &span, None, |b| b.location_id == Some(loc.id));
                saturated.extend(compute_saturated_spans(&occupied, loc.max_capacity));
            }
            if window.max_bookings.is_none() && location.is_none() {
                let occupied = pool_occupancy(state, &span, None, |b| b.location_id == location_id);
                saturated.extend(compute_saturated_spans(&occupied, 1));
            }
            if !saturated.is_empty() {
                saturated.sort_by_key(|s| s.start);
                open = subtract_intervals(&open, &merge_overlapping(&saturated));
            }

            free.extend(open.into_iter().filter(|s| s.end > now).map(|s| Span::new(s.start.max(now), s.end)));
        }
    }

    free.sort_by_key(|s| s.start);
    let mut free = merge_overlapping(&free);
    if let Some(min) = min_duration_ms {
        free.retain(|s| s.duration_ms() >= min);
    }
    free
}
