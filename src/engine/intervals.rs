use crate::model::*;

// ── Interval arithmetic over sorted spans ─────────────────────────

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end
        {
            last.end = last.end.max(span.end);
            continue;
        }
        merged.push(span);
    }
    merged
}

/// `base` minus `to_remove`. Both inputs sorted by start; `to_remove` merged.
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;
        let current_end = b.end;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < current_end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < current_end {
            result.push(Span::new(current_start, current_end));
        }
    }

    result
}

/// Sweep-line events: +1 at start, -1 at end. Ends sort before starts at the
/// same instant so back-to-back bookings never count as concurrent.
fn sweep_events(occupied: &[Span]) -> Vec<(Ms, i32)> {
    let mut events: Vec<(Ms, i32)> = Vec::with_capacity(occupied.len() * 2);
    for a in occupied {
        events.push((a.start, 1));
        events.push((a.end, -1));
    }
    events.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));
    events
}

/// Time ranges where booking count >= capacity, sorted and merged.
pub fn compute_saturated_spans(occupied: &[Span], capacity: u32) -> Vec<Span> {
    if occupied.is_empty() {
        return Vec::new();
    }
    if capacity <= 1 {
        let mut sorted = occupied.to_vec();
        sorted.sort_by_key(|s| s.start);
        return merge_overlapping(&sorted);
    }

    let mut result = Vec::new();
    let mut count: u32 = 0;
    let mut saturated_start: Option<Ms> = None;

    for (time, delta) in sweep_events(occupied) {
        if delta > 0 {
            count += 1;
        } else {
            count -= 1;
        }

        if count >= capacity && saturated_start.is_none() {
            saturated_start = Some(time);
        } else if count < capacity
            && let Some(start) = saturated_start.take()
            && time > start
        {
            result.push(Span::new(start, time));
        }
    }

    result
}

/// Highest number of bookings simultaneously live anywhere inside `within`.
pub fn peak_concurrency(occupied: &[Span], within: &Span) -> u32 {
    let clipped: Vec<Span> = occupied
        .iter()
        .filter(|a| a.overlaps(within))
        .map(|a| Span::new(a.start.max(within.start), a.end.min(within.end)))
        .collect();

    let mut count: u32 = 0;
    let mut peak: u32 = 0;
    for (_, delta) in sweep_events(&clipped) {
        if delta > 0 {
            count += 1;
            peak = peak.max(count);
        } else {
            count -= 1;
        }
    }
    peak
}
