use ulid::Ulid;

use crate::model::{DateRange, Reservation};

/// Strict overlap test. A candidate ending on the day `range` starts does not
/// overlap, so back-to-back return and checkout on the same day is allowed.
pub fn overlaps(range: &DateRange, candidate: &DateRange) -> bool {
    candidate.start < range.end && candidate.end > range.start
}

/// Every active reservation except `exclude_id` whose range overlaps `target`.
/// Result order follows the input; callers only rely on membership.
pub fn find_overlapping<'a, I>(
    target: &DateRange,
    reservations: I,
    exclude_id: Option<Ulid>,
) -> Vec<&'a Reservation>
where
    I: IntoIterator<Item = &'a Reservation>,
{
    reservations
        .into_iter()
        .filter(|r| Some(r.id) != exclude_id)
        .filter(|r| r.status.is_active())
        .filter(|r| overlaps(target, &r.range))
        .collect()
}
