use std::collections::HashSet;

use ulid::Ulid;

use crate::model::Reservation;

/// Union of every bound unit across the given reservations. Used for
/// read-only availability display.
pub fn occupied_assets<'a, I>(reservations: I) -> HashSet<Ulid>
where
    I: IntoIterator<Item = &'a Reservation>,
{
    reservations
        .into_iter()
        .flat_map(|r| r.bound_assets().copied())
        .collect()
}

/// Units bound by line items of one equipment type only. Used when binding,
/// where only same-type competitors matter.
pub fn occupied_assets_of_type<'a, I>(reservations: I, equipment_id: Ulid) -> HashSet<Ulid>
where
    I: IntoIterator<Item = &'a Reservation>,
{
    reservations
        .into_iter()
        .flat_map(|r| r.items.iter())
        .filter(|item| item.equipment_id == equipment_id)
        .flat_map(|item| item.assigned_assets.iter().copied())
        .collect()
}
