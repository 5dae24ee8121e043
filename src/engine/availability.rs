use std::collections::HashSet;

use ulid::Ulid;

use crate::model::{AvailabilityCounts, EquipmentState};

/// Partition one equipment type's units into broken, claimed (`rented`) and
/// available. Read-only, so it is safe for speculative checks.
///
/// `available + broken + rented == total` always holds.
pub fn resolve(equipment: &EquipmentState, occupied: &HashSet<Ulid>) -> AvailabilityCounts {
    let mut counts = AvailabilityCounts {
        total: equipment.assets.len() as u32,
        broken: 0,
        rented: 0,
        available: 0,
    };
    for asset in &equipment.assets {
        if asset.condition.is_broken() {
            counts.broken += 1;
        } else if occupied.contains(&asset.id) {
            counts.rented += 1;
        }
    }
    counts.available = counts.total - counts.broken - counts.rented;
    counts
}

/// Ids of units that could be bound right now, in registration order.
pub fn available_units(equipment: &EquipmentState, occupied: &HashSet<Ulid>) -> Vec<Ulid> {
    equipment
        .assets
        .iter()
        .filter(|a| !a.condition.is_broken() && !occupied.contains(&a.id))
        .map(|a| a.id)
        .collect()
}
