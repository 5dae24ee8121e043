use std::collections::HashSet;

use rand::Rng;
use rand::seq::SliceRandom;
use ulid::Ulid;

use crate::model::EquipmentState;

use super::EngineError;
use super::availability::available_units;

/// Pick `quantity` free units of one equipment type.
///
/// Eligible units are shuffled before the first `quantity` are taken, so no
/// unit is preferred over another and wear spreads evenly. Pass a seeded rng
/// for reproducible picks. Fails without picking anything when supply is short.
pub fn allocate<R: Rng + ?Sized>(
    equipment: &EquipmentState,
    occupied: &HashSet<Ulid>,
    quantity: u32,
    rng: &mut R,
) -> Result<Vec<Ulid>, EngineError> {
    let mut candidates = available_units(equipment, occupied);
    let available = candidates.len() as u32;
    if available < quantity {
        return Err(EngineError::InsufficientStock {
            equipment_name: equipment.info.name.clone(),
            requested: quantity,
            available,
        });
    }
    candidates.shuffle(rng);
    candidates.truncate(quantity as usize);
    Ok(candidates)
}
