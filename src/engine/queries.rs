use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

impl Engine {
    pub fn get_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        self.store
            .get_reservation(&id)
            .ok_or(EngineError::reservation(id))
    }

    /// All reservations in id (creation) order, optionally only one status.
    pub fn list_reservations(&self, status: Option<ReservationStatus>) -> Vec<Reservation> {
        self.store
            .reservations()
            .into_iter()
            .filter(|r| status.is_none_or(|s| r.status == s))
            .collect()
    }

    pub fn get_repair(&self, id: Ulid) -> Result<RepairTicket, EngineError> {
        self.store.get_repair(&id).ok_or(EngineError::repair(id))
    }

    pub fn list_repairs(&self, asset_id: Option<Ulid>) -> Vec<RepairTicket> {
        self.store
            .repairs()
            .into_iter()
            .filter(|t| asset_id.is_none_or(|a| t.asset_id == Some(a)))
            .collect()
    }

    pub fn asset_history(&self, asset_id: Ulid) -> Result<Vec<HistoryRecord>, EngineError> {
        if self.store.equipment_for_asset(&asset_id).is_none() {
            return Err(EngineError::asset(asset_id));
        }
        Ok(self.store.history_for(&asset_id))
    }

    pub async fn list_assets(&self, equipment_id: Ulid) -> Result<Vec<Asset>, EngineError> {
        let eq = self
            .get_equipment_state(&equipment_id)
            .ok_or(EngineError::equipment(equipment_id))?;
        let guard = eq.read().await;
        Ok(guard.assets.clone())
    }

    pub async fn list_equipment(&self) -> Vec<EquipmentInfo> {
        let mut out = Vec::new();
        for id in self.store.equipment_ids() {
            let Some(eq) = self.store.get_equipment(&id) else {
                continue;
            };
            let guard = eq.read().await;
            out.push(EquipmentInfo {
                id,
                name: guard.info.name.clone(),
                total_units: guard.assets.len() as u32,
            });
        }
        out
    }
}
