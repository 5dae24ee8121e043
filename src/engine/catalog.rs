use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError};

impl Engine {
    pub async fn create_equipment(&self, id: Ulid, name: String) -> Result<(), EngineError> {
        if name.trim().is_empty() {
            return Err(EngineError::InvalidInput("equipment name is empty"));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("equipment name too long"));
        }
        if self.store.equipment_count() >= MAX_EQUIPMENT_TYPES {
            return Err(EngineError::LimitExceeded("too many equipment types"));
        }
        let _catalog = self.catalog.lock().await;
        let mut scope = self.begin(&[]).await?;
        if self.store.contains_equipment(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let info = EquipmentType { id, name };
        self.commit(&mut scope, vec![Change::EquipmentCreated(info)])
            .await?;
        info!("equipment type {id} created");
        Ok(())
    }

    /// Register one physical unit. New units start out `available`.
    pub async fn register_asset(
        &self,
        id: Ulid,
        equipment_id: Ulid,
        note: Option<String>,
    ) -> Result<Asset, EngineError> {
        check_note(note.as_deref())?;
        // Unit ids are global across types; only this path maps new ones.
        let _catalog = self.catalog.lock().await;
        let mut scope = self.begin(&[equipment_id]).await?;
        if self.store.equipment_for_asset(&id).is_some() {
            return Err(EngineError::AlreadyExists(id));
        }
        let eq = scope.locked.get(&equipment_id)?;
        if eq.assets.len() >= MAX_ASSETS_PER_EQUIPMENT {
            return Err(EngineError::LimitExceeded("too many units for equipment type"));
        }
        let asset = Asset {
            id,
            equipment_id,
            condition: AssetCondition::Available,
            note,
            rented_by: None,
        };
        self.commit(&mut scope, vec![Change::AssetSaved(asset.clone())])
            .await?;
        Ok(asset)
    }

    /// Staff edit of a unit's condition. `rented` is reserved for checkout.
    pub async fn set_asset_condition(
        &self,
        asset_id: Ulid,
        condition: AssetCondition,
        note: Option<String>,
    ) -> Result<Asset, EngineError> {
        if condition == AssetCondition::Rented {
            return Err(EngineError::InvalidInput(
                "rented condition is set by checkout only",
            ));
        }
        check_note(note.as_deref())?;
        let equipment_id = self
            .store
            .equipment_for_asset(&asset_id)
            .ok_or(EngineError::asset(asset_id))?;
        let mut scope = self.begin(&[equipment_id]).await?;
        let mut asset = scope
            .locked
            .get(&equipment_id)?
            .asset(&asset_id)
            .cloned()
            .ok_or(EngineError::asset(asset_id))?;
        asset.set_condition(condition);
        asset.note = note;
        self.commit(&mut scope, vec![Change::AssetSaved(asset.clone())])
            .await?;
        info!("asset {asset_id} condition set to {condition:?}");
        Ok(asset)
    }
}

pub(super) fn check_note(note: Option<&str>) -> Result<(), EngineError> {
    match note {
        Some(n) if n.len() > MAX_TEXT_LEN => Err(EngineError::LimitExceeded("note too long")),
        _ => Ok(()),
    }
}
