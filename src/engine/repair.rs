use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::catalog::check_note;
use super::{Engine, EngineError, now_ms};

/// A fresh ticket in `damage_confirmed`.
pub(super) fn new_ticket(
    reservation: Option<&Reservation>,
    asset: Option<&Asset>,
    damage: DamageKind,
    description: String,
    requester: Option<Requester>,
    now: Ms,
) -> RepairTicket {
    RepairTicket {
        id: Ulid::new(),
        reservation_id: reservation.map(|r| r.id),
        equipment_id: asset.map(|a| a.equipment_id),
        asset_id: asset.map(|a| a.id),
        requester,
        stage: RepairStage::DamageConfirmed,
        damage,
        description,
        damage_confirmed_at: now,
        charge_decided_at: None,
        estimate_requested_at: None,
        payment_confirmed_at: None,
        completed_at: None,
        is_fixed: false,
        charge: None,
        estimate_memo: None,
        final_amount: None,
        repair_result: None,
        result_memo: None,
        created_at: now,
        updated_at: now,
    }
}

impl Engine {
    /// Staff-opened ticket. A referenced asset goes to `maintenance` and may
    /// not already have an open ticket.
    pub async fn create_repair(&self, new: NewRepair) -> Result<RepairTicket, EngineError> {
        if new.description.len() > MAX_TEXT_LEN {
            return Err(EngineError::LimitExceeded("repair description too long"));
        }
        let reservation = match new.reservation_id {
            Some(id) => Some(
                self.store
                    .get_reservation(&id)
                    .ok_or(EngineError::reservation(id))?,
            ),
            None => None,
        };
        let equipment_id = match new.asset_id {
            Some(asset_id) => Some(
                self.store
                    .equipment_for_asset(&asset_id)
                    .ok_or(EngineError::asset(asset_id))?,
            ),
            None => None,
        };

        let mut scope = self.begin(equipment_id.as_slice()).await?;
        let now = now_ms();
        let requester = new
            .requester
            .or_else(|| reservation.as_ref().map(|r| r.requester.clone()));
        let mut changes = Vec::new();

        let asset = match (new.asset_id, equipment_id) {
            (Some(asset_id), Some(equipment_id)) => {
                if let Some(ticket_id) = self.store.open_repair_for(&asset_id) {
                    return Err(EngineError::RepairAlreadyOpen {
                        asset_id,
                        ticket_id,
                    });
                }
                let mut asset = scope
                    .locked
                    .get(&equipment_id)?
                    .asset(&asset_id)
                    .cloned()
                    .ok_or(EngineError::asset(asset_id))?;
                asset.set_condition(AssetCondition::Maintenance);
                Some(asset)
            }
            _ => None,
        };

        let ticket = new_ticket(
            reservation.as_ref(),
            asset.as_ref(),
            new.damage,
            new.description,
            requester,
            now,
        );
        if let Some(asset) = asset {
            changes.push(Change::HistoryAppended(HistoryRecord {
                id: Ulid::new(),
                asset_id: asset.id,
                reservation_id: ticket.reservation_id,
                repair_id: Some(ticket.id),
                event: HistoryEvent::RepairOpened { damage: new.damage },
                at: now,
            }));
            changes.push(Change::AssetSaved(asset));
        }
        changes.push(Change::RepairSaved(ticket.clone()));
        self.commit(&mut scope, changes).await?;

        info!("repair ticket {} opened", ticket.id);
        Ok(ticket)
    }

    /// Move a ticket one stage forward, stamping that stage's payload.
    /// Completing a ticket also settles its asset.
    pub async fn advance_repair(
        &self,
        id: Ulid,
        payload: StagePayload,
    ) -> Result<RepairTicket, EngineError> {
        check_payload(&payload)?;
        let target = payload.stage();
        let current = self.store.get_repair(&id).ok_or(EngineError::repair(id))?;
        let equipment_id = match (target, current.asset_id) {
            (RepairStage::Completed, Some(asset_id)) => self.store.equipment_for_asset(&asset_id),
            _ => None,
        };

        let mut scope = self.begin(equipment_id.as_slice()).await?;
        let lock = self.store.repair_lock(id);
        let _ticket_guard = lock.lock().await;
        let mut ticket = self.store.get_repair(&id).ok_or(EngineError::repair(id))?;
        let from = ticket.stage;
        if from.next() != Some(target) {
            return Err(EngineError::InvalidStage { from, to: target });
        }

        let now = now_ms();
        let mut changes = Vec::new();
        match payload {
            StagePayload::ChargeDecided { charge } => {
                ticket.charge = Some(charge);
                ticket.charge_decided_at = Some(now);
            }
            StagePayload::EstimateRequested { memo } => {
                ticket.estimate_memo = Some(memo);
                ticket.estimate_requested_at = Some(now);
            }
            StagePayload::PaymentConfirmed { amount } => {
                ticket.final_amount = Some(amount);
                ticket.payment_confirmed_at = Some(now);
            }
            StagePayload::Completed { result, memo } => {
                ticket.is_fixed = true;
                ticket.repair_result = Some(result);
                ticket.completed_at = Some(now);
                if let (Some(asset_id), Some(equipment_id)) = (ticket.asset_id, equipment_id) {
                    if let Some(mut asset) =
                        scope.locked.get(&equipment_id)?.asset(&asset_id).cloned()
                    {
                        match result {
                            RepairResult::Repaired => {
                                asset.set_condition(AssetCondition::Available);
                                asset.note = None;
                            }
                            RepairResult::Unrepairable => {
                                asset.set_condition(AssetCondition::Broken);
                                asset.note = Some(match &memo {
                                    Some(m) if !m.trim().is_empty() => format!("unrepairable: {m}"),
                                    _ => format!("unrepairable (repair {id})"),
                                });
                            }
                        }
                        changes.push(Change::AssetSaved(asset));
                        changes.push(Change::HistoryAppended(HistoryRecord {
                            id: Ulid::new(),
                            asset_id,
                            reservation_id: ticket.reservation_id,
                            repair_id: Some(id),
                            event: HistoryEvent::RepairCompleted { result },
                            at: now,
                        }));
                    }
                }
                ticket.result_memo = memo;
            }
        }
        ticket.stage = target;
        ticket.updated_at = now;
        changes.push(Change::RepairSaved(ticket.clone()));
        self.commit(&mut scope, changes).await?;

        metrics::counter!(crate::observability::REPAIR_STAGE_CHANGES_TOTAL, "to" => target.as_str())
            .increment(1);
        info!("repair ticket {id} moved {from} -> {target}");
        Ok(ticket)
    }

    pub async fn complete_repair(
        &self,
        id: Ulid,
        result: RepairResult,
        memo: Option<String>,
    ) -> Result<RepairTicket, EngineError> {
        self.advance_repair(id, StagePayload::Completed { result, memo })
            .await
    }

    /// Put a ticket back to a strictly earlier stage. Only the stage moves;
    /// the asset and the stamped payloads stay as they are.
    pub async fn revert_stage(
        &self,
        id: Ulid,
        target: RepairStage,
    ) -> Result<RepairTicket, EngineError> {
        let current = self.store.get_repair(&id).ok_or(EngineError::repair(id))?;
        // Reopening a completed ticket competes with create_repair for the
        // asset's open slot, so it takes the same equipment lock.
        let equipment_id = match (current.stage, current.asset_id) {
            (RepairStage::Completed, Some(asset_id)) => self.store.equipment_for_asset(&asset_id),
            _ => None,
        };

        let mut scope = self.begin(equipment_id.as_slice()).await?;
        let lock = self.store.repair_lock(id);
        let _ticket_guard = lock.lock().await;
        let mut ticket = self.store.get_repair(&id).ok_or(EngineError::repair(id))?;
        let from = ticket.stage;
        if target >= from {
            return Err(EngineError::InvalidStage { from, to: target });
        }
        if let (false, Some(asset_id)) = (ticket.is_open(), ticket.asset_id) {
            if let Some(ticket_id) = self.store.open_repair_for(&asset_id) {
                return Err(EngineError::RepairAlreadyOpen {
                    asset_id,
                    ticket_id,
                });
            }
        }

        ticket.stage = target;
        ticket.updated_at = now_ms();
        self.commit(&mut scope, vec![Change::RepairSaved(ticket.clone())])
            .await?;

        metrics::counter!(crate::observability::REPAIR_STAGE_CHANGES_TOTAL, "to" => target.as_str())
            .increment(1);
        info!("repair ticket {id} reverted {from} -> {target}");
        Ok(ticket)
    }
}

fn check_payload(payload: &StagePayload) -> Result<(), EngineError> {
    match payload {
        StagePayload::EstimateRequested { memo } => check_note(Some(memo.as_str())),
        StagePayload::Completed { memo, .. } => check_note(memo.as_deref()),
        StagePayload::ChargeDecided { .. } | StagePayload::PaymentConfirmed { .. } => Ok(()),
    }
}
