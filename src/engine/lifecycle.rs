use std::collections::{BTreeMap, HashSet};

use chrono::DateTime;
use tracing::{info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::allocate::allocate;
use super::availability::resolve;
use super::catalog::check_note;
use super::occupancy::{occupied_assets, occupied_assets_of_type};
use super::repair::new_ticket;
use super::{Engine, EngineError, LockedEquipment, now_ms};

impl Engine {
    pub async fn create_reservation(&self, new: NewReservation) -> Result<Reservation, EngineError> {
        validate_new_reservation(&new)?;

        let equipment_ids: Vec<Ulid> = new.items.iter().map(|i| i.equipment_id).collect();
        let mut scope = self.begin(&equipment_ids).await?;

        let mut items = Vec::with_capacity(new.items.len());
        for item in &new.items {
            let eq = scope.locked.get(&item.equipment_id)?;
            items.push(LineItem {
                equipment_id: item.equipment_id,
                name: eq.info.name.clone(),
                quantity: item.quantity,
                assigned_assets: Vec::new(),
            });
        }

        let now = now_ms();
        let day = DateTime::from_timestamp_millis(now)
            .map(|d| d.date_naive())
            .unwrap_or(new.range.start);
        let seq = self.store.next_sequence(day);
        let reservation = Reservation {
            id: Ulid::new(),
            number: format!("RSV-{}-{seq:04}", day.format("%Y%m%d")),
            requester: new.requester,
            purpose: new.purpose,
            range: new.range,
            status: ReservationStatus::Pending,
            items,
            created_at: now,
            updated_at: now,
        };

        self.commit(&mut scope, vec![Change::ReservationSaved(reservation.clone())])
            .await?;
        info!(
            "reservation {} ({}) created for {} to {}",
            reservation.number, reservation.id, reservation.range.start, reservation.range.end
        );
        Ok(reservation)
    }

    /// Advisory per-line availability, computed against every other active
    /// reservation overlapping this one. No side effects.
    pub async fn check_availability(&self, id: Ulid) -> Result<AvailabilityReport, EngineError> {
        let current = self
            .store
            .get_reservation(&id)
            .ok_or(EngineError::reservation(id))?;
        let guards = self.read_equipment(&current.equipment_ids()).await?;
        let reservation = self
            .store
            .get_reservation(&id)
            .ok_or(EngineError::reservation(id))?;

        let mut items = Vec::with_capacity(reservation.items.len());
        for item in &reservation.items {
            let eq = guards
                .get(&item.equipment_id)
                .ok_or(EngineError::equipment(item.equipment_id))?;
            let competitors = self.competitors(eq, &reservation.range, reservation.id);
            let counts = resolve(eq, &occupied_assets(&competitors));
            items.push(LineAvailability {
                equipment_id: item.equipment_id,
                name: item.name.clone(),
                requested: item.quantity,
                remaining: counts.available,
                total: counts.total,
                broken: counts.broken,
                rented: counts.rented,
            });
        }

        Ok(AvailabilityReport {
            reservation_id: id,
            is_fully_available: items.iter().all(|i| i.remaining >= i.requested),
            items,
        })
    }

    /// Availability of one equipment type over a prospective range, before
    /// any reservation exists.
    pub async fn check_range(
        &self,
        equipment_id: Ulid,
        range: DateRange,
    ) -> Result<AvailabilityCounts, EngineError> {
        validate_range(&range)?;
        let guards = self.read_equipment(&[equipment_id]).await?;
        let eq = guards
            .get(&equipment_id)
            .ok_or(EngineError::equipment(equipment_id))?;
        // A fresh id never matches an existing reservation.
        let competitors = self.competitors(eq, &range, Ulid::nil());
        Ok(resolve(eq, &occupied_assets_of_type(&competitors, equipment_id)))
    }

    /// `set_status` for a status string from outside. Unknown values are
    /// rejected before anything is read or locked.
    pub async fn set_status_str(
        &self,
        id: Ulid,
        status: &str,
        repair_note: Option<String>,
    ) -> Result<Reservation, EngineError> {
        let target: ReservationStatus = status.parse().map_err(EngineError::UnknownStatus)?;
        self.set_status(id, target, repair_note).await
    }

    /// Move a reservation to `target`, binding, re-validating or releasing
    /// units as the transition requires. Either every effect lands in one
    /// commit or nothing changes.
    pub async fn set_status(
        &self,
        id: Ulid,
        target: ReservationStatus,
        repair_note: Option<String>,
    ) -> Result<Reservation, EngineError> {
        check_note(repair_note.as_deref())?;
        let current = self
            .store
            .get_reservation(&id)
            .ok_or(EngineError::reservation(id))?;
        let mut scope = self.begin(&current.equipment_ids()).await?;
        // Re-read under the locks; the copy above only told us what to lock.
        let mut reservation = self
            .store
            .get_reservation(&id)
            .ok_or(EngineError::reservation(id))?;
        let from = reservation.status;
        let now = now_ms();
        let mut changes = Vec::new();

        if target != ReservationStatus::Rented {
            changes.extend(release_rented_units(&scope.locked, &reservation));
        }

        match target {
            t if t.clears_assignments() => {
                for item in &mut reservation.items {
                    item.assigned_assets.clear();
                }
            }
            ReservationStatus::Approved => {
                if let Err(e) = self.bind_assets(&scope.locked, &mut reservation) {
                    record_rejection(&reservation, target, &e);
                    return Err(e);
                }
            }
            ReservationStatus::Rented => {
                if from != ReservationStatus::Approved {
                    return Err(EngineError::InvalidTransition { from, to: target });
                }
                if let Err(e) = self.revalidate(&scope.locked, &reservation) {
                    record_rejection(&reservation, target, &e);
                    return Err(e);
                }
                changes.extend(checkout_units(&scope.locked, &reservation));
            }
            ReservationStatus::Returned => {
                if let Some(note) = repair_note.filter(|n| !n.trim().is_empty()) {
                    let ticket = new_ticket(
                        Some(&reservation),
                        None,
                        DamageKind::Damaged,
                        note,
                        Some(reservation.requester.clone()),
                        now,
                    );
                    info!(
                        "repair ticket {} opened on return of {}",
                        ticket.id, reservation.number
                    );
                    changes.push(Change::RepairSaved(ticket));
                }
            }
            ReservationStatus::Pending
            | ReservationStatus::Rejected
            | ReservationStatus::Cancelled => {}
        }

        reservation.status = target;
        reservation.updated_at = now;
        changes.push(Change::ReservationSaved(reservation.clone()));
        self.commit(&mut scope, changes).await?;

        metrics::counter!(
            crate::observability::STATUS_TRANSITIONS_TOTAL,
            "from" => from.as_str(),
            "to" => target.as_str()
        )
        .increment(1);
        info!("reservation {} moved {from} -> {target}", reservation.number);
        Ok(reservation)
    }

    /// Check a reservation back in. Each submitted unit is handled on its own
    /// and reported; units that can't be matched are reported as failed while
    /// the rest still go through. Bound units not listed come back `normal`.
    pub async fn process_return(
        &self,
        id: Ulid,
        items: Vec<ReturnItem>,
    ) -> Result<ReturnReport, EngineError> {
        if items.len() > MAX_RETURN_ITEMS {
            return Err(EngineError::LimitExceeded("too many return items"));
        }
        for item in &items {
            check_note(item.note.as_deref())?;
        }
        let current = self
            .store
            .get_reservation(&id)
            .ok_or(EngineError::reservation(id))?;
        let mut scope = self.begin(&current.equipment_ids()).await?;
        let mut reservation = self
            .store
            .get_reservation(&id)
            .ok_or(EngineError::reservation(id))?;
        let from = reservation.status;
        let now = now_ms();

        let mut changes = Vec::new();
        let mut outcomes = Vec::with_capacity(items.len());
        let mut handled = HashSet::new();

        for item in items {
            if !handled.insert(item.asset_id) {
                outcomes.push(failed(item.asset_id, "listed more than once"));
                continue;
            }
            let Some(line) = reservation.line_for_asset(&item.asset_id) else {
                outcomes.push(failed(
                    item.asset_id,
                    format!("not bound to reservation {}", reservation.number),
                ));
                continue;
            };
            let Some(asset) = scope
                .locked
                .get(&line.equipment_id)?
                .asset(&item.asset_id)
                .cloned()
            else {
                outcomes.push(failed(item.asset_id, "unknown asset"));
                continue;
            };
            let effect = self.return_unit(&reservation, asset, item.condition, item.note, now, &mut changes);
            outcomes.push(ReturnOutcome {
                asset_id: item.asset_id,
                effect,
            });
        }

        let unlisted: Vec<(Ulid, Ulid)> = reservation
            .items
            .iter()
            .flat_map(|line| line.assigned_assets.iter().map(|a| (line.equipment_id, *a)))
            .filter(|(_, a)| !handled.contains(a))
            .collect();
        for (equipment_id, asset_id) in unlisted {
            let Some(asset) = scope.locked.get(&equipment_id)?.asset(&asset_id).cloned() else {
                outcomes.push(failed(asset_id, "unknown asset"));
                continue;
            };
            let effect = self.return_unit(&reservation, asset, ReturnCondition::Normal, None, now, &mut changes);
            outcomes.push(ReturnOutcome { asset_id, effect });
        }

        reservation.status = ReservationStatus::Returned;
        reservation.updated_at = now;
        changes.push(Change::ReservationSaved(reservation.clone()));
        self.commit(&mut scope, changes).await?;

        let report = ReturnReport {
            reservation_id: id,
            outcomes,
        };
        let failures = report.failures().count();
        if failures > 0 {
            metrics::counter!(crate::observability::RETURN_ITEM_FAILURES_TOTAL)
                .increment(failures as u64);
            warn!(
                "return of {} processed with {failures} failed item(s)",
                reservation.number
            );
        }
        metrics::counter!(
            crate::observability::STATUS_TRANSITIONS_TOTAL,
            "from" => from.as_str(),
            "to" => ReservationStatus::Returned.as_str()
        )
        .increment(1);
        info!(
            "reservation {} returned ({} unit(s))",
            reservation.number,
            report.outcomes.len()
        );
        Ok(report)
    }

    /// Allocate every line item against same-type competitors. Works on the
    /// caller's copy of the reservation; the first shortage aborts the lot.
    fn bind_assets(
        &self,
        locked: &LockedEquipment,
        reservation: &mut Reservation,
    ) -> Result<(), EngineError> {
        // Units picked for earlier lines of this same reservation.
        let mut claimed: HashSet<Ulid> = HashSet::new();
        let range = reservation.range;
        let id = reservation.id;
        for item in &mut reservation.items {
            let eq = locked.get(&item.equipment_id)?;
            let competitors = self.competitors(eq, &range, id);
            let mut occupied = occupied_assets_of_type(&competitors, item.equipment_id);
            occupied.extend(claimed.iter().copied());
            let picked = {
                let mut rng = self.rng();
                allocate(eq, &occupied, item.quantity, &mut *rng)?
            };
            claimed.extend(picked.iter().copied());
            item.assigned_assets = picked;
        }
        Ok(())
    }

    /// Fresh availability check before checkout: each equipment type must
    /// still cover the reservation's summed demand for it.
    fn revalidate(&self, locked: &LockedEquipment, reservation: &Reservation) -> Result<(), EngineError> {
        let mut demand: BTreeMap<Ulid, u32> = BTreeMap::new();
        for item in &reservation.items {
            *demand.entry(item.equipment_id).or_default() += item.quantity;
        }
        for (equipment_id, requested) in demand {
            let eq = locked.get(&equipment_id)?;
            let competitors = self.competitors(eq, &reservation.range, reservation.id);
            let counts = resolve(eq, &occupied_assets_of_type(&competitors, equipment_id));
            if counts.available < requested {
                return Err(EngineError::InsufficientStock {
                    equipment_name: eq.info.name.clone(),
                    requested,
                    available: counts.available,
                });
            }
        }
        Ok(())
    }

    /// Queue the changes for one returned unit and say what happened to it.
    fn return_unit(
        &self,
        reservation: &Reservation,
        mut asset: Asset,
        condition: ReturnCondition,
        note: Option<String>,
        now: Ms,
        changes: &mut Vec<Change>,
    ) -> ReturnEffect {
        changes.push(Change::HistoryAppended(HistoryRecord {
            id: Ulid::new(),
            asset_id: asset.id,
            reservation_id: Some(reservation.id),
            repair_id: None,
            event: HistoryEvent::Returned {
                condition,
                note: note.clone(),
            },
            at: now,
        }));

        let effect = match condition.damage() {
            None => {
                // A unit handed on to a later checkout stays with that one.
                if asset.is_rented_by(reservation.id) {
                    asset.set_condition(AssetCondition::Available);
                }
                ReturnEffect::Released
            }
            Some(damage) => {
                asset.set_condition(damage.holding_condition());
                asset.note = note.clone();
                match self.store.open_repair_for(&asset.id) {
                    Some(ticket_id) => ReturnEffect::RepairLinked { ticket_id },
                    None => {
                        let ticket = new_ticket(
                            Some(reservation),
                            Some(&asset),
                            damage,
                            note.unwrap_or_default(),
                            Some(reservation.requester.clone()),
                            now,
                        );
                        let ticket_id = ticket.id;
                        changes.push(Change::HistoryAppended(HistoryRecord {
                            id: Ulid::new(),
                            asset_id: asset.id,
                            reservation_id: Some(reservation.id),
                            repair_id: Some(ticket_id),
                            event: HistoryEvent::RepairOpened { damage },
                            at: now,
                        }));
                        changes.push(Change::RepairSaved(ticket));
                        ReturnEffect::RepairOpened { ticket_id }
                    }
                }
            }
        };
        changes.push(Change::AssetSaved(asset));
        effect
    }
}

/// Units this reservation has out go back to `available`. Units out with
/// another reservation are left alone.
fn release_rented_units(locked: &LockedEquipment, reservation: &Reservation) -> Vec<Change> {
    bound_units(locked, reservation)
        .filter(|asset| asset.is_rented_by(reservation.id))
        .map(|mut asset| {
            asset.set_condition(AssetCondition::Available);
            Change::AssetSaved(asset)
        })
        .collect()
}

/// Checkout marks bound units `rented` by this reservation. A unit still out
/// with an earlier, non-overlapping reservation is handed over.
fn checkout_units(locked: &LockedEquipment, reservation: &Reservation) -> Vec<Change> {
    bound_units(locked, reservation)
        .filter(|asset| match asset.condition {
            AssetCondition::Available => true,
            AssetCondition::Rented => asset.rented_by != Some(reservation.id),
            _ => false,
        })
        .map(|mut asset| {
            asset.check_out(reservation.id);
            Change::AssetSaved(asset)
        })
        .collect()
}

fn bound_units<'a>(
    locked: &'a LockedEquipment,
    reservation: &'a Reservation,
) -> impl Iterator<Item = Asset> + 'a {
    reservation.items.iter().flat_map(move |line| {
        line.assigned_assets.iter().filter_map(move |asset_id| {
            locked
                .get(&line.equipment_id)
                .ok()
                .and_then(|eq| eq.asset(asset_id))
                .cloned()
        })
    })
}

fn failed(asset_id: Ulid, reason: impl Into<String>) -> ReturnOutcome {
    ReturnOutcome {
        asset_id,
        effect: ReturnEffect::Failed {
            reason: reason.into(),
        },
    }
}

fn record_rejection(reservation: &Reservation, target: ReservationStatus, err: &EngineError) {
    if matches!(err, EngineError::InsufficientStock { .. }) {
        metrics::counter!(crate::observability::INSUFFICIENT_STOCK_TOTAL, "to" => target.as_str())
            .increment(1);
    }
    warn!("reservation {} -> {target} rejected: {err}", reservation.number);
}

pub(super) fn validate_range(range: &DateRange) -> Result<(), EngineError> {
    if range.start >= range.end {
        return Err(EngineError::InvalidInput("range must end after it starts"));
    }
    if range.days() > MAX_RESERVATION_DAYS {
        return Err(EngineError::LimitExceeded("reservation range too long"));
    }
    Ok(())
}

fn validate_new_reservation(new: &NewReservation) -> Result<(), EngineError> {
    validate_range(&new.range)?;
    if new.items.is_empty() {
        return Err(EngineError::InvalidInput("reservation has no line items"));
    }
    if new.items.len() > MAX_LINE_ITEMS {
        return Err(EngineError::LimitExceeded("too many line items"));
    }
    for item in &new.items {
        if item.quantity == 0 {
            return Err(EngineError::InvalidInput("line item quantity must be at least 1"));
        }
        if item.quantity > MAX_QUANTITY_PER_ITEM {
            return Err(EngineError::LimitExceeded("line item quantity too large"));
        }
    }
    if new.purpose.len() > MAX_TEXT_LEN {
        return Err(EngineError::LimitExceeded("purpose too long"));
    }
    if new.requester.name.len() > MAX_NAME_LEN || new.requester.user_id.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("requester name too long"));
    }
    Ok(())
}
