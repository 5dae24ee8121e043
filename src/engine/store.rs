use std::sync::Arc;

use chrono::{DateTime, NaiveDate};
use dashmap::DashMap;
use tokio::sync::Mutex;
use ulid::Ulid;

use crate::model::*;

use super::SharedEquipmentState;

/// The document store: get-by-id, insert/patch, and the few index queries the
/// allocator needs. Equipment state sits behind per-type locks; the other
/// collections are plain records guarded by the equipment locks of whoever
/// mutates them.
pub struct InMemoryStore {
    equipment: DashMap<Ulid, SharedEquipmentState>,
    asset_to_equipment: DashMap<Ulid, Ulid>,
    reservations: DashMap<Ulid, Reservation>,
    repairs: DashMap<Ulid, RepairTicket>,
    repair_locks: DashMap<Ulid, Arc<Mutex<()>>>,
    /// asset id → the one ticket not yet completed
    open_repairs: DashMap<Ulid, Ulid>,
    history: DashMap<Ulid, Vec<HistoryRecord>>,
    daily_sequence: DashMap<NaiveDate, u32>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            equipment: DashMap::new(),
            asset_to_equipment: DashMap::new(),
            reservations: DashMap::new(),
            repairs: DashMap::new(),
            repair_locks: DashMap::new(),
            open_repairs: DashMap::new(),
            history: DashMap::new(),
            daily_sequence: DashMap::new(),
        }
    }

    // ── Equipment ────────────────────────────────────────────

    pub fn equipment_count(&self) -> usize {
        self.equipment.len()
    }

    pub fn contains_equipment(&self, id: &Ulid) -> bool {
        self.equipment.contains_key(id)
    }

    pub fn get_equipment(&self, id: &Ulid) -> Option<SharedEquipmentState> {
        self.equipment.get(id).map(|e| e.value().clone())
    }

    /// Returns false if the id was already taken.
    pub fn insert_equipment(&self, id: Ulid, state: SharedEquipmentState) -> bool {
        match self.equipment.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(state);
                true
            }
        }
    }

    pub fn equipment_ids(&self) -> Vec<Ulid> {
        let mut ids: Vec<Ulid> = self.equipment.iter().map(|e| *e.key()).collect();
        ids.sort();
        ids
    }

    // ── Asset index ──────────────────────────────────────────

    pub fn equipment_for_asset(&self, asset_id: &Ulid) -> Option<Ulid> {
        self.asset_to_equipment.get(asset_id).map(|e| *e.value())
    }

    pub fn map_asset(&self, asset_id: Ulid, equipment_id: Ulid) {
        self.asset_to_equipment.insert(asset_id, equipment_id);
    }

    // ── Reservations ─────────────────────────────────────────

    pub fn get_reservation(&self, id: &Ulid) -> Option<Reservation> {
        self.reservations.get(id).map(|e| e.value().clone())
    }

    pub fn put_reservation(&self, reservation: Reservation) {
        self.reservations.insert(reservation.id, reservation);
    }

    pub fn reservations(&self) -> Vec<Reservation> {
        let mut all: Vec<Reservation> =
            self.reservations.iter().map(|e| e.value().clone()).collect();
        all.sort_by_key(|r| r.id);
        all
    }

    /// Next per-day sequence number for human-readable reservation numbers.
    pub fn next_sequence(&self, day: NaiveDate) -> u32 {
        let mut seq = self.daily_sequence.entry(day).or_insert(0);
        *seq += 1;
        *seq
    }

    /// Make sure future numbers for `day` start after `seq`.
    pub fn observe_sequence(&self, day: NaiveDate, seq: u32) {
        let mut current = self.daily_sequence.entry(day).or_insert(0);
        if *current < seq {
            *current = seq;
        }
    }

    /// Restore the per-day counters from stored reservation numbers (after replay).
    pub fn rebuild_sequences(&self) {
        for entry in self.reservations.iter() {
            let r = entry.value();
            let day = DateTime::from_timestamp_millis(r.created_at).map(|d| d.date_naive());
            let seq = r.number.rsplit('-').next().and_then(|s| s.parse::<u32>().ok());
            if let (Some(day), Some(seq)) = (day, seq) {
                self.observe_sequence(day, seq);
            }
        }
    }

    // ── Repairs ──────────────────────────────────────────────

    pub fn get_repair(&self, id: &Ulid) -> Option<RepairTicket> {
        self.repairs.get(id).map(|e| e.value().clone())
    }

    /// Insert or replace a ticket, keeping the open-ticket index in step.
    pub fn put_repair(&self, ticket: RepairTicket) {
        if let Some(asset_id) = ticket.asset_id {
            if ticket.is_open() {
                self.open_repairs.insert(asset_id, ticket.id);
            } else {
                self.open_repairs
                    .remove_if(&asset_id, |_, ticket_id| *ticket_id == ticket.id);
            }
        }
        self.repairs.insert(ticket.id, ticket);
    }

    pub fn repairs(&self) -> Vec<RepairTicket> {
        let mut all: Vec<RepairTicket> = self.repairs.iter().map(|e| e.value().clone()).collect();
        all.sort_by_key(|t| t.id);
        all
    }

    pub fn open_repair_for(&self, asset_id: &Ulid) -> Option<Ulid> {
        self.open_repairs.get(asset_id).map(|e| *e.value())
    }

    /// Per-ticket mutex serializing stage changes.
    pub fn repair_lock(&self, id: Ulid) -> Arc<Mutex<()>> {
        self.repair_locks.entry(id).or_default().value().clone()
    }

    // ── History ──────────────────────────────────────────────

    pub fn append_history(&self, record: HistoryRecord) {
        self.history.entry(record.asset_id).or_default().push(record);
    }

    pub fn history_for(&self, asset_id: &Ulid) -> Vec<HistoryRecord> {
        self.history
            .get(asset_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    pub fn history_asset_ids(&self) -> Vec<Ulid> {
        let mut ids: Vec<Ulid> = self.history.iter().map(|e| *e.key()).collect();
        ids.sort();
        ids
    }
}
