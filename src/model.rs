use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. Every record timestamp uses this.
pub type Ms = i64;

/// Reservation date range `[start, end)`. `end` is the return day, so a unit
/// returned on day N can go out again on day N.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        debug_assert!(start < end, "DateRange start must be before end");
        Self { start, end }
    }

    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days()
    }
}

// ── Catalog ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EquipmentType {
    pub id: Ulid,
    pub name: String,
}

/// Condition of one physical unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetCondition {
    Available,
    Maintenance,
    Broken,
    Lost,
    Repair,
    Retired,
    /// Physically out with a `rented` reservation.
    Rented,
}

impl AssetCondition {
    /// Unusable units never count toward availability, whatever the calendar says.
    pub fn is_broken(self) -> bool {
        matches!(
            self,
            AssetCondition::Maintenance
                | AssetCondition::Broken
                | AssetCondition::Lost
                | AssetCondition::Repair
                | AssetCondition::Retired
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    pub id: Ulid,
    pub equipment_id: Ulid,
    pub condition: AssetCondition,
    pub note: Option<String>,
    /// Reservation that has the unit out. Set only while `rented`.
    pub rented_by: Option<Ulid>,
}

impl Asset {
    /// Change condition outside of checkout; drops any rental owner.
    pub fn set_condition(&mut self, condition: AssetCondition) {
        self.condition = condition;
        self.rented_by = None;
    }

    pub fn check_out(&mut self, reservation_id: Ulid) {
        self.condition = AssetCondition::Rented;
        self.rented_by = Some(reservation_id);
    }

    pub fn is_rented_by(&self, reservation_id: Ulid) -> bool {
        self.condition == AssetCondition::Rented && self.rented_by == Some(reservation_id)
    }
}

// ── Reservations ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Pending,
    Approved,
    Rented,
    Returned,
    Rejected,
    Cancelled,
}

impl ReservationStatus {
    /// Only active reservations occupy stock.
    pub fn is_active(self) -> bool {
        matches!(self, ReservationStatus::Approved | ReservationStatus::Rented)
    }

    /// Entering one of these statuses empties every line item's bindings.
    pub fn clears_assignments(self) -> bool {
        matches!(
            self,
            ReservationStatus::Pending | ReservationStatus::Rejected | ReservationStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ReservationStatus::Pending => "pending",
            ReservationStatus::Approved => "approved",
            ReservationStatus::Rented => "rented",
            ReservationStatus::Returned => "returned",
            ReservationStatus::Rejected => "rejected",
            ReservationStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReservationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ReservationStatus::Pending),
            "approved" => Ok(ReservationStatus::Approved),
            "rented" => Ok(ReservationStatus::Rented),
            "returned" => Ok(ReservationStatus::Returned),
            "rejected" => Ok(ReservationStatus::Rejected),
            "cancelled" => Ok(ReservationStatus::Cancelled),
            other => Err(other.to_string()),
        }
    }
}

/// Snapshot of the person who asked for the gear.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requester {
    pub user_id: String,
    pub name: String,
    pub contact: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    pub equipment_id: Ulid,
    /// Equipment name at the time the reservation was made.
    pub name: String,
    pub quantity: u32,
    pub assigned_assets: Vec<Ulid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    /// Human-readable number, e.g. `RSV-20260301-0004`.
    pub number: String,
    pub requester: Requester,
    pub purpose: String,
    pub range: DateRange,
    pub status: ReservationStatus,
    pub items: Vec<LineItem>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl Reservation {
    /// Distinct equipment types referenced by the line items, sorted.
    pub fn equipment_ids(&self) -> Vec<Ulid> {
        let mut ids: Vec<Ulid> = self.items.iter().map(|i| i.equipment_id).collect();
        ids.sort();
        ids.dedup();
        ids
    }

    pub fn bound_assets(&self) -> impl Iterator<Item = &Ulid> {
        self.items.iter().flat_map(|i| i.assigned_assets.iter())
    }

    pub fn line_for_asset(&self, asset_id: &Ulid) -> Option<&LineItem> {
        self.items
            .iter()
            .find(|i| i.assigned_assets.contains(asset_id))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewLineItem {
    pub equipment_id: Ulid,
    pub quantity: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewReservation {
    pub requester: Requester,
    pub purpose: String,
    pub range: DateRange,
    pub items: Vec<NewLineItem>,
}

// ── Returns ──────────────────────────────────────────────────────

/// Condition a unit came back in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReturnCondition {
    Normal,
    Damaged,
    Broken,
    Lost,
}

impl ReturnCondition {
    pub fn damage(self) -> Option<DamageKind> {
        match self {
            ReturnCondition::Normal => None,
            ReturnCondition::Damaged => Some(DamageKind::Damaged),
            ReturnCondition::Broken => Some(DamageKind::Broken),
            ReturnCondition::Lost => Some(DamageKind::Lost),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReturnItem {
    pub asset_id: Ulid,
    pub condition: ReturnCondition,
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReturnEffect {
    /// Unit back in stock.
    Released,
    RepairOpened { ticket_id: Ulid },
    /// Unit already had an open ticket; no second one was created.
    RepairLinked { ticket_id: Ulid },
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReturnOutcome {
    pub asset_id: Ulid,
    pub effect: ReturnEffect,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReturnReport {
    pub reservation_id: Ulid,
    pub outcomes: Vec<ReturnOutcome>,
}

impl ReturnReport {
    pub fn failures(&self) -> impl Iterator<Item = &ReturnOutcome> {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.effect, ReturnEffect::Failed { .. }))
    }

    pub fn is_complete(&self) -> bool {
        self.failures().next().is_none()
    }
}

// ── Repairs ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairStage {
    DamageConfirmed,
    ChargeDecided,
    EstimateRequested,
    PaymentConfirmed,
    Completed,
}

impl RepairStage {
    pub fn index(self) -> usize {
        match self {
            RepairStage::DamageConfirmed => 0,
            RepairStage::ChargeDecided => 1,
            RepairStage::EstimateRequested => 2,
            RepairStage::PaymentConfirmed => 3,
            RepairStage::Completed => 4,
        }
    }

    pub fn next(self) -> Option<RepairStage> {
        match self {
            RepairStage::DamageConfirmed => Some(RepairStage::ChargeDecided),
            RepairStage::ChargeDecided => Some(RepairStage::EstimateRequested),
            RepairStage::EstimateRequested => Some(RepairStage::PaymentConfirmed),
            RepairStage::PaymentConfirmed => Some(RepairStage::Completed),
            RepairStage::Completed => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RepairStage::DamageConfirmed => "damage_confirmed",
            RepairStage::ChargeDecided => "charge_decided",
            RepairStage::EstimateRequested => "estimate_requested",
            RepairStage::PaymentConfirmed => "payment_confirmed",
            RepairStage::Completed => "completed",
        }
    }
}

impl fmt::Display for RepairStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DamageKind {
    Damaged,
    Broken,
    Lost,
}

impl DamageKind {
    /// Condition the unit is parked in while the ticket is open.
    pub fn holding_condition(self) -> AssetCondition {
        match self {
            DamageKind::Lost => AssetCondition::Lost,
            DamageKind::Damaged | DamageKind::Broken => AssetCondition::Maintenance,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChargeDecision {
    Free,
    Charged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairResult {
    Repaired,
    Unrepairable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairTicket {
    pub id: Ulid,
    pub reservation_id: Option<Ulid>,
    pub equipment_id: Option<Ulid>,
    pub asset_id: Option<Ulid>,
    pub requester: Option<Requester>,
    pub stage: RepairStage,
    pub damage: DamageKind,
    pub description: String,
    pub damage_confirmed_at: Ms,
    pub charge_decided_at: Option<Ms>,
    pub estimate_requested_at: Option<Ms>,
    pub payment_confirmed_at: Option<Ms>,
    pub completed_at: Option<Ms>,
    pub is_fixed: bool,
    pub charge: Option<ChargeDecision>,
    pub estimate_memo: Option<String>,
    /// Minor currency units.
    pub final_amount: Option<u64>,
    pub repair_result: Option<RepairResult>,
    pub result_memo: Option<String>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl RepairTicket {
    pub fn is_open(&self) -> bool {
        self.stage != RepairStage::Completed
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewRepair {
    pub reservation_id: Option<Ulid>,
    pub asset_id: Option<Ulid>,
    pub damage: DamageKind,
    pub description: String,
    pub requester: Option<Requester>,
}

/// Payload for one forward step of the repair workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum StagePayload {
    ChargeDecided { charge: ChargeDecision },
    EstimateRequested { memo: String },
    PaymentConfirmed { amount: u64 },
    Completed { result: RepairResult, memo: Option<String> },
}

impl StagePayload {
    pub fn stage(&self) -> RepairStage {
        match self {
            StagePayload::ChargeDecided { .. } => RepairStage::ChargeDecided,
            StagePayload::EstimateRequested { .. } => RepairStage::EstimateRequested,
            StagePayload::PaymentConfirmed { .. } => RepairStage::PaymentConfirmed,
            StagePayload::Completed { .. } => RepairStage::Completed,
        }
    }
}

// ── Asset history ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryEvent {
    Returned { condition: ReturnCondition, note: Option<String> },
    RepairOpened { damage: DamageKind },
    RepairCompleted { result: RepairResult },
}

/// Write-once log row for one asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub id: Ulid,
    pub asset_id: Ulid,
    pub reservation_id: Option<Ulid>,
    pub repair_id: Option<Ulid>,
    pub event: HistoryEvent,
    pub at: Ms,
}

// ── Per-equipment state ──────────────────────────────────────────

/// Index entry: a reservation holding at least one line item of this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BookingRef {
    pub reservation_id: Ulid,
    pub range: DateRange,
}

/// Everything the allocator needs for one equipment type. Lives behind a
/// per-type lock; all commits touching the type hold it for writing.
#[derive(Debug, Clone)]
pub struct EquipmentState {
    pub info: EquipmentType,
    pub assets: Vec<Asset>,
    /// Active reservations referencing this type, sorted by `range.start`.
    pub bookings: Vec<BookingRef>,
}

impl EquipmentState {
    pub fn new(info: EquipmentType) -> Self {
        Self {
            info,
            assets: Vec::new(),
            bookings: Vec::new(),
        }
    }

    pub fn asset(&self, id: &Ulid) -> Option<&Asset> {
        self.assets.iter().find(|a| a.id == *id)
    }

    /// Insert or replace a unit.
    pub fn put_asset(&mut self, asset: Asset) {
        match self.assets.iter_mut().find(|a| a.id == asset.id) {
            Some(slot) => *slot = asset,
            None => self.assets.push(asset),
        }
    }

    /// Index a reservation, keeping sort order by range start. Idempotent.
    pub fn insert_booking(&mut self, booking: BookingRef) {
        if self
            .bookings
            .iter()
            .any(|b| b.reservation_id == booking.reservation_id)
        {
            return;
        }
        let pos = self
            .bookings
            .partition_point(|b| b.range.start <= booking.range.start);
        self.bookings.insert(pos, booking);
    }

    pub fn remove_booking(&mut self, reservation_id: &Ulid) {
        self.bookings.retain(|b| b.reservation_id != *reservation_id);
    }

    /// Reservations whose range may overlap `query`. Binary search skips
    /// everything starting at or after `query.end`.
    pub fn bookings_overlapping(&self, query: &DateRange) -> impl Iterator<Item = &BookingRef> {
        let right_bound = self.bookings.partition_point(|b| b.range.start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.range.end > query.start)
    }
}

// ── WAL records ──────────────────────────────────────────────────

/// One record change. Records are written whole; the latest copy wins on replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Change {
    EquipmentCreated(EquipmentType),
    AssetSaved(Asset),
    ReservationSaved(Reservation),
    RepairSaved(RepairTicket),
    HistoryAppended(HistoryRecord),
}

/// The WAL record format: every change a single operation makes, applied
/// together or not at all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub at: Ms,
    pub changes: Vec<Change>,
}

// ── Query result types ───────────────────────────────────────────

/// Partition of one equipment type's units against an occupied set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityCounts {
    pub total: u32,
    pub broken: u32,
    pub rented: u32,
    pub available: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineAvailability {
    pub equipment_id: Ulid,
    pub name: String,
    pub requested: u32,
    pub remaining: u32,
    pub total: u32,
    pub broken: u32,
    pub rented: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityReport {
    pub reservation_id: Ulid,
    pub is_fully_available: bool,
    pub items: Vec<LineAvailability>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EquipmentInfo {
    pub id: Ulid,
    pub name: String,
    pub total_units: u32,
}
