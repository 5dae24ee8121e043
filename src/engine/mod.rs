mod allocate;
mod availability;
mod catalog;
mod error;
mod lifecycle;
mod occupancy;
mod overlap;
mod queries;
mod repair;
mod store;
#[cfg(test)]
mod tests;

pub use allocate::allocate;
pub use availability::{available_units, resolve};
pub use error::EngineError;
pub use occupancy::{occupied_assets, occupied_assets_of_type};
pub use overlap::{find_overlapping, overlaps};
pub use store::InMemoryStore;

use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, MutexGuard, PoisonError};

use rand::SeedableRng;
use rand::rngs::StdRng;
use tokio::sync::{
    Mutex, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock, RwLockReadGuard, mpsc, oneshot,
};
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

pub type SharedEquipmentState = Arc<RwLock<EquipmentState>>;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or_default()
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        commit: Commit,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        commits: Vec<Commit>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond Ok to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { commit, response } => {
                let mut batch = vec![(commit, response)];

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { commit, response }) => {
                            batch.push((commit, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            flush_and_respond(&mut wal, &mut batch);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                if !batch.is_empty() {
                    flush_and_respond(&mut wal, &mut batch);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

type PendingAppend = (Commit, oneshot::Sender<io::Result<()>>);

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (commit, _) in batch {
        if let Err(e) = wal.append_buffered(commit) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush, even on append error, so partially buffered bytes
    // don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { commits, response } => {
            let result = Wal::write_compact_file(wal.path(), &commits)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

// ── Lock scopes ──────────────────────────────────────────

/// Write guards on a set of equipment types, acquired in id order.
pub(super) struct LockedEquipment {
    guards: BTreeMap<Ulid, OwnedRwLockWriteGuard<EquipmentState>>,
}

impl LockedEquipment {
    pub(super) fn get(&self, id: &Ulid) -> Result<&EquipmentState, EngineError> {
        self.guards
            .get(id)
            .map(|g| &**g)
            .ok_or(EngineError::equipment(*id))
    }

    fn get_mut(&mut self, id: &Ulid) -> Option<&mut EquipmentState> {
        self.guards.get_mut(id).map(|g| &mut **g)
    }

    /// Uncontended locks for replay. Never blocks: nothing else holds the
    /// locks while the engine is being built.
    fn for_replay(store: &InMemoryStore, ids: &[Ulid]) -> Self {
        let mut guards = BTreeMap::new();
        for id in ids {
            if let Some(eq) = store.get_equipment(id) {
                let guard = eq.try_write_owned().expect("replay: uncontended write");
                guards.insert(*id, guard);
            }
        }
        Self { guards }
    }
}

/// Everything a mutating operation holds between its reads and its commit.
/// The gate is shared by all commits and taken exclusively by compaction.
pub(super) struct CommitScope<'a> {
    _gate: RwLockReadGuard<'a, ()>,
    pub(super) locked: LockedEquipment,
}

/// Apply one change to the store. The caller holds write locks on every
/// equipment type the change touches.
fn apply_change(store: &InMemoryStore, locked: &mut LockedEquipment, change: &Change) {
    match change {
        Change::EquipmentCreated(info) => {
            let state = EquipmentState::new(info.clone());
            if !store.insert_equipment(info.id, Arc::new(RwLock::new(state))) {
                tracing::warn!("equipment type {} already present, record ignored", info.id);
            }
        }
        Change::AssetSaved(asset) => {
            store.map_asset(asset.id, asset.equipment_id);
            if let Some(eq) = locked.get_mut(&asset.equipment_id) {
                eq.put_asset(asset.clone());
            }
        }
        Change::ReservationSaved(reservation) => {
            for equipment_id in reservation.equipment_ids() {
                let Some(eq) = locked.get_mut(&equipment_id) else {
                    continue;
                };
                // Only reservations that can hold stock stay in the date index.
                if reservation.status.is_active() {
                    eq.insert_booking(BookingRef {
                        reservation_id: reservation.id,
                        range: reservation.range,
                    });
                } else {
                    eq.remove_booking(&reservation.id);
                }
            }
            store.put_reservation(reservation.clone());
        }
        Change::RepairSaved(ticket) => store.put_repair(ticket.clone()),
        Change::HistoryAppended(record) => store.append_history(record.clone()),
    }
}

/// Equipment types whose lock a change needs.
fn change_equipment_ids(change: &Change) -> Vec<Ulid> {
    match change {
        Change::AssetSaved(asset) => vec![asset.equipment_id],
        Change::ReservationSaved(reservation) => reservation.equipment_ids(),
        Change::EquipmentCreated(_) | Change::RepairSaved(_) | Change::HistoryAppended(_) => {
            Vec::new()
        }
    }
}

pub struct Engine {
    pub(super) store: InMemoryStore,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    rng: std::sync::Mutex<StdRng>,
    commit_gate: RwLock<()>,
    /// Serializes id checks for new equipment types and units. Taken before
    /// the commit gate.
    pub(super) catalog: Mutex<()>,
}

impl Engine {
    /// Open the engine, replaying `wal_path`. `seed` fixes the allocation
    /// shuffle; `None` seeds from the OS.
    pub fn new(wal_path: PathBuf, seed: Option<u64>) -> io::Result<Self> {
        let commits = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let engine = Self {
            store: InMemoryStore::new(),
            wal_tx,
            rng: std::sync::Mutex::new(rng),
            commit_gate: RwLock::new(()),
            catalog: Mutex::new(()),
        };

        // Replay: we're the sole owner of every lock, so try_write always
        // succeeds. Never use blocking_write here; this may run inside a runtime.
        for commit in &commits {
            for change in &commit.changes {
                let ids = change_equipment_ids(change);
                let mut locked = LockedEquipment::for_replay(&engine.store, &ids);
                apply_change(&engine.store, &mut locked, change);
            }
        }
        engine.store.rebuild_sequences();

        Ok(engine)
    }

    /// Write a commit to the WAL via the background group-commit writer.
    async fn wal_append(&self, commit: &Commit) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                commit: commit.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_equipment_state(&self, id: &Ulid) -> Option<SharedEquipmentState> {
        self.store.get_equipment(id)
    }

    /// Take the commit gate and write locks on `equipment_ids` (sorted, deduped).
    pub(super) async fn begin(&self, equipment_ids: &[Ulid]) -> Result<CommitScope<'_>, EngineError> {
        let gate = self.commit_gate.read().await;
        let mut ids = equipment_ids.to_vec();
        ids.sort();
        ids.dedup();
        let mut guards = BTreeMap::new();
        for id in ids {
            let eq = self
                .store
                .get_equipment(&id)
                .ok_or(EngineError::equipment(id))?;
            guards.insert(id, eq.write_owned().await);
        }
        Ok(CommitScope {
            _gate: gate,
            locked: LockedEquipment { guards },
        })
    }

    /// Read guards for advisory checks. Snapshot consistency only.
    pub(super) async fn read_equipment(
        &self,
        equipment_ids: &[Ulid],
    ) -> Result<BTreeMap<Ulid, OwnedRwLockReadGuard<EquipmentState>>, EngineError> {
        let mut ids = equipment_ids.to_vec();
        ids.sort();
        ids.dedup();
        let mut guards = BTreeMap::new();
        for id in ids {
            let eq = self
                .store
                .get_equipment(&id)
                .ok_or(EngineError::equipment(id))?;
            guards.insert(id, eq.read_owned().await);
        }
        Ok(guards)
    }

    /// WAL-append + apply in one step. Nothing is applied if the append fails.
    pub(super) async fn commit(
        &self,
        scope: &mut CommitScope<'_>,
        changes: Vec<Change>,
    ) -> Result<(), EngineError> {
        if changes.is_empty() {
            return Ok(());
        }
        let commit = Commit {
            at: now_ms(),
            changes,
        };
        self.wal_append(&commit).await?;
        for change in &commit.changes {
            apply_change(&self.store, &mut scope.locked, change);
        }
        Ok(())
    }

    /// Reservations other than `exclude` that are active and overlap `range`,
    /// found through the equipment type's date index.
    pub(super) fn competitors(
        &self,
        equipment: &EquipmentState,
        range: &DateRange,
        exclude: Ulid,
    ) -> Vec<Reservation> {
        let candidates: Vec<Reservation> = equipment
            .bookings_overlapping(range)
            .filter_map(|b| self.store.get_reservation(&b.reservation_id))
            .collect();
        find_overlapping(range, &candidates, Some(exclude))
            .into_iter()
            .cloned()
            .collect()
    }

    pub(super) fn rng(&self) -> MutexGuard<'_, StdRng> {
        self.rng.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Rewrite the WAL as a snapshot of the current state. Holds the commit
    /// gate exclusively, so no commit can land between snapshot and swap.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.commit_gate.write().await;
        let mut changes = Vec::new();

        for id in self.store.equipment_ids() {
            let Some(eq) = self.store.get_equipment(&id) else {
                continue;
            };
            let guard = eq.read().await;
            changes.push(Change::EquipmentCreated(guard.info.clone()));
            changes.extend(guard.assets.iter().cloned().map(Change::AssetSaved));
        }
        changes.extend(
            self.store
                .reservations()
                .into_iter()
                .map(Change::ReservationSaved),
        );
        changes.extend(self.store.repairs().into_iter().map(Change::RepairSaved));
        for asset_id in self.store.history_asset_ids() {
            changes.extend(
                self.store
                    .history_for(&asset_id)
                    .into_iter()
                    .map(Change::HistoryAppended),
            );
        }

        let commits = vec![Commit {
            at: now_ms(),
            changes,
        }];
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                commits,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        metrics::counter!(crate::observability::WAL_COMPACTIONS_TOTAL).increment(1);
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
