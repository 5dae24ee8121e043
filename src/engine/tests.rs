use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveDate;

use super::*;

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("kitlend_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn date(day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 4, day).unwrap()
}

fn range(start: u32, end: u32) -> DateRange {
    DateRange::new(date(start), date(end))
}

fn requester() -> Requester {
    Requester {
        user_id: "u-104".into(),
        name: "Mina Park".into(),
        contact: Some("mina@example.org".into()),
    }
}

/// Engine with one equipment type holding `units` available units.
async fn setup(name: &str, units: usize) -> (Engine, Ulid, Vec<Ulid>) {
    let engine = Engine::new(test_wal_path(name), Some(11)).unwrap();
    let (equipment_id, assets) = add_equipment(&engine, "Sony FX6", units).await;
    (engine, equipment_id, assets)
}

async fn add_equipment(engine: &Engine, name: &str, units: usize) -> (Ulid, Vec<Ulid>) {
    let equipment_id = Ulid::new();
    engine
        .create_equipment(equipment_id, name.into())
        .await
        .unwrap();
    let mut assets = Vec::new();
    for _ in 0..units {
        let asset = engine
            .register_asset(Ulid::new(), equipment_id, None)
            .await
            .unwrap();
        assets.push(asset.id);
    }
    (equipment_id, assets)
}

async fn reserve(engine: &Engine, lines: &[(Ulid, u32)], range: DateRange) -> Reservation {
    engine
        .create_reservation(NewReservation {
            requester: requester(),
            purpose: "short film shoot".into(),
            range,
            items: lines
                .iter()
                .map(|&(equipment_id, quantity)| NewLineItem {
                    equipment_id,
                    quantity,
                })
                .collect(),
        })
        .await
        .unwrap()
}

async fn condition_of(engine: &Engine, equipment_id: Ulid, asset_id: Ulid) -> AssetCondition {
    engine
        .list_assets(equipment_id)
        .await
        .unwrap()
        .into_iter()
        .find(|a| a.id == asset_id)
        .unwrap()
        .condition
}

fn bound(reservation: &Reservation) -> Vec<Ulid> {
    reservation.bound_assets().copied().collect()
}

// ── Reservation creation ─────────────────────────────────

#[tokio::test]
async fn create_reservation_is_pending_with_daily_number() {
    let (engine, eq, _) = setup("create_pending.wal", 2).await;

    let first = reserve(&engine, &[(eq, 1)], range(1, 3)).await;
    let second = reserve(&engine, &[(eq, 1)], range(1, 3)).await;

    assert_eq!(first.status, ReservationStatus::Pending);
    assert!(first.number.starts_with("RSV-"));
    assert!(first.number.ends_with("-0001"), "{}", first.number);
    assert!(second.number.ends_with("-0002"), "{}", second.number);
    assert_eq!(first.items[0].name, "Sony FX6");
    assert!(first.items[0].assigned_assets.is_empty());
}

#[tokio::test]
async fn create_reservation_rejects_bad_input() {
    let (engine, eq, _) = setup("create_bad_input.wal", 1).await;
    let new = |items: Vec<NewLineItem>, range: DateRange| NewReservation {
        requester: requester(),
        purpose: String::new(),
        range,
        items,
    };

    let empty = engine.create_reservation(new(vec![], range(1, 2))).await;
    assert!(matches!(empty, Err(EngineError::InvalidInput(_))));

    let zero = engine
        .create_reservation(new(
            vec![NewLineItem {
                equipment_id: eq,
                quantity: 0,
            }],
            range(1, 2),
        ))
        .await;
    assert!(matches!(zero, Err(EngineError::InvalidInput(_))));

    let backwards = DateRange {
        start: date(5),
        end: date(5),
    };
    let inverted = engine
        .create_reservation(new(
            vec![NewLineItem {
                equipment_id: eq,
                quantity: 1,
            }],
            backwards,
        ))
        .await;
    assert!(matches!(inverted, Err(EngineError::InvalidInput(_))));

    let unknown = engine
        .create_reservation(new(
            vec![NewLineItem {
                equipment_id: Ulid::new(),
                quantity: 1,
            }],
            range(1, 2),
        ))
        .await;
    assert!(matches!(
        unknown,
        Err(EngineError::NotFound {
            kind: "equipment",
            ..
        })
    ));
    assert!(engine.list_reservations(None).is_empty());
}

// ── Approval / allocation ────────────────────────────────

#[tokio::test]
async fn approve_binds_distinct_units() {
    let (engine, eq, assets) = setup("approve_binds.wal", 3).await;
    let r = reserve(&engine, &[(eq, 2)], range(1, 4)).await;

    let approved = engine
        .set_status(r.id, ReservationStatus::Approved, None)
        .await
        .unwrap();

    let units = bound(&approved);
    assert_eq!(units.len(), 2);
    assert_eq!(units.iter().collect::<HashSet<_>>().len(), 2);
    assert!(units.iter().all(|u| assets.contains(u)));
    assert_eq!(engine.get_reservation(r.id).unwrap(), approved);
}

#[tokio::test]
async fn overlapping_approval_sees_remaining_units() {
    let (engine, eq, _) = setup("overlap_remaining.wal", 3).await;
    let a = reserve(&engine, &[(eq, 2)], range(1, 5)).await;
    let b = reserve(&engine, &[(eq, 2)], range(3, 8)).await;

    let a = engine
        .set_status(a.id, ReservationStatus::Approved, None)
        .await
        .unwrap();

    let report = engine.check_availability(b.id).await.unwrap();
    assert!(!report.is_fully_available);
    assert_eq!(report.items[0].remaining, 1);
    assert_eq!(report.items[0].rented, 2);

    let appends_before = engine.wal_appends_since_compact().await;
    let err = engine
        .set_status(b.id, ReservationStatus::Approved, None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::InsufficientStock {
            requested: 2,
            available: 1,
            ..
        }
    ));
    assert_eq!(err.shortfall(), Some(1));
    assert!(err.to_string().contains("Sony FX6"));

    // Nothing was written for the refused approval.
    assert_eq!(engine.wal_appends_since_compact().await, appends_before);
    let b_after = engine.get_reservation(b.id).unwrap();
    assert_eq!(b_after.status, ReservationStatus::Pending);
    assert!(bound(&b_after).is_empty());
    assert_eq!(engine.get_reservation(a.id).unwrap(), a);
}

#[tokio::test]
async fn back_to_back_ranges_share_units() {
    let (engine, eq, _) = setup("back_to_back.wal", 2).await;
    let first = reserve(&engine, &[(eq, 2)], range(1, 3)).await;
    let second = reserve(&engine, &[(eq, 2)], range(3, 6)).await;

    engine
        .set_status(first.id, ReservationStatus::Approved, None)
        .await
        .unwrap();
    let second = engine
        .set_status(second.id, ReservationStatus::Approved, None)
        .await
        .unwrap();
    assert_eq!(bound(&second).len(), 2);
}

#[tokio::test]
async fn unusable_units_never_allocated() {
    let (engine, eq, assets) = setup("unusable.wal", 3).await;
    engine
        .set_asset_condition(assets[0], AssetCondition::Broken, Some("cracked sensor".into()))
        .await
        .unwrap();
    engine
        .set_asset_condition(assets[1], AssetCondition::Retired, None)
        .await
        .unwrap();

    let counts = engine.check_range(eq, range(1, 2)).await.unwrap();
    assert_eq!(
        counts,
        AvailabilityCounts {
            total: 3,
            broken: 2,
            rented: 0,
            available: 1,
        }
    );

    let r = reserve(&engine, &[(eq, 1)], range(1, 2)).await;
    let approved = engine
        .set_status(r.id, ReservationStatus::Approved, None)
        .await
        .unwrap();
    assert_eq!(bound(&approved), vec![assets[2]]);

    let more = reserve(&engine, &[(eq, 1)], range(1, 2)).await;
    let err = engine
        .set_status(more.id, ReservationStatus::Approved, None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InsufficientStock { available: 0, .. }));
}

#[tokio::test]
async fn rented_condition_cannot_be_set_by_hand() {
    let (engine, _, assets) = setup("manual_rented.wal", 1).await;
    let err = engine
        .set_asset_condition(assets[0], AssetCondition::Rented, None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidInput(_)));
}

#[tokio::test]
async fn same_type_lines_never_share_a_unit() {
    let (engine, eq, _) = setup("same_type_lines.wal", 2).await;
    let r = reserve(&engine, &[(eq, 1), (eq, 1)], range(1, 3)).await;

    let approved = engine
        .set_status(r.id, ReservationStatus::Approved, None)
        .await
        .unwrap();
    assert_ne!(
        approved.items[0].assigned_assets,
        approved.items[1].assigned_assets
    );

    let over = reserve(&engine, &[(eq, 2), (eq, 1)], range(5, 6)).await;
    let err = engine
        .set_status(over.id, ReservationStatus::Approved, None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InsufficientStock { .. }));
}

#[tokio::test]
async fn reapproval_reallocates_without_self_conflict() {
    let (engine, eq, _) = setup("reapprove.wal", 2).await;
    let r = reserve(&engine, &[(eq, 2)], range(1, 3)).await;
    engine
        .set_status(r.id, ReservationStatus::Approved, None)
        .await
        .unwrap();

    let again = engine
        .set_status(r.id, ReservationStatus::Approved, None)
        .await
        .unwrap();
    assert_eq!(bound(&again).len(), 2);
}

#[tokio::test]
async fn multi_type_approval_is_all_or_nothing() {
    let (engine, camera, _) = setup("multi_type.wal", 2).await;
    let (tripod, _) = add_equipment(&engine, "Sachtler Ace", 1).await;

    let blocker = reserve(&engine, &[(tripod, 1)], range(1, 5)).await;
    engine
        .set_status(blocker.id, ReservationStatus::Approved, None)
        .await
        .unwrap();

    let r = reserve(&engine, &[(camera, 2), (tripod, 1)], range(2, 4)).await;
    let err = engine
        .set_status(r.id, ReservationStatus::Approved, None)
        .await
        .unwrap_err();
    match err {
        EngineError::InsufficientStock { equipment_name, .. } => {
            assert_eq!(equipment_name, "Sachtler Ace")
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(bound(&engine.get_reservation(r.id).unwrap()).is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_approvals_never_double_book() {
    let path = test_wal_path("concurrent_approvals.wal");
    let engine = Arc::new(Engine::new(path, None).unwrap());
    let (eq, _) = add_equipment(&engine, "Aputure 300d", 2).await;

    let mut ids = Vec::new();
    for _ in 0..8 {
        ids.push(reserve(&engine, &[(eq, 2)], range(10, 14)).await.id);
    }

    let mut handles = Vec::new();
    for id in ids {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine
                .set_status(id, ReservationStatus::Approved, None)
                .await
        }));
    }

    let mut wins = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => wins += 1,
            Err(e) => assert!(matches!(e, EngineError::InsufficientStock { .. })),
        }
    }
    assert_eq!(wins, 1);

    let approved: Vec<_> = engine.list_reservations(Some(ReservationStatus::Approved));
    assert_eq!(approved.len(), 1);
    assert_eq!(bound(&approved[0]).len(), 2);
}

#[tokio::test]
async fn seeded_allocation_is_reproducible() {
    let asset_ids: Vec<Ulid> = (0..6).map(|_| Ulid::new()).collect();
    let equipment_id = Ulid::new();

    let mut picks = Vec::new();
    for name in ["seed_a.wal", "seed_b.wal"] {
        let engine = Engine::new(test_wal_path(name), Some(2024)).unwrap();
        engine
            .create_equipment(equipment_id, "Rode NTG5".into())
            .await
            .unwrap();
        for id in &asset_ids {
            engine.register_asset(*id, equipment_id, None).await.unwrap();
        }
        let r = reserve(&engine, &[(equipment_id, 3)], range(1, 2)).await;
        let approved = engine
            .set_status(r.id, ReservationStatus::Approved, None)
            .await
            .unwrap();
        picks.push(bound(&approved));
    }
    assert_eq!(picks[0], picks[1]);
}

// ── Other transitions ────────────────────────────────────

#[tokio::test]
async fn clearing_statuses_free_units() {
    for (i, target) in [
        ReservationStatus::Pending,
        ReservationStatus::Rejected,
        ReservationStatus::Cancelled,
    ]
    .into_iter()
    .enumerate()
    {
        let (engine, eq, _) = setup(&format!("clearing_{i}.wal"), 1).await;
        let a = reserve(&engine, &[(eq, 1)], range(1, 3)).await;
        let b = reserve(&engine, &[(eq, 1)], range(1, 3)).await;
        engine
            .set_status(a.id, ReservationStatus::Approved, None)
            .await
            .unwrap();

        let cleared = engine.set_status(a.id, target, None).await.unwrap();
        assert_eq!(cleared.status, target);
        assert!(bound(&cleared).is_empty(), "{target}");

        engine
            .set_status(b.id, ReservationStatus::Approved, None)
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn only_approved_can_be_checked_out() {
    let (engine, eq, _) = setup("checkout_from_pending.wal", 1).await;
    let r = reserve(&engine, &[(eq, 1)], range(1, 3)).await;

    let err = engine
        .set_status(r.id, ReservationStatus::Rented, None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::InvalidTransition {
            from: ReservationStatus::Pending,
            to: ReservationStatus::Rented,
        }
    ));
}

#[tokio::test]
async fn checkout_marks_units_rented_and_cancel_releases_them() {
    let (engine, eq, _) = setup("checkout_cancel.wal", 2).await;
    let r = reserve(&engine, &[(eq, 2)], range(1, 3)).await;
    engine
        .set_status(r.id, ReservationStatus::Approved, None)
        .await
        .unwrap();
    let rented = engine
        .set_status(r.id, ReservationStatus::Rented, None)
        .await
        .unwrap();

    for unit in bound(&rented) {
        assert_eq!(condition_of(&engine, eq, unit).await, AssetCondition::Rented);
    }

    engine
        .set_status(r.id, ReservationStatus::Cancelled, None)
        .await
        .unwrap();
    for unit in bound(&rented) {
        assert_eq!(condition_of(&engine, eq, unit).await, AssetCondition::Available);
    }
}

async fn asset_of(engine: &Engine, equipment_id: Ulid, asset_id: Ulid) -> Asset {
    engine
        .list_assets(equipment_id)
        .await
        .unwrap()
        .into_iter()
        .find(|a| a.id == asset_id)
        .unwrap()
}

#[tokio::test]
async fn cancelling_later_booking_keeps_unit_with_current_renter() {
    let (engine, eq, assets) = setup("later_booking_cancel.wal", 1).await;
    let unit = assets[0];
    let first = rented_reservation(&engine, eq, 1).await;

    let later = reserve(&engine, &[(eq, 1)], range(5, 7)).await;
    let approved = engine
        .set_status(later.id, ReservationStatus::Approved, None)
        .await
        .unwrap();
    assert_eq!(bound(&approved), vec![unit]);

    // Neither re-approving nor cancelling the later booking frees the unit.
    engine
        .set_status(later.id, ReservationStatus::Approved, None)
        .await
        .unwrap();
    engine
        .set_status(later.id, ReservationStatus::Cancelled, None)
        .await
        .unwrap();

    let asset = asset_of(&engine, eq, unit).await;
    assert_eq!(asset.condition, AssetCondition::Rented);
    assert_eq!(asset.rented_by, Some(first.id));

    engine.process_return(first.id, Vec::new()).await.unwrap();
    let asset = asset_of(&engine, eq, unit).await;
    assert_eq!(asset.condition, AssetCondition::Available);
    assert_eq!(asset.rented_by, None);
}

#[tokio::test]
async fn checkout_takes_over_unit_still_out_with_earlier_rental() {
    let (engine, eq, assets) = setup("checkout_handover.wal", 1).await;
    let unit = assets[0];
    let first = rented_reservation(&engine, eq, 1).await;

    let later = reserve(&engine, &[(eq, 1)], range(5, 7)).await;
    engine
        .set_status(later.id, ReservationStatus::Approved, None)
        .await
        .unwrap();
    engine
        .set_status(later.id, ReservationStatus::Rented, None)
        .await
        .unwrap();
    assert_eq!(asset_of(&engine, eq, unit).await.rented_by, Some(later.id));

    // The earlier renter checking in does not free a unit the later one has.
    engine.process_return(first.id, Vec::new()).await.unwrap();
    let asset = asset_of(&engine, eq, unit).await;
    assert_eq!(asset.condition, AssetCondition::Rented);
    assert_eq!(asset.rented_by, Some(later.id));

    // Nor does processing the same return a second time.
    engine.process_return(first.id, Vec::new()).await.unwrap();
    assert!(asset_of(&engine, eq, unit).await.is_rented_by(later.id));

    engine.process_return(later.id, Vec::new()).await.unwrap();
    assert_eq!(condition_of(&engine, eq, unit).await, AssetCondition::Available);
}

#[tokio::test]
async fn date_index_holds_only_active_reservations() {
    let path = test_wal_path("date_index_active.wal");
    let eq;
    {
        let engine = Engine::new(path.clone(), Some(5)).unwrap();
        let (e, _) = add_equipment(&engine, "Atomos Ninja", 2).await;
        eq = e;
        let state = engine.get_equipment_state(&eq).unwrap();

        let kept = reserve(&engine, &[(eq, 1)], range(1, 3)).await;
        let dropped = reserve(&engine, &[(eq, 1)], range(2, 4)).await;
        assert!(state.read().await.bookings.is_empty());

        for id in [kept.id, dropped.id] {
            engine
                .set_status(id, ReservationStatus::Approved, None)
                .await
                .unwrap();
        }
        assert_eq!(state.read().await.bookings.len(), 2);

        engine
            .set_status(dropped.id, ReservationStatus::Rejected, None)
            .await
            .unwrap();
        let bookings = state.read().await.bookings.clone();
        assert_eq!(bookings.len(), 1);
        assert_eq!(bookings[0].reservation_id, kept.id);

        engine
            .set_status(kept.id, ReservationStatus::Rented, None)
            .await
            .unwrap();
        engine.process_return(kept.id, Vec::new()).await.unwrap();
        assert!(state.read().await.bookings.is_empty());
    }

    let engine = Engine::new(path, Some(5)).unwrap();
    let state = engine.get_equipment_state(&eq).unwrap();
    assert!(state.read().await.bookings.is_empty());
    assert_eq!(engine.check_range(eq, range(1, 4)).await.unwrap().available, 2);
}

#[tokio::test]
async fn unknown_status_string_changes_nothing() {
    let (engine, eq, _) = setup("unknown_status.wal", 1).await;
    let r = reserve(&engine, &[(eq, 1)], range(1, 3)).await;

    let err = engine
        .set_status_str(r.id, "archived", None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::UnknownStatus(ref s) if s == "archived"));
    assert_eq!(engine.get_reservation(r.id).unwrap(), r);

    let ok = engine.set_status_str(r.id, "approved", None).await.unwrap();
    assert_eq!(ok.status, ReservationStatus::Approved);
}

#[tokio::test]
async fn missing_reservation_is_not_found() {
    let (engine, _, _) = setup("missing_reservation.wal", 0).await;
    let err = engine
        .set_status(Ulid::new(), ReservationStatus::Approved, None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::NotFound {
            kind: "reservation",
            ..
        }
    ));
}

#[tokio::test]
async fn returned_with_note_opens_reservation_ticket() {
    let (engine, eq, _) = setup("returned_note.wal", 1).await;
    let r = reserve(&engine, &[(eq, 1)], range(1, 3)).await;
    engine
        .set_status(r.id, ReservationStatus::Approved, None)
        .await
        .unwrap();

    engine
        .set_status(
            r.id,
            ReservationStatus::Returned,
            Some("tripod plate missing".into()),
        )
        .await
        .unwrap();

    let tickets = engine.list_repairs(None);
    assert_eq!(tickets.len(), 1);
    let t = &tickets[0];
    assert_eq!(t.reservation_id, Some(r.id));
    assert_eq!(t.asset_id, None);
    assert_eq!(t.stage, RepairStage::DamageConfirmed);
    assert_eq!(t.description, "tripod plate missing");
    assert_eq!(t.requester, Some(requester()));

    let r2 = reserve(&engine, &[(eq, 1)], range(1, 3)).await;
    engine
        .set_status(r2.id, ReservationStatus::Returned, Some("   ".into()))
        .await
        .unwrap();
    assert_eq!(engine.list_repairs(None).len(), 1);
}

// ── Returns ──────────────────────────────────────────────

async fn rented_reservation(engine: &Engine, eq: Ulid, quantity: u32) -> Reservation {
    let r = reserve(engine, &[(eq, quantity)], range(1, 3)).await;
    engine
        .set_status(r.id, ReservationStatus::Approved, None)
        .await
        .unwrap();
    engine
        .set_status(r.id, ReservationStatus::Rented, None)
        .await
        .unwrap()
}

#[tokio::test]
async fn broken_return_opens_repair_and_blocks_unit() {
    let (engine, eq, _) = setup("broken_return.wal", 1).await;
    let r = rented_reservation(&engine, eq, 1).await;
    let unit = bound(&r)[0];

    let report = engine
        .process_return(
            r.id,
            vec![ReturnItem {
                asset_id: unit,
                condition: ReturnCondition::Broken,
                note: Some("lens mount bent".into()),
            }],
        )
        .await
        .unwrap();

    assert!(report.is_complete());
    let ticket_id = match report.outcomes[0].effect {
        ReturnEffect::RepairOpened { ticket_id } => ticket_id,
        ref other => panic!("unexpected {other:?}"),
    };
    let ticket = engine.get_repair(ticket_id).unwrap();
    assert_eq!(ticket.stage, RepairStage::DamageConfirmed);
    assert_eq!(ticket.asset_id, Some(unit));
    assert_eq!(ticket.equipment_id, Some(eq));
    assert_eq!(ticket.damage, DamageKind::Broken);

    assert_eq!(condition_of(&engine, eq, unit).await, AssetCondition::Maintenance);
    assert_eq!(
        engine.get_reservation(r.id).unwrap().status,
        ReservationStatus::Returned
    );

    let counts = engine.check_range(eq, range(20, 21)).await.unwrap();
    assert_eq!(counts.available, 0);
    assert_eq!(counts.broken, 1);

    engine
        .complete_repair(ticket_id, RepairResult::Repaired, None)
        .await
        .unwrap_err(); // must walk the stages first

    for payload in [
        StagePayload::ChargeDecided {
            charge: ChargeDecision::Free,
        },
        StagePayload::EstimateRequested {
            memo: "mount replacement".into(),
        },
        StagePayload::PaymentConfirmed { amount: 0 },
    ] {
        engine.advance_repair(ticket_id, payload).await.unwrap();
    }
    engine
        .complete_repair(ticket_id, RepairResult::Repaired, None)
        .await
        .unwrap();

    assert_eq!(condition_of(&engine, eq, unit).await, AssetCondition::Available);
    assert_eq!(engine.check_range(eq, range(20, 21)).await.unwrap().available, 1);
}

#[tokio::test]
async fn lost_return_marks_unit_lost() {
    let (engine, eq, _) = setup("lost_return.wal", 1).await;
    let r = rented_reservation(&engine, eq, 1).await;
    let unit = bound(&r)[0];

    engine
        .process_return(
            r.id,
            vec![ReturnItem {
                asset_id: unit,
                condition: ReturnCondition::Lost,
                note: None,
            }],
        )
        .await
        .unwrap();
    assert_eq!(condition_of(&engine, eq, unit).await, AssetCondition::Lost);
}

#[tokio::test]
async fn return_reports_failures_and_finishes_the_rest() {
    let (engine, eq, _) = setup("partial_return.wal", 3).await;
    let r = rented_reservation(&engine, eq, 2).await;
    let units = bound(&r);
    let stranger = Ulid::new();

    let report = engine
        .process_return(
            r.id,
            vec![
                ReturnItem {
                    asset_id: stranger,
                    condition: ReturnCondition::Normal,
                    note: None,
                },
                ReturnItem {
                    asset_id: units[0],
                    condition: ReturnCondition::Damaged,
                    note: Some("scratched LCD".into()),
                },
            ],
        )
        .await
        .unwrap();

    assert!(!report.is_complete());
    assert_eq!(report.outcomes.len(), 3);
    let failed: Vec<_> = report.failures().map(|o| o.asset_id).collect();
    assert_eq!(failed, vec![stranger]);

    // The unlisted unit came back as a normal return.
    let unlisted = report
        .outcomes
        .iter()
        .find(|o| o.asset_id == units[1])
        .unwrap();
    assert_eq!(unlisted.effect, ReturnEffect::Released);
    assert_eq!(condition_of(&engine, eq, units[1]).await, AssetCondition::Available);
    assert_eq!(condition_of(&engine, eq, units[0]).await, AssetCondition::Maintenance);

    assert_eq!(
        engine.get_reservation(r.id).unwrap().status,
        ReservationStatus::Returned
    );
}

#[tokio::test]
async fn damaged_return_links_existing_open_ticket() {
    let (engine, eq, _) = setup("link_ticket.wal", 1).await;
    let r = reserve(&engine, &[(eq, 1)], range(1, 3)).await;
    let r = engine
        .set_status(r.id, ReservationStatus::Approved, None)
        .await
        .unwrap();
    let unit = bound(&r)[0];

    let existing = engine
        .create_repair(NewRepair {
            reservation_id: Some(r.id),
            asset_id: Some(unit),
            damage: DamageKind::Damaged,
            description: "loose battery door".into(),
            requester: None,
        })
        .await
        .unwrap();
    assert_eq!(existing.requester, Some(requester()));

    let report = engine
        .process_return(
            r.id,
            vec![ReturnItem {
                asset_id: unit,
                condition: ReturnCondition::Damaged,
                note: Some("battery door came off".into()),
            }],
        )
        .await
        .unwrap();
    assert_eq!(
        report.outcomes[0].effect,
        ReturnEffect::RepairLinked {
            ticket_id: existing.id
        }
    );
    assert_eq!(engine.list_repairs(Some(unit)).len(), 1);
}

#[tokio::test]
async fn duplicate_return_item_is_reported() {
    let (engine, eq, _) = setup("duplicate_return.wal", 1).await;
    let r = rented_reservation(&engine, eq, 1).await;
    let unit = bound(&r)[0];
    let item = ReturnItem {
        asset_id: unit,
        condition: ReturnCondition::Normal,
        note: None,
    };

    let report = engine
        .process_return(r.id, vec![item.clone(), item])
        .await
        .unwrap();
    assert_eq!(report.outcomes.len(), 2);
    assert_eq!(report.outcomes[0].effect, ReturnEffect::Released);
    assert_eq!(report.failures().count(), 1);
}

#[tokio::test]
async fn return_writes_history() {
    let (engine, eq, _) = setup("return_history.wal", 1).await;
    let r = rented_reservation(&engine, eq, 1).await;
    let unit = bound(&r)[0];

    engine
        .process_return(
            r.id,
            vec![ReturnItem {
                asset_id: unit,
                condition: ReturnCondition::Broken,
                note: Some("won't power on".into()),
            }],
        )
        .await
        .unwrap();

    let history = engine.asset_history(unit).unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(
        history[0].event,
        HistoryEvent::Returned {
            condition: ReturnCondition::Broken,
            note: Some("won't power on".into()),
        }
    );
    assert_eq!(
        history[1].event,
        HistoryEvent::RepairOpened {
            damage: DamageKind::Broken
        }
    );
    assert!(history.iter().all(|h| h.reservation_id == Some(r.id)));

    assert!(matches!(
        engine.asset_history(Ulid::new()),
        Err(EngineError::NotFound { kind: "asset", .. })
    ));
}

// ── Repair workflow ──────────────────────────────────────

async fn open_ticket(engine: &Engine, asset_id: Ulid) -> RepairTicket {
    engine
        .create_repair(NewRepair {
            reservation_id: None,
            asset_id: Some(asset_id),
            damage: DamageKind::Broken,
            description: "fan noise".into(),
            requester: None,
        })
        .await
        .unwrap()
}

#[tokio::test]
async fn manual_repair_parks_asset_in_maintenance() {
    let (engine, eq, assets) = setup("manual_repair.wal", 1).await;
    let ticket = open_ticket(&engine, assets[0]).await;

    assert_eq!(ticket.stage, RepairStage::DamageConfirmed);
    assert!(!ticket.is_fixed);
    assert_eq!(
        condition_of(&engine, eq, assets[0]).await,
        AssetCondition::Maintenance
    );

    let err = engine
        .create_repair(NewRepair {
            reservation_id: None,
            asset_id: Some(assets[0]),
            damage: DamageKind::Damaged,
            description: "second report".into(),
            requester: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::RepairAlreadyOpen { ticket_id, .. } if ticket_id == ticket.id
    ));
}

#[tokio::test]
async fn repair_stages_advance_in_order_only() {
    let (engine, _, assets) = setup("stage_order.wal", 1).await;
    let ticket = open_ticket(&engine, assets[0]).await;

    let skip = engine
        .advance_repair(ticket.id, StagePayload::PaymentConfirmed { amount: 5000 })
        .await
        .unwrap_err();
    assert!(matches!(
        skip,
        EngineError::InvalidStage {
            from: RepairStage::DamageConfirmed,
            to: RepairStage::PaymentConfirmed,
        }
    ));

    let t = engine
        .advance_repair(
            ticket.id,
            StagePayload::ChargeDecided {
                charge: ChargeDecision::Charged,
            },
        )
        .await
        .unwrap();
    assert_eq!(t.charge, Some(ChargeDecision::Charged));
    assert!(t.charge_decided_at.is_some());

    let t = engine
        .advance_repair(
            ticket.id,
            StagePayload::EstimateRequested {
                memo: "vendor quote pending".into(),
            },
        )
        .await
        .unwrap();
    assert_eq!(t.estimate_memo.as_deref(), Some("vendor quote pending"));

    let t = engine
        .advance_repair(ticket.id, StagePayload::PaymentConfirmed { amount: 18_000 })
        .await
        .unwrap();
    assert_eq!(t.final_amount, Some(18_000));
    assert!(t.updated_at >= t.created_at);

    let repeat = engine
        .advance_repair(ticket.id, StagePayload::PaymentConfirmed { amount: 1 })
        .await;
    assert!(matches!(repeat, Err(EngineError::InvalidStage { .. })));
}

async fn walk_to_payment(engine: &Engine, id: Ulid) {
    for payload in [
        StagePayload::ChargeDecided {
            charge: ChargeDecision::Free,
        },
        StagePayload::EstimateRequested {
            memo: String::new(),
        },
        StagePayload::PaymentConfirmed { amount: 0 },
    ] {
        engine.advance_repair(id, payload).await.unwrap();
    }
}

#[tokio::test]
async fn unrepairable_completion_marks_asset_broken() {
    let (engine, eq, assets) = setup("unrepairable.wal", 1).await;
    let ticket = open_ticket(&engine, assets[0]).await;
    walk_to_payment(&engine, ticket.id).await;

    let done = engine
        .complete_repair(
            ticket.id,
            RepairResult::Unrepairable,
            Some("board fried".into()),
        )
        .await
        .unwrap();
    assert!(done.is_fixed);
    assert_eq!(done.stage, RepairStage::Completed);
    assert_eq!(done.repair_result, Some(RepairResult::Unrepairable));
    assert!(done.completed_at.is_some());

    let asset = engine
        .list_assets(eq)
        .await
        .unwrap()
        .into_iter()
        .find(|a| a.id == assets[0])
        .unwrap();
    assert_eq!(asset.condition, AssetCondition::Broken);
    assert_eq!(asset.note.as_deref(), Some("unrepairable: board fried"));

    let history = engine.asset_history(assets[0]).unwrap();
    assert_eq!(
        history.last().unwrap().event,
        HistoryEvent::RepairCompleted {
            result: RepairResult::Unrepairable
        }
    );
}

#[tokio::test]
async fn revert_moves_stage_back_only() {
    let (engine, eq, assets) = setup("revert.wal", 1).await;
    let ticket = open_ticket(&engine, assets[0]).await;
    walk_to_payment(&engine, ticket.id).await;
    engine
        .complete_repair(ticket.id, RepairResult::Repaired, None)
        .await
        .unwrap();

    let same = engine.revert_stage(ticket.id, RepairStage::Completed).await;
    assert!(matches!(same, Err(EngineError::InvalidStage { .. })));

    let reverted = engine
        .revert_stage(ticket.id, RepairStage::ChargeDecided)
        .await
        .unwrap();
    assert_eq!(reverted.stage, RepairStage::ChargeDecided);
    // Side effects already applied are left alone.
    assert!(reverted.is_fixed);
    assert!(reverted.completed_at.is_some());
    assert_eq!(
        condition_of(&engine, eq, assets[0]).await,
        AssetCondition::Available
    );
    assert!(
        engine.list_repairs(Some(assets[0]))[0].is_open(),
        "reverted ticket counts as open again"
    );

    let forward = engine
        .revert_stage(ticket.id, RepairStage::PaymentConfirmed)
        .await;
    assert!(matches!(forward, Err(EngineError::InvalidStage { .. })));
}

#[tokio::test]
async fn reopening_completed_ticket_respects_open_slot() {
    let (engine, _, assets) = setup("reopen_slot.wal", 1).await;
    let old = open_ticket(&engine, assets[0]).await;
    walk_to_payment(&engine, old.id).await;
    engine
        .complete_repair(old.id, RepairResult::Repaired, None)
        .await
        .unwrap();

    let newer = open_ticket(&engine, assets[0]).await;
    let err = engine
        .revert_stage(old.id, RepairStage::DamageConfirmed)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::RepairAlreadyOpen { ticket_id, .. } if ticket_id == newer.id
    ));
}

// ── Queries ──────────────────────────────────────────────

#[tokio::test]
async fn list_equipment_counts_units() {
    let (engine, eq, _) = setup("list_equipment.wal", 3).await;
    let (other, _) = add_equipment(&engine, "Zoom H6", 1).await;

    let mut listed = engine.list_equipment().await;
    listed.sort_by_key(|e| e.id);
    let mut expected = vec![
        EquipmentInfo {
            id: eq,
            name: "Sony FX6".into(),
            total_units: 3,
        },
        EquipmentInfo {
            id: other,
            name: "Zoom H6".into(),
            total_units: 1,
        },
    ];
    expected.sort_by_key(|e| e.id);
    assert_eq!(listed, expected);

    assert!(matches!(
        engine.create_equipment(eq, "dup".into()).await,
        Err(EngineError::AlreadyExists(id)) if id == eq
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_equipment_creation_with_same_id_has_one_winner() {
    let path = test_wal_path("concurrent_create_equipment.wal");
    let engine = Arc::new(Engine::new(path, None).unwrap());
    let id = Ulid::new();

    let mut handles = Vec::new();
    for name in ["Sony A7S III", "Sony FX3"] {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine.create_equipment(id, name.into()).await.map(|()| name)
        }));
    }

    let mut winners = Vec::new();
    for h in handles {
        match h.await.unwrap() {
            Ok(name) => winners.push(name),
            Err(e) => assert!(matches!(e, EngineError::AlreadyExists(dup) if dup == id)),
        }
    }
    assert_eq!(winners.len(), 1);
    let listed = engine.list_equipment().await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].name, winners[0]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_unit_registration_lands_in_one_type() {
    let path = test_wal_path("concurrent_register_asset.wal");
    let engine = Arc::new(Engine::new(path, None).unwrap());
    let (cameras, _) = add_equipment(&engine, "Blackmagic 6K", 0).await;
    let (monitors, _) = add_equipment(&engine, "SmallHD 702", 0).await;
    let unit = Ulid::new();

    let mut handles = Vec::new();
    for equipment_id in [cameras, monitors] {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine.register_asset(unit, equipment_id, None).await
        }));
    }

    let mut registered = Vec::new();
    for h in handles {
        match h.await.unwrap() {
            Ok(asset) => registered.push(asset.equipment_id),
            Err(e) => assert!(matches!(e, EngineError::AlreadyExists(dup) if dup == unit)),
        }
    }
    assert_eq!(registered.len(), 1);

    let in_cameras = engine.list_assets(cameras).await.unwrap().len();
    let in_monitors = engine.list_assets(monitors).await.unwrap().len();
    assert_eq!(in_cameras + in_monitors, 1);
    assert_eq!(engine.store.equipment_for_asset(&unit), Some(registered[0]));

    // Same id on the same type is refused as well.
    assert!(matches!(
        engine.register_asset(unit, registered[0], None).await,
        Err(EngineError::AlreadyExists(_))
    ));
}

// ── Durability ───────────────────────────────────────────

#[tokio::test]
async fn replay_restores_full_state() {
    let path = test_wal_path("replay_full.wal");
    let eq;
    let reservation_id;
    let unit;
    let ticket_id;
    {
        let engine = Engine::new(path.clone(), Some(3)).unwrap();
        let (e, _) = add_equipment(&engine, "Blackmagic Pocket 6K", 2).await;
        eq = e;
        let r = rented_reservation(&engine, eq, 1).await;
        reservation_id = r.id;
        unit = bound(&r)[0];
        let report = engine
            .process_return(
                r.id,
                vec![ReturnItem {
                    asset_id: unit,
                    condition: ReturnCondition::Damaged,
                    note: Some("dent".into()),
                }],
            )
            .await
            .unwrap();
        ticket_id = match report.outcomes[0].effect {
            ReturnEffect::RepairOpened { ticket_id } => ticket_id,
            ref other => panic!("unexpected {other:?}"),
        };
    }

    let engine = Engine::new(path, Some(3)).unwrap();
    let r = engine.get_reservation(reservation_id).unwrap();
    assert_eq!(r.status, ReservationStatus::Returned);
    assert_eq!(bound(&r), vec![unit]);
    assert_eq!(condition_of(&engine, eq, unit).await, AssetCondition::Maintenance);
    assert_eq!(engine.get_repair(ticket_id).unwrap().asset_id, Some(unit));
    assert_eq!(engine.asset_history(unit).unwrap().len(), 2);

    // Open-ticket index and number sequence survive too.
    let err = engine
        .create_repair(NewRepair {
            reservation_id: None,
            asset_id: Some(unit),
            damage: DamageKind::Damaged,
            description: String::new(),
            requester: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::RepairAlreadyOpen { .. }));
    let next = reserve(&engine, &[(eq, 1)], range(1, 2)).await;
    assert!(next.number.ends_with("-0002"), "{}", next.number);
}

#[tokio::test]
async fn replayed_bindings_still_block_allocation() {
    let path = test_wal_path("replay_bindings.wal");
    let eq;
    {
        let engine = Engine::new(path.clone(), None).unwrap();
        let (e, _) = add_equipment(&engine, "DJI RS 3", 1).await;
        eq = e;
        let r = reserve(&engine, &[(eq, 1)], range(1, 5)).await;
        engine
            .set_status(r.id, ReservationStatus::Approved, None)
            .await
            .unwrap();
    }

    let engine = Engine::new(path, None).unwrap();
    let r = reserve(&engine, &[(eq, 1)], range(2, 3)).await;
    let err = engine
        .set_status(r.id, ReservationStatus::Approved, None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InsufficientStock { .. }));
}

#[tokio::test]
async fn compaction_keeps_state_and_resets_counter() {
    let path = test_wal_path("compaction_state.wal");
    let eq;
    let reservation_id;
    {
        let engine = Engine::new(path.clone(), None).unwrap();
        let (e, _) = add_equipment(&engine, "Godox SL60", 2).await;
        eq = e;
        let r = reserve(&engine, &[(eq, 2)], range(1, 3)).await;
        reservation_id = r.id;
        for status in [
            ReservationStatus::Approved,
            ReservationStatus::Pending,
            ReservationStatus::Approved,
        ] {
            engine.set_status(r.id, status, None).await.unwrap();
        }
        assert!(engine.wal_appends_since_compact().await > 1);

        engine.compact_wal().await.unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 0);
    }

    let engine = Engine::new(path, None).unwrap();
    let r = engine.get_reservation(reservation_id).unwrap();
    assert_eq!(r.status, ReservationStatus::Approved);
    assert_eq!(bound(&r).len(), 2);
    assert_eq!(engine.list_assets(eq).await.unwrap().len(), 2);
}
