//! Integration tests against a real Postgres database.
//!
//! Enabled with `--features pg-tests`; expects `RESERVA_TEST_DSN` to point
//! at a database the tests may migrate and write to. Every test works on
//! its own random resource, so the suite can run in parallel and repeatedly
//! against the same database.
#![cfg(feature = "pg-tests")]

use chrono::{NaiveDate, TimeZone, Utc};
use uuid::Uuid;

use reserva::{
    AllocateParams, Error, MoveParams, RemoveTarget, ReservationStatus, ReserveParams, Scheduler,
    SearchParams, Settings, TimeInput,
};

static MIGRATED: tokio::sync::OnceCell<()> = tokio::sync::OnceCell::const_new();

async fn scheduler() -> Scheduler {
    let dsn = std::env::var("RESERVA_TEST_DSN")
        .expect("RESERVA_TEST_DSN must point at a scratch Postgres database");

    let registry = reserva::default_registry();
    let context = registry
        .get_or_register("pg-tests", || {
            Settings::new(dsn).with_timezone("Europe/Zurich")
        })
        .unwrap();

    MIGRATED
        .get_or_init(|| async {
            context.migrate().await.expect("migrations");
        })
        .await;

    Scheduler::new(context.clone(), Uuid::new_v4(), "Europe/Zurich").unwrap()
}

fn local(y: i32, m: u32, d: u32, h: u32, min: u32) -> TimeInput {
    NaiveDate::from_ymd_opt(y, m, d)
        .unwrap()
        .and_hms_opt(h, min, 0)
        .unwrap()
        .into()
}

// ── S1: single whole-day reservation ────────────────────────────

#[tokio::test]
async fn whole_day_reservation_spans_the_local_day() {
    let s = scheduler().await;

    let masters = s
        .allocate(
            AllocateParams::single(local(2024, 6, 1, 10, 0), local(2024, 6, 1, 15, 0))
                .whole_day()
                .approve_manually(false),
        )
        .await
        .unwrap();
    assert_eq!(masters.len(), 1);

    let token = s
        .reserve(ReserveParams::single(
            "alice@x.org",
            local(2024, 6, 1, 0, 0),
            local(2024, 6, 2, 0, 0),
        ))
        .await
        .unwrap();
    let slots = s.approve_reservations(token).await.unwrap();

    assert_eq!(slots.len(), 1);
    assert_eq!(
        slots[0].start,
        Utc.with_ymd_and_hms(2024, 5, 31, 22, 0, 0).unwrap()
    );
    assert_eq!(
        slots[0].end,
        Utc.with_ymd_and_hms(2024, 6, 1, 22, 0, 0).unwrap()
    );

    let reservations = s.reservations_by_token(token).await.unwrap();
    assert_eq!(reservations[0].status, ReservationStatus::Approved);
}

// ── S2: quota mirrors ───────────────────────────────────────────

#[tokio::test]
async fn quota_three_serves_three_reservations() {
    let s = scheduler().await;

    let masters = s
        .allocate(
            AllocateParams::single(local(2024, 6, 1, 10, 0), local(2024, 6, 1, 11, 0))
                .quota(3)
                .approve_manually(false),
        )
        .await
        .unwrap();
    let master = &masters[0];
    assert_eq!(master.quota, 3);

    let mirrors = s.allocation_mirrors_by_master(master.id).await.unwrap();
    assert_eq!(mirrors.len(), 2);

    let mut seen = Vec::new();
    for mail in ["a@x.org", "b@x.org", "c@x.org"] {
        let token = s
            .reserve(ReserveParams::single(
                mail,
                local(2024, 6, 1, 10, 0),
                local(2024, 6, 1, 11, 0),
            ))
            .await
            .unwrap();
        let slots = s.approve_reservations(token).await.unwrap();
        assert_eq!(slots.len(), 1);
        seen.push(slots[0].allocation_id);
    }

    seen.sort();
    seen.dedup();
    assert_eq!(seen.len(), 3, "each reservation gets its own family row");

    let result = s
        .reserve(ReserveParams::single(
            "d@x.org",
            local(2024, 6, 1, 10, 0),
            local(2024, 6, 1, 11, 0),
        ))
        .await;
    assert!(matches!(result, Err(Error::AlreadyReserved { .. })));
}

// ── S3: partly available raster ─────────────────────────────────

#[tokio::test]
async fn raster_misaligned_reservation_is_rejected() {
    let s = scheduler().await;

    s.allocate(
        AllocateParams::single(local(2024, 6, 1, 9, 0), local(2024, 6, 1, 12, 0))
            .partly_available(15)
            .approve_manually(false),
    )
    .await
    .unwrap();

    let result = s
        .reserve(ReserveParams::single(
            "alice@x.org",
            local(2024, 6, 1, 9, 7),
            local(2024, 6, 1, 9, 30),
        ))
        .await;
    assert!(matches!(result, Err(Error::ReservationParametersInvalid)));

    let token = s
        .reserve(ReserveParams::single(
            "alice@x.org",
            local(2024, 6, 1, 9, 15),
            local(2024, 6, 1, 9, 30),
        ))
        .await
        .unwrap();
    let slots = s.approve_reservations(token).await.unwrap();
    assert_eq!(slots.len(), 1);
}

// ── S4: DST fall-back day ───────────────────────────────────────

#[tokio::test]
async fn fall_back_day_availability_is_normalized() {
    let s = scheduler().await;

    // 2024-10-27 has 25 local hours in Zurich
    let masters = s
        .allocate(
            AllocateParams::single(local(2024, 10, 27, 8, 0), local(2024, 10, 27, 9, 0))
                .whole_day()
                .partly_available(15)
                .approve_manually(false),
        )
        .await
        .unwrap();
    let master = &masters[0];
    assert_eq!((master.end - master.start).num_hours(), 25);

    let free = s
        .availability(local(2024, 10, 27, 0, 0), local(2024, 10, 28, 0, 0))
        .await
        .unwrap();
    assert_eq!(free, 100.0);

    let token = s
        .reserve(ReserveParams::single(
            "alice@x.org",
            local(2024, 10, 27, 12, 0),
            local(2024, 10, 27, 12, 15),
        ))
        .await
        .unwrap();
    s.approve_reservations(token).await.unwrap();

    // normalized: one of 96 quarter hours; raw: one of 100
    let normalized = s
        .availability(local(2024, 10, 27, 0, 0), local(2024, 10, 28, 0, 0))
        .await
        .unwrap();
    assert!((normalized - (100.0 - 100.0 / 96.0)).abs() < 1e-6);

    let slots = s.reserved_slots_by_reservation(token).await.unwrap();
    let raw = s
        .allocation_by_id(master.id)
        .await
        .unwrap()
        .availability(&slots);
    assert!((raw - 99.0).abs() < 1e-6);
}

// ── S5: group targets ───────────────────────────────────────────

#[tokio::test]
async fn group_reservations_bind_members_in_id_order() {
    let s = scheduler().await;

    let masters = s
        .allocate(
            AllocateParams::new(vec![
                (local(2024, 6, 4, 14, 0), local(2024, 6, 4, 16, 0)),
                (local(2024, 6, 11, 14, 0), local(2024, 6, 11, 16, 0)),
            ])
            .grouped()
            .approve_manually(false),
        )
        .await
        .unwrap();
    assert_eq!(masters.len(), 2);
    let group = masters[0].group_key;
    assert_eq!(group, masters[1].group_key);

    let first = s
        .reserve(ReserveParams::group("a@x.org", group))
        .await
        .unwrap();
    let slots = s.approve_reservations(first).await.unwrap();
    assert_eq!(slots[0].allocation_id, masters[0].id);

    let second = s
        .reserve(ReserveParams::group("b@x.org", group))
        .await
        .unwrap();
    let slots = s.approve_reservations(second).await.unwrap();
    assert_eq!(slots[0].allocation_id, masters[1].id);

    let third = s.reserve(ReserveParams::group("c@x.org", group)).await;
    assert!(matches!(third, Err(Error::AlreadyReserved { .. })));
}

// ── S6 / property 8: concurrent approval ────────────────────────

#[tokio::test]
async fn concurrent_approvals_of_one_spot_leave_one_winner() {
    let s = scheduler().await;

    s.allocate(
        AllocateParams::single(local(2024, 6, 1, 10, 0), local(2024, 6, 1, 11, 0))
            .approve_manually(false),
    )
    .await
    .unwrap();

    // two pending reservations for the same single spot
    let token_a = s
        .reserve(ReserveParams::single(
            "a@x.org",
            local(2024, 6, 1, 10, 0),
            local(2024, 6, 1, 11, 0),
        ))
        .await
        .unwrap();
    let token_b = s
        .reserve(ReserveParams::single(
            "b@x.org",
            local(2024, 6, 1, 10, 0),
            local(2024, 6, 1, 11, 0),
        ))
        .await
        .unwrap();

    let (a, b) = tokio::join!(
        s.approve_reservations(token_a),
        s.approve_reservations(token_b)
    );

    let winners = [&a, &b].iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1, "exactly one approval may commit: {a:?} / {b:?}");

    let loser = if a.is_err() { a } else { b };
    assert!(matches!(
        loser,
        Err(Error::AlreadyReserved { .. }) | Err(Error::TransactionRollback { .. })
    ));
}

// ── Allocation lifecycle ────────────────────────────────────────

#[tokio::test]
async fn overlapping_masters_are_rejected() {
    let s = scheduler().await;

    s.allocate(AllocateParams::single(
        local(2024, 6, 1, 9, 0),
        local(2024, 6, 1, 12, 0),
    ))
    .await
    .unwrap();

    let result = s
        .allocate(AllocateParams::single(
            local(2024, 6, 1, 11, 0),
            local(2024, 6, 1, 14, 0),
        ))
        .await;
    assert!(matches!(result, Err(Error::OverlappingAllocation { .. })));

    // skip mode silently drops the colliding window
    let created = s
        .allocate(
            AllocateParams::single(local(2024, 6, 1, 11, 0), local(2024, 6, 1, 14, 0))
                .skip_overlapping(),
        )
        .await
        .unwrap();
    assert!(created.is_empty());

    // adjacent is fine: ranges are half-open
    let created = s
        .allocate(AllocateParams::single(
            local(2024, 6, 1, 12, 0),
            local(2024, 6, 1, 14, 0),
        ))
        .await
        .unwrap();
    assert_eq!(created.len(), 1);
}

#[tokio::test]
async fn move_allocation_protects_reserved_slots() {
    let s = scheduler().await;

    let masters = s
        .allocate(
            AllocateParams::single(local(2024, 6, 1, 9, 0), local(2024, 6, 1, 10, 0))
                .approve_manually(false),
        )
        .await
        .unwrap();
    let id = masters[0].id;

    let token = s
        .reserve(ReserveParams::single(
            "alice@x.org",
            local(2024, 6, 1, 9, 0),
            local(2024, 6, 1, 10, 0),
        ))
        .await
        .unwrap();
    s.approve_reservations(token).await.unwrap();

    let result = s
        .move_allocation(
            id,
            MoveParams::to(local(2024, 6, 1, 10, 0), local(2024, 6, 1, 11, 0)),
        )
        .await;
    assert!(matches!(result, Err(Error::AffectedReservation { .. })));

    s.remove_reservation(token, None).await.unwrap();
    s.move_allocation(
        id,
        MoveParams::to(local(2024, 6, 1, 10, 0), local(2024, 6, 1, 11, 0)),
    )
    .await
    .unwrap();

    let moved = s.allocation_by_id(id).await.unwrap();
    assert_eq!(moved.start, Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap());
}

#[tokio::test]
async fn remove_allocation_requires_free_family() {
    let s = scheduler().await;

    let masters = s
        .allocate(
            AllocateParams::single(local(2024, 6, 1, 9, 0), local(2024, 6, 1, 10, 0))
                .approve_manually(false),
        )
        .await
        .unwrap();
    let id = masters[0].id;

    let token = s
        .reserve(ReserveParams::single(
            "alice@x.org",
            local(2024, 6, 1, 9, 0),
            local(2024, 6, 1, 10, 0),
        ))
        .await
        .unwrap();
    s.approve_reservations(token).await.unwrap();

    let result = s.remove_allocation(RemoveTarget::ById(id)).await;
    assert!(matches!(result, Err(Error::AffectedReservation { .. })));

    s.remove_reservation(token, None).await.unwrap();
    s.remove_allocation(RemoveTarget::ById(id)).await.unwrap();
    assert!(s.allocation_by_id(id).await.is_err());
}

#[tokio::test]
async fn remove_unused_allocations_keeps_reserved_days() {
    let s = scheduler().await;

    for day in 3..6 {
        s.allocate(
            AllocateParams::single(local(2024, 6, day, 9, 0), local(2024, 6, day, 10, 0))
                .approve_manually(false),
        )
        .await
        .unwrap();
    }

    let token = s
        .reserve(ReserveParams::single(
            "alice@x.org",
            local(2024, 6, 4, 9, 0),
            local(2024, 6, 4, 10, 0),
        ))
        .await
        .unwrap();
    s.approve_reservations(token).await.unwrap();

    let deleted = s
        .remove_unused_allocations(local(2024, 6, 1, 0, 0), local(2024, 6, 30, 0, 0), None, false)
        .await
        .unwrap();
    assert_eq!(deleted, 2);

    let remaining = s
        .allocations_in_range(local(2024, 6, 1, 0, 0), local(2024, 6, 30, 0, 0))
        .await
        .unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(
        remaining[0].start,
        Utc.with_ymd_and_hms(2024, 6, 4, 7, 0, 0).unwrap()
    );
}

#[tokio::test]
async fn quota_changes_reorganize_and_guard_capacity() {
    let s = scheduler().await;

    let masters = s
        .allocate(
            AllocateParams::single(local(2024, 6, 1, 10, 0), local(2024, 6, 1, 11, 0))
                .quota(3)
                .approve_manually(false),
        )
        .await
        .unwrap();
    let id = masters[0].id;

    // take two of the three spots
    let mut tokens = Vec::new();
    for mail in ["a@x.org", "b@x.org"] {
        let token = s
            .reserve(ReserveParams::single(
                mail,
                local(2024, 6, 1, 10, 0),
                local(2024, 6, 1, 11, 0),
            ))
            .await
            .unwrap();
        s.approve_reservations(token).await.unwrap();
        tokens.push(token);
    }

    // shrinking below the two in-use spots must fail
    let result = s
        .change_allocation(
            id,
            reserva::AllocationChanges {
                quota: Some(1),
                ..Default::default()
            },
        )
        .await;
    assert!(matches!(result, Err(Error::AffectedReservation { .. })));

    // shrinking to exactly the in-use capacity reorganizes onto low ids
    s.change_allocation(
        id,
        reserva::AllocationChanges {
            quota: Some(2),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let master = s.allocation_by_id(id).await.unwrap();
    assert_eq!(master.quota, 2);
    assert_eq!(s.allocation_mirrors_by_master(id).await.unwrap().len(), 1);
    assert_eq!(
        s.free_allocations_count(id, local(2024, 6, 1, 10, 0), local(2024, 6, 1, 11, 0))
            .await
            .unwrap(),
        0
    );

    // growing again adds fresh mirrors
    s.change_allocation(
        id,
        reserva::AllocationChanges {
            quota: Some(4),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert_eq!(
        s.free_allocations_count(id, local(2024, 6, 1, 10, 0), local(2024, 6, 1, 11, 0))
            .await
            .unwrap(),
        2
    );
}

// ── Property 7: round trip ──────────────────────────────────────

#[tokio::test]
async fn reserve_approve_remove_round_trips_to_free() {
    let s = scheduler().await;

    let masters = s
        .allocate(
            AllocateParams::single(local(2024, 6, 1, 9, 0), local(2024, 6, 1, 12, 0))
                .partly_available(30)
                .approve_manually(false),
        )
        .await
        .unwrap();
    let id = masters[0].id;

    let before = s
        .availability(local(2024, 6, 1, 9, 0), local(2024, 6, 1, 12, 0))
        .await
        .unwrap();
    assert_eq!(before, 100.0);

    let token = s
        .reserve(ReserveParams::single(
            "alice@x.org",
            local(2024, 6, 1, 10, 0),
            local(2024, 6, 1, 11, 0),
        ))
        .await
        .unwrap();
    s.approve_reservations(token).await.unwrap();

    let during = s
        .availability(local(2024, 6, 1, 9, 0), local(2024, 6, 1, 12, 0))
        .await
        .unwrap();
    assert!(during < 100.0);

    s.remove_reservation(token, None).await.unwrap();

    let after = s
        .availability(local(2024, 6, 1, 9, 0), local(2024, 6, 1, 12, 0))
        .await
        .unwrap();
    assert_eq!(after, 100.0);
    assert_eq!(
        s.free_allocations_count(id, local(2024, 6, 1, 9, 0), local(2024, 6, 1, 12, 0))
            .await
            .unwrap(),
        1
    );
    assert!(s.reservations_by_token(token).await.is_err());
}

// ── Waiting lists and manual approval ───────────────────────────

#[tokio::test]
async fn manual_approval_queues_until_capacity_is_claimed() {
    let s = scheduler().await;

    s.allocate(
        AllocateParams::single(local(2024, 6, 1, 9, 0), local(2024, 6, 1, 10, 0))
            .approve_manually(true)
            .waitinglist_spots(2),
    )
    .await
    .unwrap();

    // two pending reservations fit the waiting list, the third does not
    let first = s
        .reserve(ReserveParams::single(
            "a@x.org",
            local(2024, 6, 1, 9, 0),
            local(2024, 6, 1, 10, 0),
        ))
        .await
        .unwrap();
    let _second = s
        .reserve(ReserveParams::single(
            "b@x.org",
            local(2024, 6, 1, 9, 0),
            local(2024, 6, 1, 10, 0),
        ))
        .await
        .unwrap();
    let third = s
        .reserve(ReserveParams::single(
            "c@x.org",
            local(2024, 6, 1, 9, 0),
            local(2024, 6, 1, 10, 0),
        ))
        .await;
    assert!(matches!(third, Err(Error::AlreadyReserved { .. })));

    // the first approval wins the single spot
    let slots = s.approve_reservations(first).await.unwrap();
    assert_eq!(slots.len(), 1);

    // denying drops the remaining pending reservation
    s.deny_reservation(_second).await.unwrap();
    assert!(s.reservations_by_token(_second).await.is_err());

    // the approved one is not deniable, only removable
    s.deny_reservation(first).await.unwrap();
    assert_eq!(
        s.reservations_by_token(first).await.unwrap()[0].status,
        ReservationStatus::Approved
    );
}

// ── Session carts ───────────────────────────────────────────────

#[tokio::test]
async fn session_carts_reject_duplicates_and_expire() {
    let s = scheduler().await;
    let session_id = Uuid::new_v4();

    s.allocate(
        AllocateParams::single(local(2024, 6, 1, 9, 0), local(2024, 6, 1, 12, 0))
            .partly_available(30)
            .approve_manually(false),
    )
    .await
    .unwrap();

    let token = s
        .reserve(
            ReserveParams::single(
                "alice@x.org",
                local(2024, 6, 1, 9, 0),
                local(2024, 6, 1, 10, 0),
            )
            .session(session_id)
            .single_token_per_session(),
        )
        .await
        .unwrap();

    // same line again: refused
    let dup = s
        .reserve(
            ReserveParams::single(
                "alice@x.org",
                local(2024, 6, 1, 9, 0),
                local(2024, 6, 1, 10, 0),
            )
            .session(session_id),
        )
        .await;
    assert!(matches!(dup, Err(Error::AlreadyReserved { .. })));

    // a different line in the same session shares the token
    let token2 = s
        .reserve(
            ReserveParams::single(
                "alice@x.org",
                local(2024, 6, 1, 10, 0),
                local(2024, 6, 1, 11, 0),
            )
            .session(session_id)
            .single_token_per_session(),
        )
        .await
        .unwrap();
    assert_eq!(token, token2);
    assert_eq!(
        s.reservations_by_session(session_id).await.unwrap().len(),
        2
    );

    // pending carts expire...
    let expired = s
        .find_expired_reservation_sessions(Utc::now() + chrono::Duration::minutes(1))
        .await
        .unwrap();
    assert!(expired.contains(&session_id));

    // ...but confirmed ones survive
    s.confirm_reservations_for_session(session_id, None)
        .await
        .unwrap();
    let expired = s
        .remove_expired_reservation_sessions(Utc::now() + chrono::Duration::minutes(1))
        .await
        .unwrap();
    assert!(!expired.contains(&session_id));
    assert_eq!(s.reservations_by_token(token).await.unwrap().len(), 2);
}

// ── Changing reservations ───────────────────────────────────────

#[tokio::test]
async fn change_reservation_moves_the_slots() {
    let s = scheduler().await;

    s.allocate(
        AllocateParams::single(local(2024, 6, 1, 9, 0), local(2024, 6, 1, 12, 0))
            .partly_available(30)
            .approve_manually(false),
    )
    .await
    .unwrap();

    let token = s
        .reserve(ReserveParams::single(
            "alice@x.org",
            local(2024, 6, 1, 9, 0),
            local(2024, 6, 1, 10, 0),
        ))
        .await
        .unwrap();
    s.approve_reservations(token).await.unwrap();
    let reservation = s.reservations_by_token(token).await.unwrap().remove(0);

    let updated = s
        .change_reservation(
            token,
            reservation.id,
            local(2024, 6, 1, 10, 30),
            local(2024, 6, 1, 11, 30),
            None,
        )
        .await
        .unwrap()
        .expect("a change happened");
    assert_eq!(
        updated.start.unwrap(),
        Utc.with_ymd_and_hms(2024, 6, 1, 8, 30, 0).unwrap()
    );

    let slots = s.reserved_slots_by_reservation(token).await.unwrap();
    assert_eq!(slots.len(), 2);
    assert!(slots
        .iter()
        .all(|slot| slot.start >= Utc.with_ymd_and_hms(2024, 6, 1, 8, 30, 0).unwrap()));

    // outside the allocation: refused, nothing changes
    let result = s
        .change_reservation(
            token,
            reservation.id,
            local(2024, 6, 1, 11, 30),
            local(2024, 6, 1, 13, 0),
            None,
        )
        .await;
    assert!(matches!(result, Err(Error::ReservationOutOfBounds)));
}

// ── Search ──────────────────────────────────────────────────────

#[tokio::test]
async fn search_filters_by_availability_and_day() {
    let s = scheduler().await;

    // Mon Jun 3 and Tue Jun 4
    for day in [3, 4] {
        s.allocate(
            AllocateParams::single(local(2024, 6, day, 9, 0), local(2024, 6, day, 10, 0))
                .approve_manually(false),
        )
        .await
        .unwrap();
    }

    let token = s
        .reserve(ReserveParams::single(
            "alice@x.org",
            local(2024, 6, 3, 9, 0),
            local(2024, 6, 3, 10, 0),
        ))
        .await
        .unwrap();
    s.approve_reservations(token).await.unwrap();

    let all = s
        .search_allocations(
            local(2024, 6, 1, 8, 0),
            local(2024, 6, 30, 20, 0),
            SearchParams::default(),
        )
        .await
        .unwrap();
    assert_eq!(all.len(), 2);

    let available = s
        .search_allocations(
            local(2024, 6, 1, 8, 0),
            local(2024, 6, 30, 20, 0),
            SearchParams {
                available_only: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(available.len(), 1);
    assert_eq!(
        available[0].start,
        Utc.with_ymd_and_hms(2024, 6, 4, 7, 0, 0).unwrap()
    );

    let tuesdays = s
        .search_allocations(
            local(2024, 6, 1, 8, 0),
            local(2024, 6, 30, 20, 0),
            SearchParams {
                days: Some(vec![chrono::Weekday::Tue]),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(tuesdays.len(), 1);
}

// ── Session guard ───────────────────────────────────────────────

#[tokio::test]
async fn read_session_is_guarded() {
    let s = scheduler().await;
    let provider = s.context().session().unwrap();

    // writes through the read session are rejected by the database
    let result = provider
        .read("illegal_write", |conn| {
            Box::pin(async move {
                sqlx::query("INSERT INTO reservations (token, target, target_type, resource, status, kind, email, quota) \
                             VALUES ($1, $2, 'group', $3, 'pending', 'free', 'x@x.org', 1)")
                    .bind(Uuid::new_v4())
                    .bind(Uuid::new_v4())
                    .bind(Uuid::new_v4())
                    .execute(&mut *conn)
                    .await
                    .map_err(Error::from)?;
                Ok(())
            })
        })
        .await;
    assert!(matches!(result, Err(Error::ModifiedReadOnlySession)));

    // reads are refused while a write transaction is open
    let holder = {
        let provider = provider.clone();
        tokio::spawn(async move {
            provider
                .serializable("hold_open", |conn| {
                    Box::pin(async move {
                        sqlx::query("SELECT pg_sleep(0.4)")
                            .execute(&mut *conn)
                            .await
                            .map_err(Error::from)?;
                        Ok(())
                    })
                })
                .await
        })
    };

    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    let read = provider
        .read("probe", |conn| {
            Box::pin(async move {
                sqlx::query("SELECT 1")
                    .execute(&mut *conn)
                    .await
                    .map_err(Error::from)?;
                Ok(())
            })
        })
        .await;
    assert!(matches!(read, Err(Error::DirtyReadOnlySession)));

    holder.await.unwrap().unwrap();
    assert!(!provider.is_dirty());
}
