use std::path::PathBuf;
use std::sync::Arc;

use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

use super::validator::now_ms;
use super::{Engine, EngineError};

const DAY: Ms = 86_400_000;

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("roomswap_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn new_engine(name: &str) -> Engine {
    let path = test_wal_path(name);
    Engine::new(path, Arc::new(NotifyHub::new())).unwrap()
}

fn reopen_engine(name: &str) -> Engine {
    let dir = std::env::temp_dir().join("roomswap_test_engine");
    Engine::new(dir.join(name), Arc::new(NotifyHub::new())).unwrap()
}

fn future_date() -> Ms {
    now_ms() + 30 * DAY
}

/// Room with `occupants` freshly registered tenants in it. Returns the room
/// id and the tenant ids.
async fn seed_room(engine: &Engine, number: &str, capacity: u32, occupants: usize) -> (RoomId, Vec<TenantId>) {
    let room = Ulid::new();
    engine.register_room(room, number.into(), capacity, 0).await.unwrap();
    let mut tenants = Vec::new();
    for i in 0..occupants {
        let tenant = Ulid::new();
        engine
            .register_tenant(tenant, format!("resident {number}-{i}"), None, Some(room))
            .await
            .unwrap();
        tenants.push(tenant);
    }
    (room, tenants)
}

async fn submit_exchange(
    engine: &Engine,
    tenant: TenantId,
    current: RoomId,
    desired: RoomId,
) -> Result<ChangeRequest, EngineError> {
    engine
        .submit_request(
            Ulid::new(),
            tenant,
            current,
            RequestKind::Exchange { desired_room: desired },
            "closer to friends".into(),
            future_date(),
        )
        .await
}

async fn submit_vacate(
    engine: &Engine,
    tenant: TenantId,
    current: RoomId,
) -> Result<ChangeRequest, EngineError> {
    engine
        .submit_request(
            Ulid::new(),
            tenant,
            current,
            RequestKind::Vacate,
            "moving cities".into(),
            future_date(),
        )
        .await
}

async fn occupancy(engine: &Engine, room: RoomId) -> u32 {
    engine
        .list_rooms()
        .await
        .into_iter()
        .find(|r| r.id == room)
        .unwrap()
        .occupancy
}

async fn assigned_room(engine: &Engine, tenant: TenantId) -> Option<RoomId> {
    engine
        .list_tenants()
        .await
        .into_iter()
        .find(|t| t.id == tenant)
        .unwrap()
        .assigned_room
}

// ── Submission / admission ───────────────────────────────────────

#[tokio::test]
async fn submit_admits_pending_request() {
    let engine = new_engine("submit_pending.wal");
    let (room_a, tenants) = seed_room(&engine, "A-1", 2, 1).await;
    let (room_b, _) = seed_room(&engine, "B-1", 2, 0).await;

    let request = submit_exchange(&engine, tenants[0], room_a, room_b).await.unwrap();
    assert_eq!(request.status, RequestStatus::Pending);
    assert!(request.created_at > 0);
    assert_eq!(request.decided_by, None);

    let outstanding = engine.list_outstanding(tenants[0]).await;
    assert_eq!(outstanding.len(), 1);
    assert_eq!(outstanding[0].id, request.id);
}

#[tokio::test]
async fn submit_unknown_tenant_fails() {
    let engine = new_engine("submit_unknown_tenant.wal");
    let (room, _) = seed_room(&engine, "A-1", 2, 0).await;
    let err = submit_vacate(&engine, Ulid::new(), room).await.unwrap_err();
    assert!(matches!(err, EngineError::TenantNotFound(_)));
}

#[tokio::test]
async fn submit_inactive_tenant_fails() {
    let engine = new_engine("submit_inactive.wal");
    let (room, tenants) = seed_room(&engine, "A-1", 2, 1).await;
    engine.deactivate_tenant(tenants[0]).await.unwrap();

    let err = submit_vacate(&engine, tenants[0], room).await.unwrap_err();
    assert!(matches!(err, EngineError::TenantInactive(_)));
}

#[tokio::test]
async fn submit_room_mismatch_fails() {
    let engine = new_engine("submit_mismatch.wal");
    let (_room_a, tenants) = seed_room(&engine, "A-1", 2, 1).await;
    let (room_b, _) = seed_room(&engine, "B-1", 2, 0).await;

    // Claims to live in B, actually lives in A.
    let err = submit_vacate(&engine, tenants[0], room_b).await.unwrap_err();
    assert!(matches!(err, EngineError::RoomMismatch { .. }));
}

#[tokio::test]
async fn submit_duplicate_outstanding_fails() {
    let engine = new_engine("submit_duplicate.wal");
    let (room_a, tenants) = seed_room(&engine, "A-1", 2, 1).await;
    let (room_b, _) = seed_room(&engine, "B-1", 2, 0).await;

    let first = submit_vacate(&engine, tenants[0], room_a).await.unwrap();
    let err = submit_exchange(&engine, tenants[0], room_a, room_b).await.unwrap_err();
    match err {
        EngineError::DuplicateOutstandingRequest { existing, .. } => {
            assert_eq!(existing, first.id);
        }
        other => panic!("expected DuplicateOutstandingRequest, got {other:?}"),
    }
}

#[tokio::test]
async fn submit_exchange_unknown_room_fails() {
    let engine = new_engine("submit_unknown_room.wal");
    let (room_a, tenants) = seed_room(&engine, "A-1", 2, 1).await;
    let err = submit_exchange(&engine, tenants[0], room_a, Ulid::new()).await.unwrap_err();
    assert!(matches!(err, EngineError::RoomNotFound(_)));
}

#[tokio::test]
async fn submit_exchange_into_full_room_fails() {
    let engine = new_engine("submit_full_room.wal");
    let (room_a, tenants) = seed_room(&engine, "A-1", 2, 1).await;
    let (room_b, _) = seed_room(&engine, "B-1", 1, 1).await;

    let err = submit_exchange(&engine, tenants[0], room_a, room_b).await.unwrap_err();
    assert!(matches!(err, EngineError::RoomAtCapacity { capacity: 1, .. }));
}

#[tokio::test]
async fn submit_exchange_into_own_room_fails() {
    let engine = new_engine("submit_noop.wal");
    let (room_a, tenants) = seed_room(&engine, "A-1", 2, 1).await;
    let err = submit_exchange(&engine, tenants[0], room_a, room_a).await.unwrap_err();
    assert!(matches!(err, EngineError::NoOpExchange(_)));
}

#[tokio::test]
async fn submit_past_date_fails() {
    let engine = new_engine("submit_past_date.wal");
    let (room_a, tenants) = seed_room(&engine, "A-1", 2, 1).await;

    let err = engine
        .submit_request(
            Ulid::new(),
            tenants[0],
            room_a,
            RequestKind::Vacate,
            "too late".into(),
            now_ms() - 2 * DAY,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidDate(_)));

    // Today is allowed.
    engine
        .submit_request(
            Ulid::new(),
            tenants[0],
            room_a,
            RequestKind::Vacate,
            "today works".into(),
            now_ms(),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn submit_empty_reason_fails() {
    let engine = new_engine("submit_empty_reason.wal");
    let (room_a, tenants) = seed_room(&engine, "A-1", 2, 1).await;

    let err = engine
        .submit_request(
            Ulid::new(),
            tenants[0],
            room_a,
            RequestKind::Vacate,
            "  ".into(),
            future_date(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::EmptyReason));

    // Nothing stored, tenant may submit again.
    assert!(engine.list_outstanding(tenants[0]).await.is_empty());
}

#[tokio::test]
async fn concurrent_submissions_admit_exactly_one() {
    let engine = Arc::new(new_engine("submit_race.wal"));
    let (room_a, tenants) = seed_room(&engine, "A-1", 2, 1).await;
    let tenant = tenants[0];

    let mut handles = Vec::new();
    for _ in 0..4 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            submit_vacate(&engine, tenant, room_a).await
        }));
    }

    let mut admitted = 0;
    let mut duplicates = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => admitted += 1,
            Err(EngineError::DuplicateOutstandingRequest { .. }) => duplicates += 1,
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }
    assert_eq!(admitted, 1);
    assert_eq!(duplicates, 3);
    assert_eq!(engine.list_outstanding(tenant).await.len(), 1);
}

// ── Rejection ────────────────────────────────────────────────────

#[tokio::test]
async fn reject_records_decision_without_side_effects() {
    let engine = new_engine("reject_basic.wal");
    let (room_a, tenants) = seed_room(&engine, "A-1", 2, 1).await;

    let request = submit_vacate(&engine, tenants[0], room_a).await.unwrap();
    let rejected = engine.reject(request.id, "admin-1", "missing documents").await.unwrap();

    assert_eq!(rejected.status, RequestStatus::Rejected);
    assert_eq!(rejected.decided_by.as_deref(), Some("admin-1"));
    assert_eq!(rejected.rejection_reason.as_deref(), Some("missing documents"));
    assert!(rejected.decided_at.is_some());

    // No directory side effects.
    assert_eq!(occupancy(&engine, room_a).await, 1);
    assert_eq!(assigned_room(&engine, tenants[0]).await, Some(room_a));

    // History is kept, but the tenant's outstanding slot is free again.
    assert!(engine.get_request(request.id).await.is_some());
    assert!(engine.list_outstanding(tenants[0]).await.is_empty());
}

#[tokio::test]
async fn reject_requires_reason() {
    let engine = new_engine("reject_reason.wal");
    let (room_a, tenants) = seed_room(&engine, "A-1", 2, 1).await;
    let request = submit_vacate(&engine, tenants[0], room_a).await.unwrap();

    let err = engine.reject(request.id, "admin-1", "").await.unwrap_err();
    assert!(matches!(err, EngineError::EmptyReason));
    assert_eq!(
        engine.get_request(request.id).await.unwrap().status,
        RequestStatus::Pending
    );
}

#[tokio::test]
async fn rejected_then_resubmit_is_allowed() {
    let engine = new_engine("reject_resubmit.wal");
    let (room_a, tenants) = seed_room(&engine, "A-1", 2, 1).await;

    let first = submit_vacate(&engine, tenants[0], room_a).await.unwrap();
    engine.reject(first.id, "admin-1", "missing documents").await.unwrap();

    let second = submit_vacate(&engine, tenants[0], room_a).await.unwrap();
    assert_eq!(second.status, RequestStatus::Pending);
    assert_ne!(second.id, first.id);
}

// ── Approval ─────────────────────────────────────────────────────

#[tokio::test]
async fn approve_vacate_releases_room_and_assignment() {
    let engine = new_engine("approve_vacate.wal");
    let (room_c, tenants) = seed_room(&engine, "C-1", 1, 1).await;

    let request = submit_vacate(&engine, tenants[0], room_c).await.unwrap();
    let completed = engine.approve(request.id, "admin-2").await.unwrap();

    assert_eq!(completed.status, RequestStatus::Completed);
    assert_eq!(completed.decided_by.as_deref(), Some("admin-2"));
    assert!(completed.decided_at.is_some());

    assert_eq!(occupancy(&engine, room_c).await, 0);
    assert_eq!(assigned_room(&engine, tenants[0]).await, None);
    assert!(engine.list_outstanding(tenants[0]).await.is_empty());
}

#[tokio::test]
async fn approve_exchange_round_trip() {
    let engine = new_engine("approve_exchange.wal");
    let (room_a, tenants) = seed_room(&engine, "A-1", 2, 1).await;
    let (room_b, _) = seed_room(&engine, "B-1", 2, 1).await;

    let before_a = occupancy(&engine, room_a).await;
    let before_b = occupancy(&engine, room_b).await;

    let request = submit_exchange(&engine, tenants[0], room_a, room_b).await.unwrap();
    engine.approve(request.id, "admin-2").await.unwrap();

    assert_eq!(assigned_room(&engine, tenants[0]).await, Some(room_b));
    assert_eq!(occupancy(&engine, room_a).await, before_a - 1);
    assert_eq!(occupancy(&engine, room_b).await, before_b + 1);
    assert_eq!(
        engine.get_request(request.id).await.unwrap().status,
        RequestStatus::Completed
    );
}

#[tokio::test]
async fn decisions_on_terminal_requests_are_refused() {
    let engine = new_engine("terminal_idempotent.wal");
    let (room_a, tenants) = seed_room(&engine, "A-1", 2, 1).await;
    let (room_b, _) = seed_room(&engine, "B-1", 2, 0).await;

    let request = submit_exchange(&engine, tenants[0], room_a, room_b).await.unwrap();
    engine.approve(request.id, "admin-1").await.unwrap();

    let occ_a = occupancy(&engine, room_a).await;
    let occ_b = occupancy(&engine, room_b).await;

    // Completed is terminal: neither decision applies, nothing moves.
    let err = engine.approve(request.id, "admin-2").await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::InvalidState { status: RequestStatus::Completed, .. }
    ));
    let err = engine.reject(request.id, "admin-2", "changed my mind").await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidState { .. }));

    assert_eq!(occupancy(&engine, room_a).await, occ_a);
    assert_eq!(occupancy(&engine, room_b).await, occ_b);
    assert_eq!(assigned_room(&engine, tenants[0]).await, Some(room_b));
}

#[tokio::test]
async fn approve_stale_request_after_direct_reassignment() {
    let engine = new_engine("approve_stale.wal");
    let (room_a, tenants) = seed_room(&engine, "A-1", 2, 1).await;
    let (room_b, _) = seed_room(&engine, "B-1", 2, 0).await;
    let (room_c, _) = seed_room(&engine, "C-1", 2, 0).await;

    let request = submit_exchange(&engine, tenants[0], room_a, room_b).await.unwrap();

    // Admin moves the tenant directly while the request is pending.
    engine.reassign_tenant(tenants[0], Some(room_c)).await.unwrap();

    let err = engine.approve(request.id, "admin-1").await.unwrap_err();
    assert!(matches!(err, EngineError::StaleRequest { .. }));

    // The request stays pending for a fresh decision; no occupancy moved.
    assert_eq!(
        engine.get_request(request.id).await.unwrap().status,
        RequestStatus::Pending
    );
    assert_eq!(occupancy(&engine, room_b).await, 0);
    assert_eq!(assigned_room(&engine, tenants[0]).await, Some(room_c));
}

#[tokio::test]
async fn approve_deactivated_tenant_fails() {
    let engine = new_engine("approve_inactive.wal");
    let (room_a, tenants) = seed_room(&engine, "A-1", 2, 1).await;

    let request = submit_vacate(&engine, tenants[0], room_a).await.unwrap();
    engine.deactivate_tenant(tenants[0]).await.unwrap();

    let err = engine.approve(request.id, "admin-1").await.unwrap_err();
    assert!(matches!(err, EngineError::TenantInactive(_)));
    assert_eq!(
        engine.get_request(request.id).await.unwrap().status,
        RequestStatus::Pending
    );
}

#[tokio::test]
async fn approve_exchange_after_room_filled_fails_and_stays_pending() {
    let engine = new_engine("approve_filled.wal");
    let (room_a, tenants) = seed_room(&engine, "A-1", 2, 1).await;
    let (room_b, _) = seed_room(&engine, "B-1", 1, 0).await;

    let request = submit_exchange(&engine, tenants[0], room_a, room_b).await.unwrap();

    // The slot disappears between submission and decision.
    engine
        .register_tenant(Ulid::new(), "late arrival".into(), None, Some(room_b))
        .await
        .unwrap();

    let err = engine.approve(request.id, "admin-1").await.unwrap_err();
    assert!(matches!(err, EngineError::RoomAtCapacity { capacity: 1, .. }));

    assert_eq!(
        engine.get_request(request.id).await.unwrap().status,
        RequestStatus::Pending
    );
    assert_eq!(occupancy(&engine, room_a).await, 1);
    assert_eq!(occupancy(&engine, room_b).await, 1);
}

// ── Concurrency properties ───────────────────────────────────────

#[tokio::test]
async fn concurrent_approvals_never_oversubscribe_a_room() {
    const CAPACITY: u32 = 3;
    let engine = Arc::new(new_engine("approve_capacity_race.wal"));
    let (room_b, _) = seed_room(&engine, "B-1", CAPACITY, 0).await;

    // CAPACITY + 1 tenants, each in their own room, all asking for room B.
    let mut requests = Vec::new();
    for i in 0..(CAPACITY + 1) {
        let (room, tenants) = seed_room(&engine, &format!("A-{i}"), 1, 1).await;
        let request = submit_exchange(&engine, tenants[0], room, room_b).await.unwrap();
        requests.push(request.id);
    }

    let mut handles = Vec::new();
    for id in requests {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move { engine.approve(id, "admin-race").await }));
    }

    let mut completed = 0;
    let mut at_capacity = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(request) => {
                assert_eq!(request.status, RequestStatus::Completed);
                completed += 1;
            }
            Err(EngineError::RoomAtCapacity { .. }) => at_capacity += 1,
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }

    assert_eq!(completed, CAPACITY);
    assert_eq!(at_capacity, 1);
    assert_eq!(occupancy(&engine, room_b).await, CAPACITY);
}

#[tokio::test]
async fn racing_for_the_last_slot_has_exactly_one_winner() {
    let engine = Arc::new(new_engine("last_slot_race.wal"));
    let (room_b, _) = seed_room(&engine, "B-1", 2, 1).await;
    let (room_x, tenants_x) = seed_room(&engine, "X-1", 1, 1).await;
    let (room_y, tenants_y) = seed_room(&engine, "Y-1", 1, 1).await;

    let req_x = submit_exchange(&engine, tenants_x[0], room_x, room_b).await.unwrap();
    let req_y = submit_exchange(&engine, tenants_y[0], room_y, room_b).await.unwrap();

    let ex = engine.clone();
    let ey = engine.clone();
    let (rx, ry) = tokio::join!(
        tokio::spawn(async move { ex.approve(req_x.id, "admin-a").await }),
        tokio::spawn(async move { ey.approve(req_y.id, "admin-b").await }),
    );
    let results = [rx.unwrap(), ry.unwrap()];

    let completed = results.iter().filter(|r| r.is_ok()).count();
    let refused = results
        .iter()
        .filter(|r| matches!(r, Err(EngineError::RoomAtCapacity { .. })))
        .count();
    assert_eq!(completed, 1, "exactly one approval may take the last slot");
    assert_eq!(refused, 1);
    assert_eq!(occupancy(&engine, room_b).await, 2);
}

#[tokio::test]
async fn concurrent_decisions_on_one_request_have_one_winner() {
    let engine = Arc::new(new_engine("decision_race.wal"));
    let (room_a, tenants) = seed_room(&engine, "A-1", 2, 1).await;

    let request = submit_vacate(&engine, tenants[0], room_a).await.unwrap();

    let ea = engine.clone();
    let eb = engine.clone();
    let id = request.id;
    let (ra, rb) = tokio::join!(
        tokio::spawn(async move { ea.approve(id, "admin-a").await.map(|r| r.status) }),
        tokio::spawn(
            async move { eb.reject(id, "admin-b", "duplicate entry").await.map(|r| r.status) }
        ),
    );
    let results = [ra.unwrap(), rb.unwrap()];

    let winners = results.iter().filter(|r| r.is_ok()).count();
    let losers = results
        .iter()
        .filter(|r| matches!(r, Err(EngineError::InvalidState { .. })))
        .count();
    assert_eq!(winners, 1, "exactly one decision wins the pending transition");
    assert_eq!(losers, 1);

    let final_status = engine.get_request(id).await.unwrap().status;
    assert!(final_status.is_terminal());
}

// ── Spec scenarios ───────────────────────────────────────────────

#[tokio::test]
async fn exchange_scenario_fills_room_b() {
    // Room A capacity 2 / occupancy 2, room B capacity 2 / occupancy 1.
    let engine = new_engine("scenario_a_b.wal");
    let (room_a, tenants_a) = seed_room(&engine, "A", 2, 2).await;
    let (room_b, _) = seed_room(&engine, "B", 2, 1).await;
    let (tenant_x, tenant_y) = (tenants_a[0], tenants_a[1]);

    // X requests exchange into B — admitted.
    let request = submit_exchange(&engine, tenant_x, room_a, room_b).await.unwrap();

    // Approve: X now in B; A 1/2, B 2/2.
    engine.approve(request.id, "admin-1").await.unwrap();
    assert_eq!(assigned_room(&engine, tenant_x).await, Some(room_b));
    assert_eq!(occupancy(&engine, room_a).await, 1);
    assert_eq!(occupancy(&engine, room_b).await, 2);

    // Y's exchange into B now fails admission.
    let err = submit_exchange(&engine, tenant_y, room_a, room_b).await.unwrap_err();
    assert!(matches!(err, EngineError::RoomAtCapacity { .. }));
}

#[tokio::test]
async fn vacate_scenario_duplicate_then_reject_then_resubmit() {
    // Tenant Z in room C (1/1) submits a vacate, then tries an exchange
    // before the first is decided.
    let engine = new_engine("scenario_z.wal");
    let (room_c, tenants) = seed_room(&engine, "C", 1, 1).await;
    let (room_d, _) = seed_room(&engine, "D", 2, 0).await;
    let tenant_z = tenants[0];

    let vacate = submit_vacate(&engine, tenant_z, room_c).await.unwrap();
    let err = submit_exchange(&engine, tenant_z, room_c, room_d).await.unwrap_err();
    assert!(matches!(err, EngineError::DuplicateOutstandingRequest { .. }));

    engine.reject(vacate.id, "admin-1", "missing documents").await.unwrap();

    // A new request is now admitted.
    submit_exchange(&engine, tenant_z, room_c, room_d).await.unwrap();
}

// ── Feed ─────────────────────────────────────────────────────────

#[tokio::test]
async fn feed_orders_filters_and_pages() {
    let engine = new_engine("feed.wal");
    let (room_a, tenants_a) = seed_room(&engine, "A-7", 3, 3).await;
    let (room_b, _) = seed_room(&engine, "B-9", 4, 0).await;

    let r1 = engine
        .submit_request(
            Ulid::new(),
            tenants_a[0],
            room_a,
            RequestKind::Vacate,
            "leaving town".into(),
            future_date(),
        )
        .await
        .unwrap();
    let r2 = engine
        .submit_request(
            Ulid::new(),
            tenants_a[1],
            room_a,
            RequestKind::Exchange { desired_room: room_b },
            "noise complaints".into(),
            future_date(),
        )
        .await
        .unwrap();
    let r3 = engine
        .submit_request(
            Ulid::new(),
            tenants_a[2],
            room_a,
            RequestKind::Exchange { desired_room: room_b },
            "closer to campus".into(),
            future_date(),
        )
        .await
        .unwrap();
    engine.reject(r1.id, "admin-1", "paperwork incomplete").await.unwrap();

    // Unfiltered: newest first, joined display fields present.
    let all = engine
        .list_requests(&RequestFilter::default(), Page::default())
        .await
        .unwrap();
    assert_eq!(all.len(), 3);
    assert_eq!(all[0].request.id, r3.id);
    assert_eq!(all[1].request.id, r2.id);
    assert_eq!(all[2].request.id, r1.id);
    assert_eq!(all[0].current_room_number, "A-7");
    assert_eq!(all[0].desired_room_number.as_deref(), Some("B-9"));
    assert!(all[0].tenant_name.starts_with("resident"));

    // Status filter.
    let pending = engine
        .list_requests(
            &RequestFilter { status: Some(RequestStatus::Pending), ..Default::default() },
            Page::default(),
        )
        .await
        .unwrap();
    assert_eq!(pending.len(), 2);

    // Kind filter.
    let vacates = engine
        .list_requests(
            &RequestFilter { kind: Some(KindFilter::Vacate), ..Default::default() },
            Page::default(),
        )
        .await
        .unwrap();
    assert_eq!(vacates.len(), 1);
    assert_eq!(vacates[0].request.id, r1.id);

    // Tenant filter.
    let by_tenant = engine
        .list_requests(
            &RequestFilter { tenant: Some(tenants_a[1]), ..Default::default() },
            Page::default(),
        )
        .await
        .unwrap();
    assert_eq!(by_tenant.len(), 1);
    assert_eq!(by_tenant[0].request.id, r2.id);

    // Free text over reason, case-insensitive.
    let noise = engine
        .list_requests(
            &RequestFilter { text: Some("NOISE".into()), ..Default::default() },
            Page::default(),
        )
        .await
        .unwrap();
    assert_eq!(noise.len(), 1);
    assert_eq!(noise[0].request.id, r2.id);

    // Free text over room number.
    let by_room = engine
        .list_requests(
            &RequestFilter { text: Some("b-9".into()), ..Default::default() },
            Page::default(),
        )
        .await
        .unwrap();
    assert_eq!(by_room.len(), 2);

    // Paging.
    let page = engine
        .list_requests(&RequestFilter::default(), Page { limit: 1, offset: 1 })
        .await
        .unwrap();
    assert_eq!(page.len(), 1);
    assert_eq!(page[0].request.id, r2.id);
}

#[tokio::test]
async fn feed_rejects_oversized_pages() {
    let engine = new_engine("feed_limits.wal");
    let err = engine
        .list_requests(
            &RequestFilter::default(),
            Page { limit: crate::limits::MAX_PAGE_SIZE + 1, offset: 0 },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::LimitExceeded(_)));
}

// ── Registry edges ───────────────────────────────────────────────

#[tokio::test]
async fn room_capacity_cannot_drop_below_occupancy() {
    let engine = new_engine("shrink_room.wal");
    let (room, _) = seed_room(&engine, "A-1", 3, 2).await;

    let err = engine.update_room(room, None, Some(1)).await.unwrap_err();
    assert!(matches!(err, EngineError::RoomAtCapacity { capacity: 1, .. }));

    engine.update_room(room, Some("A-1b".into()), Some(2)).await.unwrap();
    let rooms = engine.list_rooms().await;
    assert_eq!(rooms[0].number, "A-1b");
    assert_eq!(rooms[0].capacity, 2);
}

#[tokio::test]
async fn register_tenant_into_full_room_fails() {
    let engine = new_engine("register_full.wal");
    let (room, _) = seed_room(&engine, "A-1", 1, 1).await;

    let err = engine
        .register_tenant(Ulid::new(), "too many".into(), None, Some(room))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::RoomAtCapacity { .. }));
}

#[tokio::test]
async fn reassign_tenant_moves_occupancy() {
    let engine = new_engine("reassign.wal");
    let (room_a, tenants) = seed_room(&engine, "A-1", 2, 1).await;
    let (room_b, _) = seed_room(&engine, "B-1", 1, 0).await;

    engine.reassign_tenant(tenants[0], Some(room_b)).await.unwrap();
    assert_eq!(occupancy(&engine, room_a).await, 0);
    assert_eq!(occupancy(&engine, room_b).await, 1);

    engine.reassign_tenant(tenants[0], None).await.unwrap();
    assert_eq!(occupancy(&engine, room_b).await, 0);
    assert_eq!(assigned_room(&engine, tenants[0]).await, None);
}

// ── Durability: replay, recovery, compaction ─────────────────────

#[tokio::test]
async fn replay_restores_full_state() {
    let name = "replay_state.wal";
    let (room_a, room_b, tenant, approved_id, rejected_id);
    {
        let engine = new_engine(name);
        let seeded = seed_room(&engine, "A-1", 2, 2).await;
        room_a = seeded.0;
        tenant = seeded.1[0];
        let other = seeded.1[1];
        let seeded_b = seed_room(&engine, "B-1", 2, 0).await;
        room_b = seeded_b.0;

        let ex = submit_exchange(&engine, tenant, room_a, room_b).await.unwrap();
        engine.approve(ex.id, "admin-1").await.unwrap();
        approved_id = ex.id;

        let vac = submit_vacate(&engine, other, room_a).await.unwrap();
        engine.reject(vac.id, "admin-1", "incomplete").await.unwrap();
        rejected_id = vac.id;
    }

    let engine = reopen_engine(name);
    assert_eq!(occupancy(&engine, room_a).await, 1);
    assert_eq!(occupancy(&engine, room_b).await, 1);
    assert_eq!(assigned_room(&engine, tenant).await, Some(room_b));
    assert_eq!(
        engine.get_request(approved_id).await.unwrap().status,
        RequestStatus::Completed
    );
    assert_eq!(
        engine.get_request(rejected_id).await.unwrap().status,
        RequestStatus::Rejected
    );
    // The uniqueness index is rebuilt: both tenants may submit again.
    submit_vacate(&engine, tenant, room_b).await.unwrap();
}

#[tokio::test]
async fn recovery_completes_an_interrupted_approval() {
    let name = "recover_complete.wal";
    let path = test_wal_path(name);

    let room_a = Ulid::new();
    let room_b = Ulid::new();
    let tenant = Ulid::new();
    let request = Ulid::new();

    // Hand-write a WAL that stops after the approval record — the crash
    // window between the two records of an approve call.
    {
        let mut wal = Wal::open(&path).unwrap();
        wal.append(&Event::RoomRegistered { id: room_a, number: "A".into(), capacity: 1, occupancy: 0 }).unwrap();
        wal.append(&Event::RoomRegistered { id: room_b, number: "B".into(), capacity: 1, occupancy: 0 }).unwrap();
        wal.append(&Event::TenantRegistered {
            id: tenant,
            name: "Z. Resident".into(),
            email: None,
            assigned_room: Some(room_a),
        }).unwrap();
        wal.append(&Event::RequestSubmitted {
            id: request,
            tenant_id: tenant,
            current_room: room_a,
            kind: RequestKind::Exchange { desired_room: room_b },
            reason: "quieter wing".into(),
            moving_date: now_ms() + DAY,
            created_at: now_ms(),
        }).unwrap();
        wal.append(&Event::RequestApproved {
            id: request,
            decided_by: "admin-9".into(),
            decided_at: now_ms(),
        }).unwrap();
    }

    let engine = Engine::new(path, Arc::new(NotifyHub::new())).unwrap();
    assert_eq!(
        engine.get_request(request).await.unwrap().status,
        RequestStatus::Approved
    );

    engine.recover().await.unwrap();

    let recovered = engine.get_request(request).await.unwrap();
    assert_eq!(recovered.status, RequestStatus::Completed);
    assert_eq!(recovered.decided_by.as_deref(), Some("admin-9"));
    assert_eq!(assigned_room(&engine, tenant).await, Some(room_b));
    assert_eq!(occupancy(&engine, room_a).await, 0);
    assert_eq!(occupancy(&engine, room_b).await, 1);
}

#[tokio::test]
async fn recovery_reverts_when_the_room_filled_meanwhile() {
    let name = "recover_revert.wal";
    let path = test_wal_path(name);

    let room_a = Ulid::new();
    let room_b = Ulid::new();
    let tenant = Ulid::new();
    let squatter = Ulid::new();
    let request = Ulid::new();

    {
        let mut wal = Wal::open(&path).unwrap();
        wal.append(&Event::RoomRegistered { id: room_a, number: "A".into(), capacity: 1, occupancy: 0 }).unwrap();
        wal.append(&Event::RoomRegistered { id: room_b, number: "B".into(), capacity: 1, occupancy: 0 }).unwrap();
        wal.append(&Event::TenantRegistered {
            id: tenant,
            name: "Z. Resident".into(),
            email: None,
            assigned_room: Some(room_a),
        }).unwrap();
        wal.append(&Event::RequestSubmitted {
            id: request,
            tenant_id: tenant,
            current_room: room_a,
            kind: RequestKind::Exchange { desired_room: room_b },
            reason: "quieter wing".into(),
            moving_date: now_ms() + DAY,
            created_at: now_ms(),
        }).unwrap();
        wal.append(&Event::RequestApproved {
            id: request,
            decided_by: "admin-9".into(),
            decided_at: now_ms(),
        }).unwrap();
        // The target room fills before the engine comes back up.
        wal.append(&Event::TenantRegistered {
            id: squatter,
            name: "Q. Resident".into(),
            email: None,
            assigned_room: Some(room_b),
        }).unwrap();
    }

    let engine = Engine::new(path, Arc::new(NotifyHub::new())).unwrap();
    engine.recover().await.unwrap();

    // The approval is compensated back to pending for a fresh decision.
    let reverted = engine.get_request(request).await.unwrap();
    assert_eq!(reverted.status, RequestStatus::Pending);
    assert_eq!(reverted.decided_by, None);
    assert_eq!(reverted.decided_at, None);
    assert_eq!(assigned_room(&engine, tenant).await, Some(room_a));
    assert_eq!(occupancy(&engine, room_a).await, 1);
    assert_eq!(occupancy(&engine, room_b).await, 1);

    // And the revert is itself durable.
    drop(engine);
    let engine = reopen_engine(name);
    assert_eq!(
        engine.get_request(request).await.unwrap().status,
        RequestStatus::Pending
    );
}

#[tokio::test]
async fn compaction_preserves_state_and_history() {
    let name = "compact_state.wal";
    let (room_a, room_b, tenant, done_id);
    {
        let engine = new_engine(name);
        let seeded = seed_room(&engine, "A-1", 2, 1).await;
        room_a = seeded.0;
        tenant = seeded.1[0];
        let seeded_b = seed_room(&engine, "B-1", 2, 1).await;
        room_b = seeded_b.0;

        // Churn: a rejected request, then a completed exchange.
        let rejected = submit_vacate(&engine, tenant, room_a).await.unwrap();
        engine.reject(rejected.id, "admin-1", "try again later").await.unwrap();
        let ex = submit_exchange(&engine, tenant, room_a, room_b).await.unwrap();
        engine.approve(ex.id, "admin-1").await.unwrap();
        done_id = ex.id;

        engine.compact_wal().await.unwrap();
    }

    let engine = reopen_engine(name);
    assert_eq!(occupancy(&engine, room_a).await, 0);
    assert_eq!(occupancy(&engine, room_b).await, 2);
    assert_eq!(assigned_room(&engine, tenant).await, Some(room_b));
    // Decided history survives compaction.
    assert_eq!(
        engine.get_request(done_id).await.unwrap().status,
        RequestStatus::Completed
    );
    let all = engine
        .list_requests(&RequestFilter::default(), Page::default())
        .await
        .unwrap();
    assert_eq!(all.len(), 2);
    // The outstanding index is intact: a new submission is admitted.
    submit_vacate(&engine, tenant, room_b).await.unwrap();
}

#[tokio::test]
async fn compaction_keeps_preseeded_occupancy() {
    let name = "compact_preseed.wal";
    let room = Ulid::new();
    {
        let engine = new_engine(name);
        // Two occupants exist only as a seed count, not as tenant records.
        engine.register_room(room, "G-2".into(), 4, 2).await.unwrap();
        engine
            .register_tenant(Ulid::new(), "tracked resident".into(), None, Some(room))
            .await
            .unwrap();
        assert_eq!(occupancy(&engine, room).await, 3);

        engine.compact_wal().await.unwrap();
    }

    let engine = reopen_engine(name);
    assert_eq!(occupancy(&engine, room).await, 3);
}
