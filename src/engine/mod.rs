mod capacity;
mod error;
mod feed;
mod processor;
mod registry;
mod store;
mod validator;
#[cfg(test)]
mod tests;

pub use error::EngineError;
pub use registry::{RoomRegistry, TenantRegistry};
pub use store::RequestStore;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        done: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        done: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        done: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL. Appends are group-committed: the
/// first one blocks, whatever else is already queued joins its batch, and
/// a single fsync covers them all before any sender hears back.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(first) = rx.recv().await {
        let (event, done) = match first {
            WalCommand::Append { event, done } => (event, done),
            other => {
                service(&mut wal, other);
                continue;
            }
        };

        let mut batch = vec![(event, done)];
        let mut deferred = None;
        while let Ok(cmd) = rx.try_recv() {
            match cmd {
                WalCommand::Append { event, done } => batch.push((event, done)),
                other => {
                    // Commit the in-flight batch before the WAL file moves.
                    deferred = Some(other);
                    break;
                }
            }
        }

        commit(&mut wal, batch);
        if let Some(cmd) = deferred {
            service(&mut wal, cmd);
        }
    }
}

/// Buffer every event in the batch, fsync once, answer every sender.
fn commit(wal: &mut Wal, batch: Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    let mut outcome = Ok(());
    for (event, _) in &batch {
        if let Err(e) = wal.append_buffered(event) {
            outcome = Err(e);
            break;
        }
    }
    // Flush even after an append error so half-buffered bytes don't bleed
    // into the next batch (every sender here is told this one failed).
    let flushed = wal.flush_sync();
    if outcome.is_ok() {
        outcome = flushed;
    }

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());
    for (_, done) in batch {
        let _ = done.send(match &outcome {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        });
    }
}

fn service(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, done } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = done.send(result);
        }
        WalCommand::AppendsSinceCompact { done } => {
            let _ = done.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched above"),
    }
}

/// One site's request lifecycle engine: room and tenant registries, the
/// request store, and the WAL that makes every committed event durable.
pub struct Engine {
    pub(super) rooms: RoomRegistry,
    pub(super) tenants: TenantRegistry,
    pub(super) store: RequestStore,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            rooms: RoomRegistry::new(),
            tenants: TenantRegistry::new(),
            store: RequestStore::new(),
            wal_tx,
            notify,
        };

        // Replay events. We're the sole owner of every Arc here, so
        // try_write always succeeds instantly; an event that cannot apply
        // means the log is corrupt and the engine must not start.
        for event in &events {
            engine
                .apply_replayed(event)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("WAL replay: {e}")))?;
        }

        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                done: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    // ── Event application ────────────────────────────────────

    /// Apply one replayed event. Mirrors exactly what the live write paths
    /// do after their own WAL append; divergence here is a bug.
    fn apply_replayed(&self, event: &Event) -> Result<(), EngineError> {
        match event {
            Event::RoomRegistered { id, number, capacity, occupancy } => {
                if self.rooms.contains(id) {
                    return Err(EngineError::AlreadyExists(*id));
                }
                if occupancy > capacity {
                    return Err(EngineError::RoomAtCapacity { room: *id, capacity: *capacity });
                }
                self.rooms.insert(
                    *id,
                    Arc::new(tokio::sync::RwLock::new(RoomState::new(
                        *id,
                        number.clone(),
                        *capacity,
                        *occupancy,
                    ))),
                );
            }
            Event::RoomUpdated { id, number, capacity } => {
                let rs = self.rooms.get(id).ok_or(EngineError::RoomNotFound(*id))?;
                let mut room = rs.try_write().expect("replay: uncontended write");
                if *capacity < room.occupancy {
                    return Err(EngineError::RoomAtCapacity { room: *id, capacity: *capacity });
                }
                room.number = number.clone();
                room.capacity = *capacity;
            }
            Event::TenantRegistered { id, name, email, assigned_room } => {
                if self.tenants.contains(id) {
                    return Err(EngineError::AlreadyExists(*id));
                }
                if let Some(room_id) = assigned_room {
                    let rs = self.rooms.get(room_id).ok_or(EngineError::RoomNotFound(*room_id))?;
                    let mut room = rs.try_write().expect("replay: uncontended write");
                    capacity::reserve_slot(&mut room)?;
                }
                self.tenants.insert(
                    *id,
                    Arc::new(tokio::sync::RwLock::new(TenantState::new(
                        *id,
                        name.clone(),
                        email.clone(),
                        *assigned_room,
                    ))),
                );
            }
            Event::TenantDeactivated { id } => {
                let ts = self.tenants.get(id).ok_or(EngineError::TenantNotFound(*id))?;
                ts.try_write().expect("replay: uncontended write").active = false;
            }
            Event::TenantReassigned { id, room } => {
                let ts = self.tenants.get(id).ok_or(EngineError::TenantNotFound(*id))?;
                let mut tenant = ts.try_write().expect("replay: uncontended write");
                if tenant.assigned_room == *room {
                    return Ok(());
                }
                if let Some(new_id) = room {
                    let rs = self.rooms.get(new_id).ok_or(EngineError::RoomNotFound(*new_id))?;
                    let mut new_room = rs.try_write().expect("replay: uncontended write");
                    capacity::reserve_slot(&mut new_room)?;
                }
                if let Some(old_id) = tenant.assigned_room {
                    let rs = self.rooms.get(&old_id).ok_or(EngineError::RoomNotFound(old_id))?;
                    let mut old_room = rs.try_write().expect("replay: uncontended write");
                    capacity::release_slot(&mut old_room)?;
                }
                tenant.assigned_room = *room;
            }
            Event::RequestSubmitted { id, tenant_id, current_room, kind, reason, moving_date, created_at } => {
                if self.store.contains(id) {
                    return Err(EngineError::AlreadyExists(*id));
                }
                self.store
                    .claim_outstanding(*tenant_id, *id)
                    .map_err(|existing| EngineError::DuplicateOutstandingRequest {
                        tenant: *tenant_id,
                        existing,
                    })?;
                self.store.insert(ChangeRequest {
                    id: *id,
                    tenant_id: *tenant_id,
                    current_room: *current_room,
                    kind: *kind,
                    reason: reason.clone(),
                    moving_date: *moving_date,
                    status: RequestStatus::Pending,
                    created_at: *created_at,
                    decided_at: None,
                    decided_by: None,
                    rejection_reason: None,
                });
            }
            Event::RequestApproved { id, decided_by, decided_at } => {
                let req = self.store.get(id).ok_or(EngineError::RequestNotFound(*id))?;
                let mut request = req.try_write().expect("replay: uncontended write");
                store::check_expected(&request, RequestStatus::Pending).map_err(|c| {
                    EngineError::InvalidState { request: *id, status: c.actual }
                })?;
                apply_approved(&mut request, decided_by, *decided_at);
            }
            Event::RequestRejected { id, decided_by, decided_at, reason } => {
                let req = self.store.get(id).ok_or(EngineError::RequestNotFound(*id))?;
                let mut request = req.try_write().expect("replay: uncontended write");
                store::check_expected(&request, RequestStatus::Pending).map_err(|c| {
                    EngineError::InvalidState { request: *id, status: c.actual }
                })?;
                apply_rejected(&self.store, &mut request, decided_by, *decided_at, reason);
            }
            Event::RequestCompleted { id } => {
                let req = self.store.get(id).ok_or(EngineError::RequestNotFound(*id))?;
                let mut request = req.try_write().expect("replay: uncontended write");
                store::check_expected(&request, RequestStatus::Approved).map_err(|c| {
                    EngineError::InvalidState { request: *id, status: c.actual }
                })?;
                let ts = self
                    .tenants
                    .get(&request.tenant_id)
                    .ok_or(EngineError::TenantNotFound(request.tenant_id))?;
                let mut tenant = ts.try_write().expect("replay: uncontended write");
                match request.kind {
                    RequestKind::Vacate => {
                        let rs = self
                            .rooms
                            .get(&request.current_room)
                            .ok_or(EngineError::RoomNotFound(request.current_room))?;
                        let mut room = rs.try_write().expect("replay: uncontended write");
                        apply_completed_vacate(&self.store, &mut request, &mut tenant, &mut room)?;
                    }
                    RequestKind::Exchange { desired_room } => {
                        let rs_cur = self
                            .rooms
                            .get(&request.current_room)
                            .ok_or(EngineError::RoomNotFound(request.current_room))?;
                        let rs_des = self
                            .rooms
                            .get(&desired_room)
                            .ok_or(EngineError::RoomNotFound(desired_room))?;
                        let mut current = rs_cur.try_write().expect("replay: uncontended write");
                        let mut desired = rs_des.try_write().expect("replay: uncontended write");
                        apply_completed_exchange(
                            &self.store,
                            &mut request,
                            &mut tenant,
                            &mut current,
                            &mut desired,
                        )?;
                    }
                }
            }
            Event::ApprovalReverted { id } => {
                let req = self.store.get(id).ok_or(EngineError::RequestNotFound(*id))?;
                let mut request = req.try_write().expect("replay: uncontended write");
                store::check_expected(&request, RequestStatus::Approved).map_err(|c| {
                    EngineError::InvalidState { request: *id, status: c.actual }
                })?;
                apply_reverted(&mut request);
            }
            Event::RequestArchived { request } => {
                if self.store.contains(&request.id) {
                    return Err(EngineError::AlreadyExists(request.id));
                }
                self.store.insert(request.clone());
            }
        }
        Ok(())
    }

    /// Resolve approvals that were durably recorded but not completed —
    /// i.e. a crash landed between the two records of an approve call.
    /// Each is re-validated and either finished or reverted to `Pending`.
    pub async fn recover(&self) -> Result<(), EngineError> {
        let mut interrupted = Vec::new();
        for id in self.store.ids() {
            if let Some(req) = self.store.get(&id) {
                let guard = req.read().await;
                if guard.status == RequestStatus::Approved {
                    interrupted.push(id);
                }
            }
        }
        for id in interrupted {
            self.finish_recovered_approval(id).await?;
        }
        Ok(())
    }

    /// Compact the WAL into a minimal snapshot event stream. Takes read
    /// guards on every record — requests, then tenants, then rooms, the
    /// same class order every writer uses — so the snapshot is a consistent
    /// cut.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let mut request_guards = Vec::new();
        for id in self.store.ids() {
            if let Some(req) = self.store.get(&id) {
                request_guards.push(req.read_owned().await);
            }
        }
        let mut tenant_guards = Vec::new();
        for id in self.tenants.ids() {
            if let Some(ts) = self.tenants.get(&id) {
                tenant_guards.push(ts.read_owned().await);
            }
        }
        let mut room_guards = Vec::new();
        for id in self.rooms.ids() {
            if let Some(rs) = self.rooms.get(&id) {
                room_guards.push(rs.read_owned().await);
            }
        }

        // Rooms come first, carrying only the occupancy that tenant
        // registrations won't add back (pre-seeded occupants).
        let mut assigned_counts: std::collections::HashMap<RoomId, u32> =
            std::collections::HashMap::new();
        for tenant in &tenant_guards {
            if let Some(room_id) = tenant.assigned_room {
                *assigned_counts.entry(room_id).or_default() += 1;
            }
        }

        let mut events = Vec::new();
        for room in &room_guards {
            let derived = assigned_counts.get(&room.id).copied().unwrap_or(0);
            events.push(Event::RoomRegistered {
                id: room.id,
                number: room.number.clone(),
                capacity: room.capacity,
                occupancy: room.occupancy.saturating_sub(derived),
            });
        }
        for tenant in &tenant_guards {
            events.push(Event::TenantRegistered {
                id: tenant.id,
                name: tenant.name.clone(),
                email: tenant.email.clone(),
                assigned_room: tenant.assigned_room,
            });
            if !tenant.active {
                events.push(Event::TenantDeactivated { id: tenant.id });
            }
        }
        let mut requests: Vec<ChangeRequest> =
            request_guards.iter().map(|g| (**g).clone()).collect();
        requests.sort_by_key(|r| (r.created_at, r.id));
        for request in requests {
            events.push(Event::RequestArchived { request });
        }

        drop(room_guards);
        drop(tenant_guards);
        drop(request_guards);

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, done: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { done: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

// ── Shared apply helpers (live write path + replay) ──────────────

pub(super) fn apply_approved(request: &mut ChangeRequest, decided_by: &str, decided_at: Ms) {
    request.status = RequestStatus::Approved;
    request.decided_by = Some(decided_by.to_string());
    request.decided_at = Some(decided_at);
}

pub(super) fn apply_rejected(
    store: &RequestStore,
    request: &mut ChangeRequest,
    decided_by: &str,
    decided_at: Ms,
    reason: &str,
) {
    request.status = RequestStatus::Rejected;
    request.decided_by = Some(decided_by.to_string());
    request.decided_at = Some(decided_at);
    request.rejection_reason = Some(reason.to_string());
    store.release_claim(&request.tenant_id, request.id);
}

pub(super) fn apply_reverted(request: &mut ChangeRequest) {
    request.status = RequestStatus::Pending;
    request.decided_by = None;
    request.decided_at = None;
}

/// Completion of a vacate: free the slot, clear the assignment, close out
/// the request. Occupancy moves before the status flip so a failure leaves
/// the request outstanding, never silently closed.
pub(super) fn apply_completed_vacate(
    store: &RequestStore,
    request: &mut ChangeRequest,
    tenant: &mut TenantState,
    room: &mut RoomState,
) -> Result<(), EngineError> {
    capacity::release_slot(room)?;
    tenant.assigned_room = None;
    request.status = RequestStatus::Completed;
    store.release_claim(&request.tenant_id, request.id);
    Ok(())
}

/// Completion of an exchange: reserve the target, free the source, move the
/// tenant, close out the request.
pub(super) fn apply_completed_exchange(
    store: &RequestStore,
    request: &mut ChangeRequest,
    tenant: &mut TenantState,
    current: &mut RoomState,
    desired: &mut RoomState,
) -> Result<(), EngineError> {
    capacity::reserve_slot(desired)?;
    capacity::release_slot(current)?;
    tenant.assigned_room = Some(desired.id);
    request.status = RequestStatus::Completed;
    store.release_claim(&request.tenant_id, request.id);
    Ok(())
}
