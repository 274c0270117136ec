use std::sync::Arc;

use tokio::sync::RwLock;

use crate::limits::*;
use crate::model::*;

use super::validator::{self, now_ms};
use super::{
    apply_approved, apply_completed_exchange, apply_completed_vacate, apply_rejected,
    apply_reverted, capacity, store, Engine, EngineError,
};

impl Engine {
    // ── Registry maintenance (directory write-through) ───────────

    pub async fn register_room(
        &self,
        id: RoomId,
        number: String,
        capacity_slots: u32,
        occupancy: u32,
    ) -> Result<(), EngineError> {
        if self.rooms.len() >= MAX_ROOMS_PER_SITE {
            return Err(EngineError::LimitExceeded("too many rooms"));
        }
        if number.is_empty() || number.len() > MAX_ROOM_NUMBER_LEN {
            return Err(EngineError::LimitExceeded("bad room number"));
        }
        if capacity_slots == 0 || capacity_slots > MAX_ROOM_CAPACITY {
            return Err(EngineError::LimitExceeded("bad room capacity"));
        }
        if occupancy > capacity_slots {
            return Err(EngineError::RoomAtCapacity { room: id, capacity: capacity_slots });
        }
        if self.rooms.contains(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::RoomRegistered {
            id,
            number: number.clone(),
            capacity: capacity_slots,
            occupancy,
        };
        self.wal_append(&event).await?;
        self.rooms.insert(
            id,
            Arc::new(RwLock::new(RoomState::new(id, number, capacity_slots, occupancy))),
        );
        self.notify.send(id, &event);
        Ok(())
    }

    /// Update a room's display number and/or capacity. Capacity may not
    /// drop below the current occupancy.
    pub async fn update_room(
        &self,
        id: RoomId,
        number: Option<String>,
        capacity_slots: Option<u32>,
    ) -> Result<(), EngineError> {
        if let Some(ref n) = number
            && (n.is_empty() || n.len() > MAX_ROOM_NUMBER_LEN) {
                return Err(EngineError::LimitExceeded("bad room number"));
            }
        if let Some(c) = capacity_slots
            && (c == 0 || c > MAX_ROOM_CAPACITY) {
                return Err(EngineError::LimitExceeded("bad room capacity"));
            }
        let mut room = capacity::lock_room(&self.rooms, id).await?;

        let new_number = number.unwrap_or_else(|| room.number.clone());
        let new_capacity = capacity_slots.unwrap_or(room.capacity);
        if new_capacity < room.occupancy {
            return Err(EngineError::RoomAtCapacity { room: id, capacity: new_capacity });
        }

        let event = Event::RoomUpdated { id, number: new_number.clone(), capacity: new_capacity };
        self.wal_append(&event).await?;
        room.number = new_number;
        room.capacity = new_capacity;
        self.notify.send(id, &event);
        Ok(())
    }

    pub async fn register_tenant(
        &self,
        id: TenantId,
        name: String,
        email: Option<String>,
        assigned_room: Option<RoomId>,
    ) -> Result<(), EngineError> {
        if self.tenants.len() >= MAX_TENANTS_PER_SITE {
            return Err(EngineError::LimitExceeded("too many tenants"));
        }
        if name.is_empty() || name.len() > MAX_TENANT_NAME_LEN {
            return Err(EngineError::LimitExceeded("bad tenant name"));
        }
        if let Some(ref e) = email
            && e.len() > MAX_EMAIL_LEN {
                return Err(EngineError::LimitExceeded("email too long"));
            }
        if self.tenants.contains(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::TenantRegistered {
            id,
            name: name.clone(),
            email: email.clone(),
            assigned_room,
        };

        match assigned_room {
            Some(room_id) => {
                // Registering into a room takes a slot; hold the room lock
                // across the capacity check and the occupancy write.
                let mut room = capacity::lock_room(&self.rooms, room_id).await?;
                if !room.has_free_slot() {
                    return Err(EngineError::RoomAtCapacity {
                        room: room_id,
                        capacity: room.capacity,
                    });
                }
                self.wal_append(&event).await?;
                capacity::reserve_slot(&mut room)?;
                self.tenants.insert(
                    id,
                    Arc::new(RwLock::new(TenantState::new(id, name, email, Some(room_id)))),
                );
                self.notify.send(room_id, &event);
            }
            None => {
                self.wal_append(&event).await?;
                self.tenants
                    .insert(id, Arc::new(RwLock::new(TenantState::new(id, name, email, None))));
                self.notify.send_global(&event);
            }
        }
        Ok(())
    }

    pub async fn deactivate_tenant(&self, id: TenantId) -> Result<(), EngineError> {
        let ts = self.tenants.get(&id).ok_or(EngineError::TenantNotFound(id))?;
        let mut tenant = ts.write_owned().await;

        let event = Event::TenantDeactivated { id };
        self.wal_append(&event).await?;
        tenant.active = false;
        self.notify.send_global(&event);
        Ok(())
    }

    /// Direct admin edit of a tenant's room assignment, outside the request
    /// workflow. Occupancy moves atomically with the assignment; a pending
    /// request referencing the old room becomes stale and will be refused at
    /// approval time.
    pub async fn reassign_tenant(
        &self,
        id: TenantId,
        room: Option<RoomId>,
    ) -> Result<(), EngineError> {
        let ts = self.tenants.get(&id).ok_or(EngineError::TenantNotFound(id))?;
        let mut tenant = ts.write_owned().await;
        if tenant.assigned_room == room {
            return Ok(());
        }

        let event = Event::TenantReassigned { id, room };
        match (tenant.assigned_room, room) {
            (Some(old_id), Some(new_id)) => {
                let (mut old_room, mut new_room) =
                    capacity::lock_room_pair(&self.rooms, old_id, new_id).await?;
                if !new_room.has_free_slot() {
                    return Err(EngineError::RoomAtCapacity {
                        room: new_id,
                        capacity: new_room.capacity,
                    });
                }
                self.wal_append(&event).await?;
                capacity::reserve_slot(&mut new_room)?;
                capacity::release_slot(&mut old_room)?;
                tenant.assigned_room = Some(new_id);
                self.notify.publish(&[old_id, new_id], &event);
            }
            (None, Some(new_id)) => {
                let mut new_room = capacity::lock_room(&self.rooms, new_id).await?;
                if !new_room.has_free_slot() {
                    return Err(EngineError::RoomAtCapacity {
                        room: new_id,
                        capacity: new_room.capacity,
                    });
                }
                self.wal_append(&event).await?;
                capacity::reserve_slot(&mut new_room)?;
                tenant.assigned_room = Some(new_id);
                self.notify.send(new_id, &event);
            }
            (Some(old_id), None) => {
                let mut old_room = capacity::lock_room(&self.rooms, old_id).await?;
                self.wal_append(&event).await?;
                capacity::release_slot(&mut old_room)?;
                tenant.assigned_room = None;
                self.notify.send(old_id, &event);
            }
            (None, None) => unreachable!("equal assignments returned above"),
        }
        Ok(())
    }

    // ── Submission ───────────────────────────────────────────────

    /// Admit a change request into `Pending`, or refuse it with the first
    /// failed admission check. Nothing is stored on refusal.
    pub async fn submit_request(
        &self,
        id: RequestId,
        tenant_id: TenantId,
        current_room: RoomId,
        kind: RequestKind,
        reason: String,
        moving_date: Ms,
    ) -> Result<ChangeRequest, EngineError> {
        validator::check_reason(&reason)?;
        if self.store.contains(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let ts = self
            .tenants
            .get(&tenant_id)
            .ok_or(EngineError::TenantNotFound(tenant_id))?;
        let tenant = ts.read_owned().await;

        validator::check_tenant_active(&tenant)?;
        validator::check_room_claim(&tenant, current_room)?;
        validator::check_no_outstanding(&tenant, self.store.outstanding_for(&tenant_id))?;
        if let RequestKind::Exchange { desired_room } = kind {
            let rs = self
                .rooms
                .get(&desired_room)
                .ok_or(EngineError::RoomNotFound(desired_room))?;
            let desired = rs.read().await;
            validator::check_exchange_target(current_room, &desired)?;
        }
        let now = now_ms();
        validator::check_moving_date(moving_date, now)?;

        // Claim the tenant's single outstanding slot before going durable,
        // so a racing submission can't be admitted in the append window.
        self.store
            .claim_outstanding(tenant_id, id)
            .map_err(|existing| EngineError::DuplicateOutstandingRequest {
                tenant: tenant_id,
                existing,
            })?;

        let event = Event::RequestSubmitted {
            id,
            tenant_id,
            current_room,
            kind,
            reason: reason.clone(),
            moving_date,
            created_at: now,
        };
        if let Err(e) = self.wal_append(&event).await {
            self.store.release_claim(&tenant_id, id);
            return Err(e);
        }

        let request = ChangeRequest {
            id,
            tenant_id,
            current_room,
            kind,
            reason,
            moving_date,
            status: RequestStatus::Pending,
            created_at: now,
            decided_at: None,
            decided_by: None,
            rejection_reason: None,
        };
        self.store.insert(request.clone());
        self.notify.send(current_room, &event);
        metrics::counter!(crate::observability::REQUESTS_SUBMITTED_TOTAL).increment(1);
        Ok(request)
    }

    // ── Decisions ────────────────────────────────────────────────

    /// Reject a pending request. No side effects on rooms or tenants.
    pub async fn reject(
        &self,
        id: RequestId,
        admin: &str,
        reason: &str,
    ) -> Result<ChangeRequest, EngineError> {
        check_admin(admin)?;
        validator::check_reason(reason)?;

        let req = self.store.get(&id).ok_or(EngineError::RequestNotFound(id))?;
        let mut request = req.write_owned().await;
        store::check_expected(&request, RequestStatus::Pending)
            .map_err(|c| EngineError::InvalidState { request: id, status: c.actual })?;

        let decided_at = now_ms();
        let event = Event::RequestRejected {
            id,
            decided_by: admin.to_string(),
            decided_at,
            reason: reason.to_string(),
        };
        self.wal_append(&event).await?;
        apply_rejected(&self.store, &mut request, admin, decided_at, reason);
        self.notify.send(request.current_room, &event);
        metrics::counter!(crate::observability::DECISIONS_TOTAL, "outcome" => "rejected")
            .increment(1);
        Ok(request.clone())
    }

    /// Approve a pending request and complete it as one atomic unit:
    /// re-validate under the held locks, go durable, then apply. An exchange
    /// whose target filled up since submission fails `RoomAtCapacity` and
    /// stays `Pending` for a fresh decision.
    pub async fn approve(&self, id: RequestId, admin: &str) -> Result<ChangeRequest, EngineError> {
        check_admin(admin)?;

        let req = self.store.get(&id).ok_or(EngineError::RequestNotFound(id))?;
        let mut request = req.write_owned().await;
        store::check_expected(&request, RequestStatus::Pending)
            .map_err(|c| EngineError::InvalidState { request: id, status: c.actual })?;

        let ts = self
            .tenants
            .get(&request.tenant_id)
            .ok_or(EngineError::TenantNotFound(request.tenant_id))?;
        let mut tenant = ts.write_owned().await;
        validator::recheck_at_decision(&request, &tenant)?;

        let decided_at = now_ms();
        let approved = Event::RequestApproved {
            id,
            decided_by: admin.to_string(),
            decided_at,
        };
        let completed = Event::RequestCompleted { id };

        match request.kind {
            RequestKind::Vacate => {
                let mut room = capacity::lock_room(&self.rooms, request.current_room).await?;
                self.wal_append(&approved).await?;
                apply_approved(&mut request, admin, decided_at);
                self.wal_append(&completed).await?;
                self.alert_on_integrity_failure(apply_completed_vacate(
                    &self.store,
                    &mut request,
                    &mut tenant,
                    &mut room,
                ))?;
                self.notify.send(room.id, &completed);
            }
            RequestKind::Exchange { desired_room } => {
                if desired_room == request.current_room {
                    return Err(EngineError::NoOpExchange(desired_room));
                }
                let (mut current, mut desired) =
                    capacity::lock_room_pair(&self.rooms, request.current_room, desired_room)
                        .await?;
                // The admission-time capacity check is stale by now; this one
                // holds the room lock, so it is the one that counts.
                if !desired.has_free_slot() {
                    metrics::counter!(crate::observability::RESERVATION_CONFLICTS_TOTAL)
                        .increment(1);
                    return Err(EngineError::RoomAtCapacity {
                        room: desired_room,
                        capacity: desired.capacity,
                    });
                }
                self.wal_append(&approved).await?;
                apply_approved(&mut request, admin, decided_at);
                self.wal_append(&completed).await?;
                self.alert_on_integrity_failure(apply_completed_exchange(
                    &self.store,
                    &mut request,
                    &mut tenant,
                    &mut current,
                    &mut desired,
                ))?;
                self.notify.publish(&[current.id, desired.id], &completed);
            }
        }

        metrics::counter!(crate::observability::DECISIONS_TOTAL, "outcome" => "approved")
            .increment(1);
        Ok(request.clone())
    }

    fn alert_on_integrity_failure(&self, result: Result<(), EngineError>) -> Result<(), EngineError> {
        if let Err(ref e) = result
            && e.is_integrity_violation() {
                tracing::error!("integrity violation while completing an approval: {e}");
            }
        result
    }

    // ── Crash recovery ───────────────────────────────────────────

    /// Finish (or revert) one approval that was recorded without its
    /// completion. Idempotent: a request no longer `Approved` is skipped.
    pub(super) async fn finish_recovered_approval(&self, id: RequestId) -> Result<(), EngineError> {
        let Some(req) = self.store.get(&id) else {
            return Ok(());
        };
        let mut request = req.write_owned().await;
        if request.status != RequestStatus::Approved {
            return Ok(());
        }

        let Some(ts) = self.tenants.get(&request.tenant_id) else {
            return self.revert_approval(&mut request).await;
        };
        let mut tenant = ts.write_owned().await;
        if validator::recheck_at_decision(&request, &tenant).is_err() {
            return self.revert_approval(&mut request).await;
        }

        let completed = Event::RequestCompleted { id };
        match request.kind {
            RequestKind::Vacate => {
                let Ok(mut room) = capacity::lock_room(&self.rooms, request.current_room).await
                else {
                    return self.revert_approval(&mut request).await;
                };
                self.wal_append(&completed).await?;
                apply_completed_vacate(&self.store, &mut request, &mut tenant, &mut room)?;
                self.notify.send(room.id, &completed);
            }
            RequestKind::Exchange { desired_room } => {
                let Ok((mut current, mut desired)) =
                    capacity::lock_room_pair(&self.rooms, request.current_room, desired_room).await
                else {
                    return self.revert_approval(&mut request).await;
                };
                if !desired.has_free_slot() {
                    drop((current, desired));
                    return self.revert_approval(&mut request).await;
                }
                self.wal_append(&completed).await?;
                apply_completed_exchange(
                    &self.store,
                    &mut request,
                    &mut tenant,
                    &mut current,
                    &mut desired,
                )?;
                self.notify.publish(&[current.id, desired.id], &completed);
            }
        }
        tracing::info!(request = %id, "completed an interrupted approval");
        Ok(())
    }

    async fn revert_approval(&self, request: &mut ChangeRequest) -> Result<(), EngineError> {
        let event = Event::ApprovalReverted { id: request.id };
        self.wal_append(&event).await?;
        apply_reverted(request);
        self.notify.send(request.current_room, &event);
        tracing::warn!(
            request = %request.id,
            "interrupted approval could not be completed; reverted to pending"
        );
        Ok(())
    }
}

fn check_admin(admin: &str) -> Result<(), EngineError> {
    if admin.is_empty() || admin.len() > MAX_ADMIN_ID_LEN {
        return Err(EngineError::LimitExceeded("bad admin id"));
    }
    Ok(())
}
