//! Admission checks, run in order and short-circuiting on the first failure.
//! Everything here is read-only: passing only proves admissibility at this
//! instant, and the capacity check is re-verified under the room lock at
//! decision time.

use crate::limits::*;
use crate::model::{ChangeRequest, Ms, RequestId, RoomId, RoomState, TenantState};

use super::EngineError;

const DAY_MS: Ms = 86_400_000;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as Ms
}

/// Floor a timestamp to the start of its UTC day.
pub(crate) fn day_floor(t: Ms) -> Ms {
    t - t.rem_euclid(DAY_MS)
}

pub(crate) fn check_reason(reason: &str) -> Result<(), EngineError> {
    if reason.trim().is_empty() {
        return Err(EngineError::EmptyReason);
    }
    if reason.len() > MAX_REASON_LEN {
        return Err(EngineError::LimitExceeded("reason too long"));
    }
    Ok(())
}

pub(crate) fn check_tenant_active(tenant: &TenantState) -> Result<(), EngineError> {
    if !tenant.active {
        return Err(EngineError::TenantInactive(tenant.id));
    }
    Ok(())
}

/// Guard against stale client state: the claimed room must be the tenant's
/// assignment at the instant of the check.
pub(crate) fn check_room_claim(tenant: &TenantState, claimed: RoomId) -> Result<(), EngineError> {
    if tenant.assigned_room != Some(claimed) {
        return Err(EngineError::RoomMismatch {
            tenant: tenant.id,
            claimed,
            actual: tenant.assigned_room,
        });
    }
    Ok(())
}

pub(crate) fn check_no_outstanding(
    tenant: &TenantState,
    existing: Option<RequestId>,
) -> Result<(), EngineError> {
    if let Some(existing) = existing {
        return Err(EngineError::DuplicateOutstandingRequest {
            tenant: tenant.id,
            existing,
        });
    }
    Ok(())
}

/// Exchange-only target checks: a free slot, and not the room the tenant is
/// already in.
pub(crate) fn check_exchange_target(
    current_room: RoomId,
    desired: &RoomState,
) -> Result<(), EngineError> {
    if !desired.has_free_slot() {
        return Err(EngineError::RoomAtCapacity {
            room: desired.id,
            capacity: desired.capacity,
        });
    }
    if desired.id == current_room {
        return Err(EngineError::NoOpExchange(current_room));
    }
    Ok(())
}

/// The moving date may be today but not strictly before it.
pub(crate) fn check_moving_date(date: Ms, now: Ms) -> Result<(), EngineError> {
    if !(MIN_VALID_TIMESTAMP_MS..=MAX_VALID_TIMESTAMP_MS).contains(&date) {
        return Err(EngineError::LimitExceeded("moving date out of range"));
    }
    if date < day_floor(now) {
        return Err(EngineError::InvalidDate(date));
    }
    Ok(())
}

/// The subset of admission checks that can have gone stale between
/// submission and decision: tenant still active, and still in the room the
/// request was written against. A mismatch at this point means the tenant
/// moved since submitting — `StaleRequest`, not `RoomMismatch`.
pub(crate) fn recheck_at_decision(
    request: &ChangeRequest,
    tenant: &TenantState,
) -> Result<(), EngineError> {
    check_tenant_active(tenant)?;
    if tenant.assigned_room != Some(request.current_room) {
        return Err(EngineError::StaleRequest {
            request: request.id,
            claimed: request.current_room,
            actual: tenant.assigned_room,
        });
    }
    Ok(())
}
