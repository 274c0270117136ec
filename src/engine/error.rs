use ulid::Ulid;

use crate::model::{Ms, RequestId, RequestStatus, RoomId, TenantId};

#[derive(Debug)]
pub enum EngineError {
    // ── Admission errors: returned to the submitting caller, nothing stored ──
    TenantNotFound(TenantId),
    TenantInactive(TenantId),
    RoomNotFound(RoomId),
    RoomMismatch {
        tenant: TenantId,
        claimed: RoomId,
        actual: Option<RoomId>,
    },
    DuplicateOutstandingRequest {
        tenant: TenantId,
        existing: RequestId,
    },
    RoomAtCapacity {
        room: RoomId,
        capacity: u32,
    },
    NoOpExchange(RoomId),
    InvalidDate(Ms),
    EmptyReason,

    // ── Decision errors: the stored record stays as it was ──
    RequestNotFound(RequestId),
    InvalidState {
        request: RequestId,
        status: RequestStatus,
    },
    StaleRequest {
        request: RequestId,
        claimed: RoomId,
        actual: Option<RoomId>,
    },

    // ── Registry / plumbing ──
    AlreadyExists(Ulid),
    OccupancyUnderflow(RoomId),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    /// True for conditions that indicate a broken atomicity guarantee.
    /// These are alerted, never swallowed.
    pub fn is_integrity_violation(&self) -> bool {
        matches!(self, EngineError::OccupancyUnderflow(_))
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::TenantNotFound(id) => write!(f, "tenant not found: {id}"),
            EngineError::TenantInactive(id) => write!(f, "tenant is not active: {id}"),
            EngineError::RoomNotFound(id) => write!(f, "room not found: {id}"),
            EngineError::RoomMismatch { tenant, claimed, actual } => match actual {
                Some(actual) => write!(
                    f,
                    "tenant {tenant} is assigned to room {actual}, not {claimed}"
                ),
                None => write!(f, "tenant {tenant} has no room assignment (claimed {claimed})"),
            },
            EngineError::DuplicateOutstandingRequest { tenant, existing } => write!(
                f,
                "tenant {tenant} already has an outstanding request: {existing}"
            ),
            EngineError::RoomAtCapacity { room, capacity } => {
                write!(f, "room {room} is at capacity ({capacity}): all slots occupied")
            }
            EngineError::NoOpExchange(room) => {
                write!(f, "exchange into the currently assigned room {room} is a no-op")
            }
            EngineError::InvalidDate(date) => {
                write!(f, "moving date {date} is in the past")
            }
            EngineError::EmptyReason => write!(f, "a non-empty reason is required"),
            EngineError::RequestNotFound(id) => write!(f, "request not found: {id}"),
            EngineError::InvalidState { request, status } => write!(
                f,
                "request {request} is {}, not pending",
                status.label()
            ),
            EngineError::StaleRequest { request, claimed, actual } => match actual {
                Some(actual) => write!(
                    f,
                    "request {request} is stale: tenant moved from {claimed} to {actual}"
                ),
                None => write!(
                    f,
                    "request {request} is stale: tenant no longer assigned to {claimed}"
                ),
            },
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::OccupancyUnderflow(room) => write!(
                f,
                "occupancy underflow on room {room}: release without a matching reservation"
            ),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
