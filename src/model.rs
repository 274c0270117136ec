use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — the only time type.
pub type Ms = i64;

pub type RoomId = Ulid;
pub type TenantId = Ulid;
pub type RequestId = Ulid;

/// A room as this workflow sees it. `occupancy` counts residents currently
/// holding a slot; invariant `occupancy <= capacity` at all times.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomState {
    pub id: RoomId,
    pub number: String,
    pub capacity: u32,
    pub occupancy: u32,
}

impl RoomState {
    pub fn new(id: RoomId, number: String, capacity: u32, occupancy: u32) -> Self {
        debug_assert!(occupancy <= capacity, "occupancy must not exceed capacity");
        Self { id, number, capacity, occupancy }
    }

    pub fn has_free_slot(&self) -> bool {
        self.occupancy < self.capacity
    }
}

/// A resident. `assigned_room` is the authoritative current assignment;
/// requests carry the room the tenant *claimed* at submission time and the
/// two are re-compared at decision time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantState {
    pub id: TenantId,
    pub name: String,
    pub email: Option<String>,
    pub active: bool,
    pub assigned_room: Option<RoomId>,
}

impl TenantState {
    pub fn new(id: TenantId, name: String, email: Option<String>, assigned_room: Option<RoomId>) -> Self {
        Self { id, name, email, active: true, assigned_room }
    }
}

/// What a change request asks for. Exchange carries its target room so the
/// field cannot exist on a vacate and cannot be missing on an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestKind {
    Exchange { desired_room: RoomId },
    Vacate,
}

impl RequestKind {
    pub fn desired_room(&self) -> Option<RoomId> {
        match self {
            RequestKind::Exchange { desired_room } => Some(*desired_room),
            RequestKind::Vacate => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            RequestKind::Exchange { .. } => "exchange",
            RequestKind::Vacate => "vacate",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestStatus {
    Pending,
    Approved,
    Rejected,
    Completed,
}

impl RequestStatus {
    /// Outstanding = still blocks the tenant from submitting another request.
    pub fn is_outstanding(&self) -> bool {
        matches!(self, RequestStatus::Pending | RequestStatus::Approved)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestStatus::Rejected | RequestStatus::Completed)
    }

    pub fn label(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Approved => "approved",
            RequestStatus::Rejected => "rejected",
            RequestStatus::Completed => "completed",
        }
    }
}

/// The central entity. Created in `Pending` by tenant submission; mutated
/// only by the approval processor afterwards; never deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRequest {
    pub id: RequestId,
    pub tenant_id: TenantId,
    /// Room the tenant occupied at submission time.
    pub current_room: RoomId,
    pub kind: RequestKind,
    pub reason: String,
    /// Preferred moving date (exchange) or vacating date (vacate).
    pub moving_date: Ms,
    pub status: RequestStatus,
    pub created_at: Ms,
    pub decided_at: Option<Ms>,
    pub decided_by: Option<String>,
    pub rejection_reason: Option<String>,
}

/// The event types — flat, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    RoomRegistered {
        id: RoomId,
        number: String,
        capacity: u32,
        /// Pre-existing occupants not tracked as tenants (usually 0).
        occupancy: u32,
    },
    RoomUpdated {
        id: RoomId,
        number: String,
        capacity: u32,
    },
    TenantRegistered {
        id: TenantId,
        name: String,
        email: Option<String>,
        /// When set, applying this event reserves a slot in that room.
        assigned_room: Option<RoomId>,
    },
    TenantDeactivated {
        id: TenantId,
    },
    /// Direct admin edit of an assignment, outside the request workflow.
    /// Applying it moves occupancy from the old room to the new one.
    TenantReassigned {
        id: TenantId,
        room: Option<RoomId>,
    },
    RequestSubmitted {
        id: RequestId,
        tenant_id: TenantId,
        current_room: RoomId,
        kind: RequestKind,
        reason: String,
        moving_date: Ms,
        created_at: Ms,
    },
    RequestApproved {
        id: RequestId,
        decided_by: String,
        decided_at: Ms,
    },
    RequestRejected {
        id: RequestId,
        decided_by: String,
        decided_at: Ms,
        reason: String,
    },
    /// Applying this performs the full completion: occupancy moves and the
    /// tenant reassignment, all derived from the stored request.
    RequestCompleted {
        id: RequestId,
    },
    /// Compensation for an approval interrupted before completion: the
    /// request returns to `Pending` and the decision is retaken.
    ApprovalReverted {
        id: RequestId,
    },
    /// Compaction snapshot record — inserts the request as-is, no side
    /// effects on rooms or tenants.
    RequestArchived {
        request: ChangeRequest,
    },
}

// ── Query result types ───────────────────────────────────────────

/// A feed row: the request joined with tenant/room display fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestRow {
    pub request: ChangeRequest,
    pub tenant_name: String,
    pub tenant_email: Option<String>,
    pub current_room_number: String,
    pub desired_room_number: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KindFilter {
    Exchange,
    Vacate,
}

impl KindFilter {
    pub fn matches(&self, kind: &RequestKind) -> bool {
        match self {
            KindFilter::Exchange => matches!(kind, RequestKind::Exchange { .. }),
            KindFilter::Vacate => matches!(kind, RequestKind::Vacate),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestFilter {
    pub status: Option<RequestStatus>,
    pub kind: Option<KindFilter>,
    pub tenant: Option<TenantId>,
    /// Case-insensitive substring over reason and room numbers.
    pub text: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub limit: usize,
    pub offset: usize,
}

impl Default for Page {
    fn default() -> Self {
        Self { limit: crate::limits::DEFAULT_PAGE_SIZE, offset: 0 }
    }
}
