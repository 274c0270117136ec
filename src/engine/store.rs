use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::RwLock;

use crate::model::{ChangeRequest, RequestId, RequestStatus, TenantId};

pub type SharedRequest = Arc<RwLock<ChangeRequest>>;

/// Expected-status mismatch observed under the request's write lock. Internal
/// to the approval processor; callers see `InvalidState`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Conflict {
    pub actual: RequestStatus,
}

/// Check a request against the status a transition expects. The caller must
/// hold the request's write lock so the answer cannot go stale before the
/// transition applies.
pub(crate) fn check_expected(
    request: &ChangeRequest,
    expected: RequestStatus,
) -> Result<(), Conflict> {
    if request.status == expected {
        Ok(())
    } else {
        Err(Conflict { actual: request.status })
    }
}

/// Durable-in-memory store of every change request, plus the uniqueness
/// index enforcing "at most one outstanding request per tenant". Records are
/// never removed; decided requests stay as feed history.
pub struct RequestStore {
    requests: DashMap<RequestId, SharedRequest>,
    outstanding: DashMap<TenantId, RequestId>,
}

impl RequestStore {
    pub fn new() -> Self {
        Self {
            requests: DashMap::new(),
            outstanding: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn contains(&self, id: &RequestId) -> bool {
        self.requests.contains_key(id)
    }

    pub fn get(&self, id: &RequestId) -> Option<SharedRequest> {
        self.requests.get(id).map(|e| e.value().clone())
    }

    pub fn ids(&self) -> Vec<RequestId> {
        self.requests.iter().map(|e| *e.key()).collect()
    }

    /// The tenant's outstanding request id, if any.
    pub fn outstanding_for(&self, tenant: &TenantId) -> Option<RequestId> {
        self.outstanding.get(tenant).map(|e| *e.value())
    }

    /// Atomically claim the tenant's single outstanding slot for `request`.
    /// The entry lock makes two racing submissions resolve to exactly one
    /// winner; the loser gets the existing request id back. Re-claiming with
    /// the same id is a no-op (replay safety).
    pub fn claim_outstanding(&self, tenant: TenantId, request: RequestId) -> Result<(), RequestId> {
        match self.outstanding.entry(tenant) {
            Entry::Occupied(e) => {
                if *e.get() == request {
                    Ok(())
                } else {
                    Err(*e.get())
                }
            }
            Entry::Vacant(v) => {
                v.insert(request);
                Ok(())
            }
        }
    }

    /// Release the claim, but only if it is still held by `request` —
    /// a later claim by a newer request must not be clobbered.
    pub fn release_claim(&self, tenant: &TenantId, request: RequestId) {
        self.outstanding.remove_if(tenant, |_, held| *held == request);
    }

    /// Insert a record, indexing it as outstanding when its status warrants.
    pub fn insert(&self, request: ChangeRequest) {
        let id = request.id;
        let tenant = request.tenant_id;
        let outstanding = request.status.is_outstanding();
        self.requests.insert(id, Arc::new(RwLock::new(request)));
        if outstanding {
            self.outstanding.insert(tenant, id);
        }
    }

    /// Clone of every record. Read-side only; ordering is the caller's job.
    pub async fn snapshot(&self) -> Vec<ChangeRequest> {
        let arcs: Vec<SharedRequest> = self.requests.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(arcs.len());
        for req in arcs {
            out.push(req.read().await.clone());
        }
        out
    }

    /// All outstanding records for a tenant. With the uniqueness invariant
    /// intact this has at most one element; returning a Vec keeps the read
    /// side honest about what the store can prove.
    pub async fn outstanding_snapshot(&self, tenant: &TenantId) -> Vec<ChangeRequest> {
        let Some(id) = self.outstanding_for(tenant) else {
            return Vec::new();
        };
        match self.get(&id) {
            Some(req) => vec![req.read().await.clone()],
            None => Vec::new(),
        }
    }
}

impl Default for RequestStore {
    fn default() -> Self {
        Self::new()
    }
}
