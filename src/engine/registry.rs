use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::RwLock;

use crate::model::{RoomId, RoomState, TenantId, TenantState};

pub type SharedRoomState = Arc<RwLock<RoomState>>;
pub type SharedTenantState = Arc<RwLock<TenantState>>;

/// In-process room directory. Each room sits behind its own `RwLock`; the
/// write lock is the serialization point for every occupancy mutation.
pub struct RoomRegistry {
    rooms: DashMap<RoomId, SharedRoomState>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self { rooms: DashMap::new() }
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }

    pub fn contains(&self, id: &RoomId) -> bool {
        self.rooms.contains_key(id)
    }

    pub fn get(&self, id: &RoomId) -> Option<SharedRoomState> {
        self.rooms.get(id).map(|e| e.value().clone())
    }

    pub fn insert(&self, id: RoomId, state: SharedRoomState) {
        self.rooms.insert(id, state);
    }

    pub fn ids(&self) -> Vec<RoomId> {
        self.rooms.iter().map(|e| *e.key()).collect()
    }

    pub async fn snapshot(&self) -> Vec<RoomState> {
        let arcs: Vec<SharedRoomState> = self.rooms.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(arcs.len());
        for rs in arcs {
            out.push(rs.read().await.clone());
        }
        out
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// In-process tenant directory.
pub struct TenantRegistry {
    tenants: DashMap<TenantId, SharedTenantState>,
}

impl TenantRegistry {
    pub fn new() -> Self {
        Self { tenants: DashMap::new() }
    }

    pub fn len(&self) -> usize {
        self.tenants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tenants.is_empty()
    }

    pub fn contains(&self, id: &TenantId) -> bool {
        self.tenants.contains_key(id)
    }

    pub fn get(&self, id: &TenantId) -> Option<SharedTenantState> {
        self.tenants.get(id).map(|e| e.value().clone())
    }

    pub fn insert(&self, id: TenantId, state: SharedTenantState) {
        self.tenants.insert(id, state);
    }

    pub fn ids(&self) -> Vec<TenantId> {
        self.tenants.iter().map(|e| *e.key()).collect()
    }

    pub async fn snapshot(&self) -> Vec<TenantState> {
        let arcs: Vec<SharedTenantState> = self.tenants.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(arcs.len());
        for ts in arcs {
            out.push(ts.read().await.clone());
        }
        out
    }
}

impl Default for TenantRegistry {
    fn default() -> Self {
        Self::new()
    }
}
