//! Read-side projections. Nothing here mutates state; every query reads the
//! same maps the processor writes, so a decided request can never show up
//! as pending once the decision is durable.

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError};

impl Engine {
    pub async fn get_request(&self, id: RequestId) -> Option<ChangeRequest> {
        let req = self.store.get(&id)?;
        let guard = req.read().await;
        Some(guard.clone())
    }

    /// Like `get_request`, joined with display fields for the wire surface.
    pub async fn get_request_row(&self, id: RequestId) -> Option<RequestRow> {
        let request = self.get_request(id).await?;
        Some(self.join_row(request).await)
    }

    /// Outstanding (`Pending`/`Approved`) requests for one tenant — at most
    /// one while the uniqueness invariant holds.
    pub async fn list_outstanding(&self, tenant: TenantId) -> Vec<ChangeRequest> {
        self.store.outstanding_snapshot(&tenant).await
    }

    pub async fn list_outstanding_rows(&self, tenant: TenantId) -> Vec<RequestRow> {
        let mut rows = Vec::new();
        for request in self.store.outstanding_snapshot(&tenant).await {
            rows.push(self.join_row(request).await);
        }
        rows
    }

    pub async fn list_rooms(&self) -> Vec<RoomState> {
        let mut rooms = self.rooms.snapshot().await;
        rooms.sort_by_key(|r| r.id);
        rooms
    }

    pub async fn list_tenants(&self) -> Vec<TenantState> {
        let mut tenants = self.tenants.snapshot().await;
        tenants.sort_by_key(|t| t.id);
        tenants
    }

    /// The administrative review feed: requests joined with tenant and room
    /// display fields, filtered, newest first, paged.
    pub async fn list_requests(
        &self,
        filter: &RequestFilter,
        page: Page,
    ) -> Result<Vec<RequestRow>, EngineError> {
        if page.limit == 0 || page.limit > MAX_PAGE_SIZE {
            return Err(EngineError::LimitExceeded("page size out of range"));
        }
        if let Some(ref text) = filter.text
            && text.len() > MAX_TEXT_FILTER_LEN {
                return Err(EngineError::LimitExceeded("text filter too long"));
            }

        let mut requests = self.store.snapshot().await;
        requests.retain(|r| {
            filter.status.is_none_or(|s| r.status == s)
                && filter.kind.is_none_or(|k| k.matches(&r.kind))
                && filter.tenant.is_none_or(|t| r.tenant_id == t)
        });
        // Newest first; ULIDs are time-ordered so the id is a stable tiebreak.
        requests.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));

        let mut rows = Vec::new();
        for request in requests {
            let row = self.join_row(request).await;
            if let Some(ref text) = filter.text {
                if !row_matches_text(&row, text) {
                    continue;
                }
            }
            rows.push(row);
        }

        Ok(rows.into_iter().skip(page.offset).take(page.limit).collect())
    }

    async fn join_row(&self, request: ChangeRequest) -> RequestRow {
        let (tenant_name, tenant_email) = match self.tenants.get(&request.tenant_id) {
            Some(ts) => {
                let tenant = ts.read().await;
                (tenant.name.clone(), tenant.email.clone())
            }
            None => ("(unknown)".to_string(), None),
        };
        let current_room_number = self.room_number(&request.current_room).await;
        let desired_room_number = match request.kind.desired_room() {
            Some(room_id) => Some(self.room_number(&room_id).await),
            None => None,
        };
        RequestRow {
            request,
            tenant_name,
            tenant_email,
            current_room_number,
            desired_room_number,
        }
    }

    async fn room_number(&self, id: &RoomId) -> String {
        match self.rooms.get(id) {
            Some(rs) => rs.read().await.number.clone(),
            None => "(unknown)".to_string(),
        }
    }
}

/// Case-insensitive substring match over reason and both room numbers.
fn row_matches_text(row: &RequestRow, text: &str) -> bool {
    let needle = text.to_lowercase();
    if row.request.reason.to_lowercase().contains(&needle) {
        return true;
    }
    if row.current_room_number.to_lowercase().contains(&needle) {
        return true;
    }
    row.desired_room_number
        .as_deref()
        .is_some_and(|n| n.to_lowercase().contains(&needle))
}
