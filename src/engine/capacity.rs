//! The capacity tracker: sole mutator of `RoomState::occupancy` on behalf of
//! the request workflow. Both operations run while the caller holds the
//! room's write lock, so the capacity check and the occupancy write are one
//! atomic unit — there is no gap for a concurrent approval to interleave.

use tokio::sync::OwnedRwLockWriteGuard;

use crate::model::{RoomId, RoomState};

use super::registry::RoomRegistry;
use super::EngineError;

/// Take one slot in the room, or report `RoomAtCapacity` without side effect.
pub(crate) fn reserve_slot(room: &mut RoomState) -> Result<(), EngineError> {
    if !room.has_free_slot() {
        metrics::counter!(crate::observability::RESERVATION_CONFLICTS_TOTAL).increment(1);
        return Err(EngineError::RoomAtCapacity {
            room: room.id,
            capacity: room.capacity,
        });
    }
    room.occupancy += 1;
    Ok(())
}

/// Give one slot back. Releasing below zero means a reservation was lost or
/// double-released somewhere — a broken atomicity guarantee, surfaced as an
/// integrity alert rather than clamped.
pub(crate) fn release_slot(room: &mut RoomState) -> Result<(), EngineError> {
    if room.occupancy == 0 {
        metrics::counter!(crate::observability::INTEGRITY_ALERTS_TOTAL).increment(1);
        tracing::error!(room = %room.id, "occupancy underflow: release without reservation");
        return Err(EngineError::OccupancyUnderflow(room.id));
    }
    room.occupancy -= 1;
    Ok(())
}

/// Acquire write locks on two distinct rooms in sorted id order to prevent
/// deadlocks, returning the guards in `(a, b)` argument order.
pub(crate) async fn lock_room_pair(
    rooms: &RoomRegistry,
    a: RoomId,
    b: RoomId,
) -> Result<(OwnedRwLockWriteGuard<RoomState>, OwnedRwLockWriteGuard<RoomState>), EngineError> {
    debug_assert_ne!(a, b, "lock_room_pair requires distinct rooms");
    let rs_a = rooms.get(&a).ok_or(EngineError::RoomNotFound(a))?;
    let rs_b = rooms.get(&b).ok_or(EngineError::RoomNotFound(b))?;
    if a < b {
        let ga = rs_a.write_owned().await;
        let gb = rs_b.write_owned().await;
        Ok((ga, gb))
    } else {
        let gb = rs_b.write_owned().await;
        let ga = rs_a.write_owned().await;
        Ok((ga, gb))
    }
}

/// Acquire the write lock on a single room.
pub(crate) async fn lock_room(
    rooms: &RoomRegistry,
    id: RoomId,
) -> Result<OwnedRwLockWriteGuard<RoomState>, EngineError> {
    let rs = rooms.get(&id).ok_or(EngineError::RoomNotFound(id))?;
    Ok(rs.write_owned().await)
}
