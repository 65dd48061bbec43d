//! Room membership bookkeeping.
//!
//! [`RoomMembership`] remembers which rooms each session asked to be in, so
//! the connection task can re-issue every `join_room` after a reconnect (rooms
//! do not survive a transport reconnect on the server side). Requests are
//! idempotent: repeating one yields no new joins.

use std::collections::{BTreeMap, BTreeSet};

use crate::protocol::{Role, Room, SessionId, UserId};

#[derive(Debug, Clone, PartialEq, Eq)]
struct RoomRequest {
    role: Role,
    user_id: Option<UserId>,
}

impl RoomRequest {
    /// Full scope once the identity is known; the session room alone before that.
    fn rooms(&self, session_id: SessionId) -> BTreeSet<Room> {
        let mut rooms = BTreeSet::from([Room::Session(session_id)]);
        if let Some(user_id) = &self.user_id {
            rooms.insert(Room::Role(session_id, self.role));
            rooms.insert(Room::User(session_id, user_id.clone()));
        }
        rooms
    }
}

/// Difference between the rooms requested before and after one call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MembershipChange {
    pub join: Vec<Room>,
    pub leave: Vec<Room>,
}

impl MembershipChange {
    pub fn is_empty(&self) -> bool {
        self.join.is_empty() && self.leave.is_empty()
    }
}

/// Requested room sets, keyed by session.
#[derive(Debug, Default)]
pub struct RoomMembership {
    sessions: BTreeMap<SessionId, RoomRequest>,
}

impl RoomMembership {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `session_id` wants its rooms for `role`, and return the
    /// rooms that must be joined or left as a result.
    ///
    /// A request without a `user_id` never discards an identity resolved by an
    /// earlier request.
    pub fn request(
        &mut self,
        session_id: SessionId,
        role: Role,
        user_id: Option<UserId>,
    ) -> MembershipChange {
        let previous = self.sessions.get(&session_id);
        let before = previous
            .map(|request| request.rooms(session_id))
            .unwrap_or_default();

        let user_id = user_id.or_else(|| previous.and_then(|request| request.user_id.clone()));
        let next = RoomRequest { role, user_id };
        let after = next.rooms(session_id);
        self.sessions.insert(session_id, next);

        MembershipChange {
            join: after.difference(&before).cloned().collect(),
            leave: before.difference(&after).cloned().collect(),
        }
    }

    /// Forget `session_id` and return the rooms it was in.
    pub fn release(&mut self, session_id: SessionId) -> Vec<Room> {
        self.sessions
            .remove(&session_id)
            .map(|request| request.rooms(session_id).into_iter().collect())
            .unwrap_or_default()
    }

    /// Every requested room, for re-issuing after a reconnect.
    pub fn rooms(&self) -> Vec<Room> {
        self.sessions
            .iter()
            .flat_map(|(session_id, request)| request.rooms(*session_id))
            .collect()
    }

    pub fn rooms_for(&self, session_id: SessionId) -> Vec<Room> {
        self.sessions
            .get(&session_id)
            .map(|request| request.rooms(session_id).into_iter().collect())
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
