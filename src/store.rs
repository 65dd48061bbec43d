//! Per-session participant store.
//!
//! Holds at most one entry per [`UserId`], ordered by id. The store is owned by
//! the session's reconciler and never shared; readers get cloned snapshots.

use std::collections::BTreeMap;

use crate::protocol::{Participant, ParticipantProgress, Session, SessionId, UserId};

#[derive(Debug, Clone)]
pub struct SessionStore {
    session_id: SessionId,
    participants: BTreeMap<UserId, Participant>,
    session: Option<Session>,
}

impl SessionStore {
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            participants: BTreeMap::new(),
            session: None,
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Participants in `user_id` order.
    pub fn participants(&self) -> Vec<Participant> {
        self.participants.values().cloned().collect()
    }

    pub fn get(&self, user_id: &UserId) -> Option<&Participant> {
        self.participants.get(user_id)
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    /// Insert a new participant or merge into the existing entry.
    ///
    /// Identity (`user_id`, `display_name`) is first-write-wins. Every other
    /// attribute takes the incoming value, except that the score never
    /// decreases and absent optional fields keep their previous value.
    /// Returns `true` if the store changed.
    pub fn upsert(&mut self, incoming: Participant) -> bool {
        match self.participants.get_mut(&incoming.user_id) {
            None => {
                self.participants.insert(incoming.user_id.clone(), incoming);
                true
            }
            Some(existing) => {
                let before = existing.clone();
                existing.status = incoming.status;
                existing.score = existing.score.max(incoming.score);
                existing.progress = incoming.progress.or(existing.progress);
                existing.correct_answers = incoming.correct_answers;
                existing.total_answers = incoming.total_answers;
                existing.current_question_id =
                    incoming.current_question_id.or(existing.current_question_id);
                if incoming.last_accessed.is_some() {
                    existing.last_accessed = incoming.last_accessed;
                }
                *existing != before
            }
        }
    }

    /// Remove a participant. Returns `false` if the id was unknown.
    pub fn remove(&mut self, user_id: &UserId) -> bool {
        self.participants.remove(user_id).is_some()
    }

    /// Replace the whole participant list with an authoritative snapshot.
    /// Duplicate ids within the snapshot are merged with [`upsert`](Self::upsert).
    pub fn replace(&mut self, participants: Vec<Participant>) {
        self.participants.clear();
        for participant in participants {
            self.upsert(participant);
        }
    }

    /// Apply a partial update to an existing participant. Unknown ids are
    /// ignored. Returns `true` if the store changed.
    pub fn merge_progress(&mut self, update: ParticipantProgress) -> bool {
        let Some(existing) = self.participants.get_mut(&update.user_id) else {
            return false;
        };
        let before = existing.clone();
        if let Some(status) = update.status {
            existing.status = status;
        }
        if let Some(score) = update.score {
            existing.score = existing.score.max(score);
        }
        if let Some(progress) = update.progress {
            existing.progress = Some(progress);
        }
        if let Some(correct) = update.correct_answers {
            existing.correct_answers = correct;
        }
        if let Some(total) = update.total_answers {
            existing.total_answers = total;
        }
        if let Some(question_id) = update.current_question_id {
            existing.current_question_id = Some(question_id);
        }
        if let Some(last_accessed) = update.last_accessed {
            existing.last_accessed = Some(last_accessed);
        }
        *existing != before
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// The cached session record, created as pending on first use.
    pub fn session_mut(&mut self) -> &mut Session {
        let session_id = self.session_id;
        self.session
            .get_or_insert_with(|| Session::pending(session_id))
    }

    pub fn set_session(&mut self, session: Session) {
        self.session = Some(session);
    }
}
