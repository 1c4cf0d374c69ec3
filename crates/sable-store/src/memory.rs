use std::collections::HashMap;

use parking_lot::RwLock;

use sable_core::ids::{SessionId, TurnId};
use sable_core::store::{ConversationStore, StoreError};
use sable_core::turns::{Part, Turn};

/// In-memory conversation store. Sessions live for the process lifetime;
/// durable persistence is deliberately out of scope here.
#[derive(Default)]
pub struct MemoryStore {
    sessions: RwLock<HashMap<SessionId, Vec<Turn>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }
}

impl ConversationStore for MemoryStore {
    fn create_session(&self) -> SessionId {
        let id = SessionId::new();
        self.sessions.write().insert(id.clone(), Vec::new());
        id
    }

    fn turns(&self, session_id: &SessionId) -> Result<Vec<Turn>, StoreError> {
        self.sessions
            .read()
            .get(session_id)
            .cloned()
            .ok_or_else(|| StoreError::SessionNotFound(session_id.clone()))
    }

    fn append_turn(&self, session_id: &SessionId, turn: Turn) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write();
        let turns = sessions
            .get_mut(session_id)
            .ok_or_else(|| StoreError::SessionNotFound(session_id.clone()))?;
        turns.push(turn);
        Ok(())
    }

    fn mark_compacted(
        &self,
        session_id: &SessionId,
        turn_id: &TurnId,
        part_index: usize,
        timestamp: &str,
    ) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write();
        let turns = sessions
            .get_mut(session_id)
            .ok_or_else(|| StoreError::SessionNotFound(session_id.clone()))?;
        let turn = turns
            .iter_mut()
            .find(|t| &t.id == turn_id)
            .ok_or_else(|| StoreError::TurnNotFound(turn_id.clone()))?;
        match turn.parts.get_mut(part_index) {
            Some(Part::ToolOutput(out)) => {
                out.compacted_at = Some(timestamp.to_string());
                Ok(())
            }
            Some(_) | None => Err(StoreError::PartOutOfRange {
                turn: turn_id.clone(),
                index: part_index,
            }),
        }
    }
}
