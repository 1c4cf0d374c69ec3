use crate::ids::{SessionId, TurnId};
use crate::turns::Turn;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("session not found: {0}")]
    SessionNotFound(SessionId),
    #[error("turn not found: {0}")]
    TurnNotFound(TurnId),
    #[error("part {index} out of range for turn {turn}")]
    PartOutOfRange { turn: TurnId, index: usize },
    #[error("{0}")]
    Internal(String),
}

/// Session/message storage collaborator. The engine reads turns, appends new
/// ones and marks parts as compacted; it never deletes anything. Persistence
/// strategy is the implementor's concern.
pub trait ConversationStore: Send + Sync {
    fn create_session(&self) -> SessionId;

    fn turns(&self, session_id: &SessionId) -> Result<Vec<Turn>, StoreError>;

    fn append_turn(&self, session_id: &SessionId, turn: Turn) -> Result<(), StoreError>;

    /// Stamp a compaction tombstone on one tool-output part.
    fn mark_compacted(
        &self,
        session_id: &SessionId,
        turn_id: &TurnId,
        part_index: usize,
        timestamp: &str,
    ) -> Result<(), StoreError>;
}
