use std::time::Duration;

use sable_core::errors::ProviderError;
use sable_core::ids::{CallId, TurnId};
use sable_core::store::StoreError;
use sable_core::tools::ToolError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("tool error: {0}")]
    Tool(#[from] ToolError),

    /// A second execute for a call id that is still active. The first
    /// execution keeps running; this one never starts.
    #[error("call already active: {0}")]
    DuplicateCall(CallId),

    #[error("parent turn not found: {0}")]
    MissingParent(TurnId),

    #[error("session aborted")]
    Aborted,

    #[error("max turns exceeded: {0}")]
    MaxTurnsExceeded(u32),

    #[error("run timeout after {0:?}")]
    RunTimeout(Duration),

    #[error("{0}")]
    Internal(String),
}
