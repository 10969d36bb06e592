use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::approval::{ApprovalRequest, Decision};
use crate::message::Usage;

/// Gateway → chat surface. Published on the gateway's event bus while a turn runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum GatewayEvent {
    TurnStarted {
        session_id: Uuid,
        user_id: i64,
    },
    TextDelta {
        session_id: Uuid,
        content: String,
    },
    ToolUse {
        session_id: Uuid,
        tool_use_id: String,
        summary: String,
    },
    ToolResult {
        session_id: Uuid,
        tool_use_id: String,
        is_error: bool,
    },
    /// A risky action is paused until someone approves or denies it.
    ApprovalRequested {
        request: ApprovalRequest,
    },
    ApprovalResolved {
        session_id: Uuid,
        request_id: String,
        decision: Decision,
    },
    TurnComplete {
        session_id: Uuid,
        result: String,
        cost_usd: f64,
        usage: Option<Usage>,
    },
    Error {
        session_id: Option<Uuid>,
        message: String,
    },
    /// The agent has exited; the session accepts a new prompt.
    TurnFinished {
        session_id: Uuid,
    },
}

impl GatewayEvent {
    pub fn session_id(&self) -> Option<Uuid> {
        match self {
            Self::TurnStarted { session_id, .. }
            | Self::TextDelta { session_id, .. }
            | Self::ToolUse { session_id, .. }
            | Self::ToolResult { session_id, .. }
            | Self::ApprovalResolved { session_id, .. }
            | Self::TurnComplete { session_id, .. }
            | Self::TurnFinished { session_id } => Some(*session_id),
            Self::ApprovalRequested { request } => request.session_id.parse().ok(),
            Self::Error { session_id, .. } => *session_id,
        }
    }
}
