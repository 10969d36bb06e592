use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A risky action waiting on a human decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: String,
    pub session_id: String,
    pub tool_name: String,
    /// Human-readable description of what the agent wants to do.
    pub reason: String,
    /// The literal command or argument text.
    pub command: String,
    pub created_at: DateTime<Utc>,
}

/// How a pending request was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Approved,
    Denied,
    /// No decision arrived before the request's deadline.
    Expired,
}

impl Decision {
    pub fn is_approved(self) -> bool {
        self == Self::Approved
    }

    /// The answer written back to the agent's terminal.
    pub fn terminal_reply(self) -> &'static str {
        if self.is_approved() {
            "y"
        } else {
            "n"
        }
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Approved => write!(f, "approved"),
            Self::Denied => write!(f, "denied"),
            Self::Expired => write!(f, "expired"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_approval_answers_yes() {
        assert_eq!(Decision::Approved.terminal_reply(), "y");
        assert_eq!(Decision::Denied.terminal_reply(), "n");
        assert_eq!(Decision::Expired.terminal_reply(), "n");
    }

    #[test]
    fn decision_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Decision::Expired).unwrap(), "\"expired\"");
    }
}
