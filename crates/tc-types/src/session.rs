use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// One logical conversation with the agent, owned by a single user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    /// The agent's own resumable id, known after its first `init` record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_session_id: Option<String>,
    pub user_id: i64,
    pub project_path: PathBuf,
    pub project_name: String,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    #[serde(default)]
    pub total_cost_usd: f64,
    pub status: SessionStatus,
}

impl Session {
    pub fn new(
        user_id: i64,
        project_path: impl Into<PathBuf>,
        project_name: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            agent_session_id: None,
            user_id,
            project_path: project_path.into(),
            project_name: project_name.into(),
            created_at: now,
            last_active: now,
            total_cost_usd: 0.0,
            status: SessionStatus::Idle,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }

    pub fn mark_active(&mut self) {
        self.status = SessionStatus::Active;
        self.last_active = Utc::now();
    }

    /// Demote to idle. `last_active` is left untouched.
    pub fn mark_idle(&mut self) {
        self.status = SessionStatus::Idle;
    }

    pub fn archive(&mut self) {
        self.status = SessionStatus::Archived;
        self.last_active = Utc::now();
    }

    pub fn add_cost(&mut self, cost: f64) {
        self.total_cost_usd += cost;
        self.last_active = Utc::now();
    }

    /// First eight characters of the id, for display.
    pub fn short_id(&self) -> String {
        self.id.simple().to_string()[..8].to_string()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Idle,
    Archived,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Idle => write!(f, "idle"),
            Self::Archived => write!(f, "archived"),
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "idle" => Ok(Self::Idle),
            "archived" => Ok(Self::Archived),
            _ => Err(anyhow::anyhow!("unknown session status: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_roundtrip() {
        for status in [SessionStatus::Active, SessionStatus::Idle, SessionStatus::Archived] {
            let parsed: SessionStatus = status.to_string().parse().unwrap();
            assert_eq!(status, parsed);
        }
        assert!("running".parse::<SessionStatus>().is_err());
    }

    #[test]
    fn new_session_has_no_agent_id() {
        let s = Session::new(12345678, "/home/user/myapp", "myapp");
        assert_eq!(s.user_id, 12345678);
        assert_eq!(s.project_path, PathBuf::from("/home/user/myapp"));
        assert!(s.agent_session_id.is_none());
        assert_eq!(s.total_cost_usd, 0.0);
        assert!((Utc::now() - s.created_at).num_seconds() < 1);
    }

    #[test]
    fn activity_transitions() {
        let mut s = Session::new(1, "/p", "p");
        s.mark_active();
        assert!(s.is_active());
        s.mark_idle();
        assert!(!s.is_active());
        s.archive();
        assert_eq!(s.status, SessionStatus::Archived);
        assert!(!s.is_active());
    }

    #[test]
    fn add_cost_accumulates() {
        let mut s = Session::new(1, "/p", "p");
        s.add_cost(0.25);
        s.add_cost(0.5);
        assert!((s.total_cost_usd - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn toml_roundtrip_keeps_fields() {
        let mut s = Session::new(42, "/srv/app", "app");
        s.agent_session_id = Some("claude-xyz".into());
        s.add_cost(1.23);
        let text = toml::to_string_pretty(&s).unwrap();
        let parsed: Session = toml::from_str(&text).unwrap();
        assert_eq!(parsed.id, s.id);
        assert_eq!(parsed.agent_session_id.as_deref(), Some("claude-xyz"));
        assert_eq!(parsed.total_cost_usd, s.total_cost_usd);
        assert_eq!(parsed.status, s.status);
    }
}
