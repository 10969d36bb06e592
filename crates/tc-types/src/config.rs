use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TcConfig {
    /// Chat user ids permitted to drive the agent.
    #[serde(default)]
    pub allowed_users: Vec<i64>,
    /// Registered project shortcuts: name -> directory.
    #[serde(default)]
    pub projects: BTreeMap<String, PathBuf>,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub approval: ApprovalConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Executable launched for every turn.
    pub binary: String,
    pub max_turns: u32,
    /// Passed through as `--permission-mode` when non-empty.
    pub permission_mode: String,
    /// Seconds between a graceful stop and a forced kill.
    pub stop_grace_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalConfig {
    pub require_for: Vec<String>,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Where session records are kept. Defaults to the teleclaude home directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            binary: "claude".to_string(),
            max_turns: 50,
            permission_mode: "acceptEdits".to_string(),
            stop_grace_secs: 5,
        }
    }
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            require_for: ["Bash", "delete", "git push", "git force"]
                .into_iter()
                .map(String::from)
                .collect(),
            timeout_secs: 300,
        }
    }
}

impl TcConfig {
    pub fn is_user_allowed(&self, user_id: i64) -> bool {
        self.allowed_users.contains(&user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_agent_expectations() {
        let cfg = TcConfig::default();
        assert_eq!(cfg.agent.binary, "claude");
        assert_eq!(cfg.agent.max_turns, 50);
        assert_eq!(cfg.agent.permission_mode, "acceptEdits");
        assert_eq!(cfg.approval.require_for, vec!["Bash", "delete", "git push", "git force"]);
        assert!(cfg.projects.is_empty());
    }

    #[test]
    fn partial_file_takes_defaults() {
        let cfg: TcConfig = toml::from_str(
            r#"
            allowed_users = [12345]

            [agent]
            max_turns = 10

            [projects]
            myapp = "/home/user/myapp"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.agent.max_turns, 10);
        assert_eq!(cfg.agent.permission_mode, "acceptEdits");
        assert_eq!(cfg.approval.timeout_secs, 300);
        assert_eq!(cfg.projects["myapp"], PathBuf::from("/home/user/myapp"));
    }

    #[test]
    fn user_allow_list() {
        let cfg = TcConfig {
            allowed_users: vec![111, 222],
            ..Default::default()
        };
        assert!(cfg.is_user_allowed(111));
        assert!(!cfg.is_user_allowed(333));
    }

    #[test]
    fn default_config_roundtrips() {
        let cfg = TcConfig::default();
        let text = toml::to_string_pretty(&cfg).unwrap();
        let parsed: TcConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.agent.binary, "claude");
        assert_eq!(parsed.approval.require_for.len(), 4);
    }
}
