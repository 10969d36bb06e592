//! Risk classification for agent tool calls.
//!
//! This is a conservative, over-approving heuristic. It decides which actions
//! are shown to a human first; it is not a sandbox.

use serde::{Deserialize, Serialize};

use crate::message::{truncate, StructuredMessage, ToolUseMessage};

/// Name of the agent's shell-execution tool.
pub const SHELL_TOOL: &str = "Bash";

/// Substrings of a lower-cased shell command that always need approval.
const DANGEROUS_PATTERNS: &[&str] = &[
    "rm ",
    "rm\t",
    "rmdir",
    "git push",
    "git force",
    "--force",
    "-f ",
    "sudo ",
    "chmod ",
    "chown ",
    "> /",
    "| sudo",
    "dd ",
    "mkfs",
    "fdisk",
    "format",
];

/// Outcome of classifying one message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub requires_approval: bool,
    pub reason: String,
    pub command: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApprovalRules {
    /// Tool names (exact, case-insensitive) and command substrings that need approval.
    pub require_for: Vec<String>,
}

impl ApprovalRules {
    pub fn new(require_for: Vec<String>) -> Self {
        Self { require_for }
    }

    /// Classify a message. Anything that is not a tool call never needs approval.
    pub fn classify(&self, msg: &StructuredMessage) -> Classification {
        match msg {
            StructuredMessage::ToolUse(tool) => Classification {
                requires_approval: self.tool_requires_approval(tool),
                reason: extract_reason(tool),
                command: extract_command(tool),
            },
            _ => Classification {
                requires_approval: false,
                reason: String::new(),
                command: String::new(),
            },
        }
    }

    fn tool_requires_approval(&self, tool: &ToolUseMessage) -> bool {
        if self
            .require_for
            .iter()
            .any(|rule| rule.eq_ignore_ascii_case(&tool.name))
        {
            return true;
        }

        if tool.name == SHELL_TOOL {
            if let Some(input) = tool.shell_input() {
                return self.is_dangerous_command(&input.command);
            }
        }

        false
    }

    fn is_dangerous_command(&self, cmd: &str) -> bool {
        let cmd = cmd.to_lowercase();

        if DANGEROUS_PATTERNS.iter().any(|p| cmd.contains(p)) {
            return true;
        }

        self.require_for
            .iter()
            .any(|rule| cmd.contains(&rule.to_lowercase()))
    }
}

/// Human-readable reason: the tool's own description if it gave one,
/// otherwise a phrase derived from the command.
pub fn extract_reason(tool: &ToolUseMessage) -> String {
    if tool.name == SHELL_TOOL {
        if let Some(input) = tool.shell_input() {
            return match input.description {
                Some(d) if !d.is_empty() => d,
                _ => describe_command(&input.command),
            };
        }
    }
    format!("Execute {} operation", tool.name)
}

/// The literal command for display: the shell command, or the raw input JSON.
pub fn extract_command(tool: &ToolUseMessage) -> String {
    if tool.name == SHELL_TOOL {
        if let Some(input) = tool.shell_input() {
            return input.command;
        }
    }
    tool.input.to_string()
}

fn describe_command(cmd: &str) -> String {
    let cmd = cmd.trim();
    let parts: Vec<&str> = cmd.split_whitespace().collect();
    let Some(first) = parts.first() else {
        return "Run shell command".to_string();
    };
    let second = parts.get(1);

    match *first {
        "rm" | "rmdir" => "Delete files/directories".to_string(),
        "git" => match second {
            Some(sub) => format!("Git {sub} operation"),
            None => "Git operation".to_string(),
        },
        "go" => match second {
            Some(sub) => format!("Go {sub}"),
            None => "Go command".to_string(),
        },
        "cargo" => match second {
            Some(sub) => format!("Cargo {sub}"),
            None => "Cargo command".to_string(),
        },
        "npm" | "yarn" | "pnpm" => match second {
            Some(sub) => format!("{first} {sub}"),
            None => format!("{first} command"),
        },
        _ => format!("Run: {}", truncate(cmd, 30)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rules(list: &[&str]) -> ApprovalRules {
        ApprovalRules::new(list.iter().map(|s| s.to_string()).collect())
    }

    fn tool(name: &str, input: serde_json::Value) -> StructuredMessage {
        StructuredMessage::ToolUse(ToolUseMessage {
            id: "toolu_1".into(),
            name: name.into(),
            input,
        })
    }

    fn needs(rules: &ApprovalRules, msg: &StructuredMessage) -> bool {
        rules.classify(msg).requires_approval
    }

    fn bash(command: &str) -> StructuredMessage {
        tool("Bash", json!({ "command": command }))
    }

    #[test]
    fn listed_tool_requires_approval() {
        let r = rules(&["Bash", "delete", "git push"]);
        assert!(needs(&r, &bash("ls -la")));
    }

    #[test]
    fn tool_name_match_is_case_insensitive() {
        let r = rules(&["write"]);
        assert!(needs(&r, &tool("Write", json!({"file_path": "/a"}))));
    }

    #[test]
    fn read_does_not_require_approval() {
        let r = rules(&["Bash", "delete", "git push"]);
        assert!(!needs(&r, &tool("Read", json!({"file_path": "/src/main.rs"}))));
    }

    #[test]
    fn git_push_requires_approval() {
        let r = rules(&["delete"]);
        assert!(needs(&r, &bash("git push origin main")));
    }

    #[test]
    fn rm_requires_approval_with_default_reason() {
        let r = rules(&["delete"]);
        let c = r.classify(&bash("rm -rf ./build"));
        assert!(c.requires_approval);
        assert_eq!(c.reason, "Delete files/directories");
        assert_eq!(c.command, "rm -rf ./build");
    }

    #[test]
    fn harmless_command_passes() {
        let r = rules(&["delete"]);
        let c = r.classify(&bash("go test ./..."));
        assert!(!c.requires_approval);
        assert_eq!(c.reason, "Go test");
    }

    #[test]
    fn dangerous_patterns_are_case_insensitive() {
        let r = rules(&[]);
        assert!(needs(&r, &bash("SUDO apt install x")));
        assert!(needs(&r, &bash("echo hi > /etc/motd")));
        assert!(needs(&r, &bash("mkfs.ext4 /dev/sdb1")));
    }

    #[test]
    fn configured_rules_match_command_substrings() {
        let r = rules(&["docker"]);
        assert!(needs(&r, &bash("docker system prune")));
        assert!(!needs(&rules(&[]), &bash("docker ps")));
    }

    #[test]
    fn description_wins_for_reason() {
        let r = rules(&["Bash"]);
        let c = r.classify(&tool(
            "Bash",
            json!({"command": "go build ./...", "description": "Build the project"}),
        ));
        assert_eq!(c.reason, "Build the project");
    }

    #[test]
    fn reason_for_other_tools() {
        let r = rules(&["Write"]);
        let c = r.classify(&tool("Write", json!({"file_path": "/a"})));
        assert!(c.requires_approval);
        assert_eq!(c.reason, "Execute Write operation");
        assert_eq!(c.command, r#"{"file_path":"/a"}"#);
    }

    #[test]
    fn describe_command_variants() {
        assert_eq!(describe_command("git status"), "Git status operation");
        assert_eq!(describe_command("npm install"), "npm install");
        assert_eq!(describe_command("   "), "Run shell command");
        assert_eq!(
            describe_command("python3 scripts/generate_all_the_things.py"),
            "Run: python3 scripts/generate_al..."
        );
    }

    #[test]
    fn non_tool_messages_are_never_risky() {
        let r = rules(&["Bash"]);
        let msg =
            StructuredMessage::from_line(br#"{"type":"result","result":"rm -rf /"}"#).unwrap();
        assert!(!r.classify(&msg).requires_approval);
    }
}
