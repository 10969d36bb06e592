#[cfg(not(unix))]
compile_error!("tc-gateway drives the agent through a pseudo-terminal and needs a Unix host");

pub mod approval;
pub mod config;
pub mod controller;
pub mod decoder;
pub mod error;
pub mod events;
pub mod session;
pub mod storage;

pub use error::{GatewayError, Result};
pub use events::EventBus;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use tc_types::{
    approval::{ApprovalRequest, Decision},
    config::TcConfig,
    event::GatewayEvent,
    message::{StructuredMessage, ToolUseMessage},
    policy::ApprovalRules,
    session::{Session, SessionStatus},
};

use approval::ApprovalGate;
use controller::{AgentController, ControllerOptions};
use session::SessionDirectory;
use storage::SessionStore;

type ControllerMap = Arc<RwLock<HashMap<Uuid, Arc<AgentController>>>>;

/// Spend on the active session and across all of a user's sessions.
#[derive(Debug, Clone)]
pub struct CostSummary {
    pub session: Option<Session>,
    pub total_usd: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatewayStatus {
    pub running_turns: usize,
    pub pending_approvals: usize,
}

/// The central gateway: owns sessions, approvals, running agents and the event bus.
/// A chat surface holds an `Arc<Gateway>` and renders what arrives on the bus.
pub struct Gateway {
    config: TcConfig,
    sessions: Arc<SessionDirectory>,
    approvals: Arc<ApprovalGate>,
    rules: Arc<ApprovalRules>,
    controllers: ControllerMap,
    event_bus: EventBus,
    shutdown: CancellationToken,
}

impl Gateway {
    /// Create a gateway over the configured data directory. No agent is started.
    pub fn new(config: TcConfig) -> anyhow::Result<Self> {
        let data_dir = config::data_dir(&config)?;
        let store = SessionStore::open(&data_dir)?;
        info!("Session records in {}", store.dir().display());
        let sessions = SessionDirectory::new(store);
        sessions.reset_stale_active()?;

        Ok(Self {
            sessions: Arc::new(sessions),
            approvals: Arc::new(ApprovalGate::new(Duration::from_secs(
                config.approval.timeout_secs,
            ))),
            rules: Arc::new(ApprovalRules::new(config.approval.require_for.clone())),
            controllers: Arc::new(RwLock::new(HashMap::new())),
            event_bus: EventBus::new(),
            shutdown: CancellationToken::new(),
            config,
        })
    }

    pub fn config(&self) -> &TcConfig {
        &self.config
    }

    /// Subscribe to turn progress and approval prompts.
    pub fn subscribe_events(&self) -> broadcast::Receiver<GatewayEvent> {
        self.event_bus.subscribe()
    }

    fn authorize(&self, user_id: i64) -> Result<()> {
        if self.config.is_user_allowed(user_id) {
            Ok(())
        } else {
            warn!("Rejected user {user_id}");
            Err(GatewayError::Unauthorized(user_id))
        }
    }

    fn grace(&self) -> Duration {
        Duration::from_secs(self.config.agent.stop_grace_secs)
    }

    fn controller_for(&self, session_id: &Uuid) -> Option<Arc<AgentController>> {
        self.controllers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .cloned()
    }

    /// A registered project name, or a directory path named after its last component.
    fn resolve_project(&self, project: &str) -> Result<(PathBuf, String)> {
        if let Some(path) = self.config.projects.get(project) {
            return Ok((path.clone(), project.to_string()));
        }
        let path = std::fs::canonicalize(project)
            .ok()
            .filter(|p| p.is_dir())
            .ok_or_else(|| GatewayError::UnknownProject(project.to_string()))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Ok((path, name))
    }

    /// Wind down whatever the user's active session is doing before leaving it.
    fn release_active(&self, user_id: i64) {
        let Some(previous) = self.sessions.active_session(user_id) else {
            return;
        };
        let denied = self.approvals.deny_all_for_session(&previous.id.to_string());
        if denied > 0 {
            info!("Denied {denied} pending approval(s) of session {}", previous.id);
        }
        if let Some(controller) = self.controller_for(&previous.id) {
            self.stop_with_grace(controller);
        }
    }

    fn stop_with_grace(&self, controller: Arc<AgentController>) {
        let grace = self.grace();
        tokio::spawn(async move {
            match controller.terminate(grace).await {
                Ok(true) => warn!("Agent ignored stop request and was killed"),
                Ok(false) => {}
                Err(e) => warn!("Failed to stop agent: {e}"),
            }
        });
    }

    // ─── Session commands ─────────────────────────────────────────────────────

    /// Start a fresh session on a project and make it the user's active one.
    pub async fn new_session(&self, user_id: i64, project: &str) -> Result<Session> {
        self.authorize(user_id)?;
        let (path, name) = self.resolve_project(project)?;
        self.release_active(user_id);
        Ok(self.sessions.create_session(user_id, path, &name)?)
    }

    /// Reactivate the user's most recently used session.
    pub async fn continue_session(&self, user_id: i64) -> Result<Session> {
        self.authorize(user_id)?;
        let latest = self
            .sessions
            .user_sessions(user_id)?
            .into_iter()
            .find(|s| s.status != SessionStatus::Archived);
        let Some(latest) = latest else {
            return Err(GatewayError::NoSessions);
        };
        if self.sessions.active_session(user_id).map(|s| s.id) != Some(latest.id) {
            self.release_active(user_id);
        }
        self.sessions
            .continue_latest(user_id)?
            .ok_or(GatewayError::NoSessions)
    }

    /// Switch to one of the user's sessions by full id or unique id prefix.
    pub async fn switch_session(&self, user_id: i64, id: &str) -> Result<Session> {
        self.authorize(user_id)?;
        let target = self.match_session_id(user_id, id)?;
        if self.sessions.active_session(user_id).map(|s| s.id) != Some(target) {
            self.release_active(user_id);
        }
        Ok(self.sessions.switch_session(user_id, &target.to_string())?)
    }

    /// Resolve a full id or unique prefix among the user's own sessions.
    fn match_session_id(&self, user_id: i64, id: &str) -> Result<Uuid> {
        let needle = id.trim().to_ascii_lowercase();
        if needle.is_empty() {
            return Err(session_not_found());
        }
        let matches: Vec<Uuid> = self
            .sessions
            .user_sessions(user_id)?
            .into_iter()
            .map(|s| s.id)
            .filter(|sid| {
                sid.to_string() == needle || sid.simple().to_string().starts_with(&needle)
            })
            .collect();
        match matches.as_slice() {
            [only] => Ok(*only),
            // Ambiguous prefixes are reported like unknown ids.
            _ => Err(session_not_found()),
        }
    }

    pub async fn archive_session(&self, user_id: i64, id: &str) -> Result<Session> {
        self.authorize(user_id)?;
        let target = self.match_session_id(user_id, id)?;
        if self.sessions.active_session(user_id).map(|s| s.id) == Some(target) {
            self.release_active(user_id);
        }
        Ok(self.sessions.archive_session(user_id, &target.to_string())?)
    }

    pub async fn list_sessions(&self, user_id: i64) -> Result<Vec<Session>> {
        self.authorize(user_id)?;
        Ok(self.sessions.user_sessions(user_id)?)
    }

    pub async fn active_session(&self, user_id: i64) -> Result<Option<Session>> {
        self.authorize(user_id)?;
        Ok(self.sessions.active_session(user_id))
    }

    pub async fn cost_summary(&self, user_id: i64) -> Result<CostSummary> {
        self.authorize(user_id)?;
        let total_usd = self
            .sessions
            .user_sessions(user_id)?
            .iter()
            .map(|s| s.total_cost_usd)
            .sum();
        Ok(CostSummary {
            session: self.sessions.active_session(user_id),
            total_usd,
        })
    }

    // ─── Turns ────────────────────────────────────────────────────────────────

    /// Send a prompt to the active session's agent. Returns as soon as the agent
    /// is spawned; progress arrives on the event bus.
    pub async fn send_prompt(&self, user_id: i64, prompt: &str) -> Result<Uuid> {
        self.authorize(user_id)?;
        let session = self
            .sessions
            .active_session(user_id)
            .ok_or(GatewayError::NoActiveSession)?;

        let controller = Arc::new(AgentController::new(ControllerOptions::from_config(
            &self.config.agent,
            &session.project_path,
        )));
        controller.set_session_id(session.agent_session_id.clone());

        {
            let mut map = self.controllers.write().unwrap_or_else(PoisonError::into_inner);
            if map.contains_key(&session.id) {
                return Err(GatewayError::Busy);
            }
            map.insert(session.id, Arc::clone(&controller));
        }

        let rx = match controller.start(&self.shutdown, prompt) {
            Ok(rx) => rx,
            Err(e) => {
                remove_controller(&self.controllers, session.id, &controller);
                error!("Failed to start agent for session {}: {e}", session.id);
                return Err(e.into());
            }
        };

        self.event_bus.send(GatewayEvent::TurnStarted {
            session_id: session.id,
            user_id,
        });

        let turn = Turn {
            session_id: session.id,
            agent_id_recorded: false,
            controller,
            sessions: Arc::clone(&self.sessions),
            approvals: Arc::clone(&self.approvals),
            rules: Arc::clone(&self.rules),
            controllers: Arc::clone(&self.controllers),
            event_bus: self.event_bus.clone(),
            shutdown: self.shutdown.clone(),
        };
        tokio::spawn(turn.run(rx));
        Ok(session.id)
    }

    /// Stop the active session's running turn. Returns false if nothing was running.
    pub async fn cancel(&self, user_id: i64) -> Result<bool> {
        self.authorize(user_id)?;
        let session = self
            .sessions
            .active_session(user_id)
            .ok_or(GatewayError::NoActiveSession)?;
        let Some(controller) = self.controller_for(&session.id) else {
            return Ok(false);
        };

        self.approvals.deny_all_for_session(&session.id.to_string());
        info!("Cancelling turn of session {}", session.id);
        self.stop_with_grace(controller);
        Ok(true)
    }

    // ─── Approvals ────────────────────────────────────────────────────────────

    /// Approve a pending request on one of the user's sessions.
    pub async fn approve(&self, user_id: i64, request_id: &str) -> Result<bool> {
        self.resolve_approval(user_id, request_id, true)
    }

    /// Deny a pending request on one of the user's sessions.
    pub async fn deny(&self, user_id: i64, request_id: &str) -> Result<bool> {
        self.resolve_approval(user_id, request_id, false)
    }

    fn resolve_approval(&self, user_id: i64, request_id: &str, approved: bool) -> Result<bool> {
        self.authorize(user_id)?;
        let Some(request) = self.approvals.get_request(request_id) else {
            return Ok(false);
        };
        let owner = request
            .session_id
            .parse::<Uuid>()
            .ok()
            .and_then(|id| self.sessions.get_session(&id).ok().flatten())
            .map(|s| s.user_id);
        if owner != Some(user_id) {
            // Someone else's request looks exactly like a missing one.
            return Ok(false);
        }
        Ok(if approved {
            self.approvals.approve(request_id)
        } else {
            self.approvals.deny(request_id)
        })
    }

    /// Undecided requests of the user's active session, oldest first.
    pub async fn pending_approvals(&self, user_id: i64) -> Result<Vec<ApprovalRequest>> {
        self.authorize(user_id)?;
        Ok(match self.sessions.active_session(user_id) {
            Some(session) => self.approvals.get_pending_for_session(&session.id.to_string()),
            None => Vec::new(),
        })
    }

    pub fn status(&self) -> GatewayStatus {
        GatewayStatus {
            running_turns: self
                .controllers
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .len(),
            pending_approvals: self.approvals.pending_count(),
        }
    }

    /// Stop every agent, deny every pending approval and flush sessions to idle.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        info!("Gateway shutting down");
        self.shutdown.cancel();
        self.approvals.deny_all();

        let running: Vec<Arc<AgentController>> = self
            .controllers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        let grace = self.grace();
        let stops = running.iter().map(|c| c.terminate(grace));
        for result in futures_util::future::join_all(stops).await {
            if let Err(e) = result {
                warn!("Failed to stop agent during shutdown: {e}");
            }
        }

        self.sessions.mark_all_idle()?;
        Ok(())
    }
}

fn session_not_found() -> GatewayError {
    GatewayError::Session(error::SessionError::NotFound)
}

fn remove_controller(
    controllers: &ControllerMap,
    session_id: Uuid,
    controller: &Arc<AgentController>,
) {
    let mut map = controllers.write().unwrap_or_else(PoisonError::into_inner);
    if map.get(&session_id).is_some_and(|c| Arc::ptr_eq(c, controller)) {
        map.remove(&session_id);
    }
}

// ─── Agent turn runner ────────────────────────────────────────────────────────

/// Everything one running turn needs, detached from the gateway itself.
struct Turn {
    session_id: Uuid,
    /// Only the first init of a turn names the agent session.
    agent_id_recorded: bool,
    controller: Arc<AgentController>,
    sessions: Arc<SessionDirectory>,
    approvals: Arc<ApprovalGate>,
    rules: Arc<ApprovalRules>,
    controllers: ControllerMap,
    event_bus: EventBus,
    shutdown: CancellationToken,
}

impl Turn {
    async fn run(mut self, mut rx: mpsc::Receiver<StructuredMessage>) {
        while let Some(msg) = rx.recv().await {
            self.handle(msg).await;
        }

        // The session stays busy until the agent is reaped, not just until its output ends.
        self.controller.wait_exited().await;
        remove_controller(&self.controllers, self.session_id, &self.controller);
        self.event_bus.send(GatewayEvent::TurnFinished {
            session_id: self.session_id,
        });
        info!("Turn finished: session={}", self.session_id);
    }

    async fn handle(&mut self, msg: StructuredMessage) {
        let session_id = self.session_id;
        match msg {
            StructuredMessage::Init(init)
                if !self.agent_id_recorded && !init.session_id.is_empty() =>
            {
                self.agent_id_recorded = true;
                if let Err(e) = self
                    .sessions
                    .update_agent_session_id(&session_id, &init.session_id)
                {
                    warn!("Failed to store agent session id for {session_id}: {e}");
                }
            }
            StructuredMessage::Init(init) => {
                debug!("Ignoring repeated init {:?} from agent", init.session_id);
            }
            StructuredMessage::Assistant(assistant) => {
                let content = assistant.text();
                if !content.is_empty() {
                    self.event_bus
                        .send(GatewayEvent::TextDelta { session_id, content });
                }
            }
            StructuredMessage::ToolUse(tool) => {
                self.event_bus.send(GatewayEvent::ToolUse {
                    session_id,
                    tool_use_id: tool.id.clone(),
                    summary: tool.summary(),
                });
                let classification = self.rules.classify(&StructuredMessage::ToolUse(tool.clone()));
                if classification.requires_approval {
                    self.gate(&tool, &classification.reason, &classification.command)
                        .await;
                }
            }
            StructuredMessage::ToolResult(result) => {
                self.event_bus.send(GatewayEvent::ToolResult {
                    session_id,
                    tool_use_id: result.tool_use_id,
                    is_error: result.is_error,
                });
            }
            StructuredMessage::Result(result) => {
                if let Err(e) = self.sessions.add_cost(&session_id, result.cost_usd) {
                    warn!("Failed to record cost for {session_id}: {e}");
                }
                self.event_bus.send(GatewayEvent::TurnComplete {
                    session_id,
                    result: result.result,
                    cost_usd: result.cost_usd,
                    usage: result.usage,
                });
            }
            StructuredMessage::Error(err) => {
                error!("Agent reported an error in {session_id}: {}", err.error);
                self.event_bus.send(GatewayEvent::Error {
                    session_id: Some(session_id),
                    message: err.error,
                });
            }
            StructuredMessage::Other(record) => {
                debug!("Ignoring {} record from agent", record.kind);
            }
        }
    }

    /// Hold a risky tool call until a human decides, then answer the agent.
    async fn gate(&self, tool: &ToolUseMessage, reason: &str, command: &str) {
        let request =
            self.approvals
                .create_request(&self.session_id.to_string(), &tool.name, reason, command);
        let request_id = request.id.clone();
        self.event_bus
            .send(GatewayEvent::ApprovalRequested { request });

        let decision = match self
            .approvals
            .wait_for_decision(&request_id, &self.shutdown)
            .await
        {
            Ok(decision) => decision,
            Err(e) => {
                debug!("Approval wait ended early: {e}");
                Decision::Denied
            }
        };

        self.event_bus.send(GatewayEvent::ApprovalResolved {
            session_id: self.session_id,
            request_id,
            decision,
        });
        if let Err(e) = self.controller.send_input(decision.terminal_reply()).await {
            warn!("Could not deliver {decision} to agent: {e}");
        }
    }
}
