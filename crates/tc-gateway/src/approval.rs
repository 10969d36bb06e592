//! Approval gate: arbitrates yes/no decisions for pending risky actions.
//!
//! Each request moves `pending -> approved | denied | expired` exactly once.
//! Decisions are handed over through a oneshot slot, so delivering one never
//! blocks and the first decision wins.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use tc_types::approval::{ApprovalRequest, Decision};

use crate::error::ApprovalError;

/// Extra time an abandoned request is kept after its deadline.
pub const DEFAULT_CLEANUP_DELAY: Duration = Duration::from_secs(1);

struct PendingEntry {
    request: ApprovalRequest,
    deadline: Instant,
    /// `None` once a decision has been delivered.
    decision_tx: Option<oneshot::Sender<bool>>,
    /// `None` once a waiter has claimed it.
    decision_rx: Option<oneshot::Receiver<bool>>,
    cleanup: Option<AbortHandle>,
}

impl PendingEntry {
    fn is_undecided(&self) -> bool {
        self.decision_tx.is_some()
    }
}

type Table = HashMap<String, PendingEntry>;

pub struct ApprovalGate {
    timeout: Duration,
    cleanup_delay: Duration,
    pending: Arc<RwLock<Table>>,
}

impl ApprovalGate {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            cleanup_delay: DEFAULT_CLEANUP_DELAY,
            pending: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn with_cleanup_delay(mut self, delay: Duration) -> Self {
        self.cleanup_delay = delay;
        self
    }

    fn read(&self) -> RwLockReadGuard<'_, Table> {
        self.pending.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Table> {
        self.pending.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new pending request and schedule its cleanup.
    pub fn create_request(
        &self,
        session_id: &str,
        tool_name: &str,
        reason: &str,
        command: &str,
    ) -> ApprovalRequest {
        let (tx, rx) = oneshot::channel();
        let deadline = Instant::now() + self.timeout;

        let request = {
            let mut table = self.write();
            let mut id = Uuid::new_v4().simple().to_string();
            while table.contains_key(&id) {
                id = Uuid::new_v4().simple().to_string();
            }
            let request = ApprovalRequest {
                id: id.clone(),
                session_id: session_id.to_string(),
                tool_name: tool_name.to_string(),
                reason: reason.to_string(),
                command: command.to_string(),
                created_at: Utc::now(),
            };
            table.insert(
                id,
                PendingEntry {
                    request: request.clone(),
                    deadline,
                    decision_tx: Some(tx),
                    decision_rx: Some(rx),
                    cleanup: None,
                },
            );
            request
        };

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let table = Arc::clone(&self.pending);
            let id = request.id.clone();
            let delay = self.timeout + self.cleanup_delay;
            let task = handle.spawn(async move {
                tokio::time::sleep(delay).await;
                let removed = table
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&id);
                if removed.is_some() {
                    debug!("Cleaned up abandoned approval request {id}");
                }
            });
            if let Some(entry) = self.write().get_mut(&request.id) {
                entry.cleanup = Some(task.abort_handle());
            }
        } else {
            warn!(
                "No async runtime; approval request {} stays until decided or awaited",
                request.id
            );
        }

        info!(
            "Approval requested: id={}, session={}, tool={}",
            request.id, request.session_id, request.tool_name
        );
        request
    }

    /// Approve a pending request. Returns false if there was nothing to approve.
    pub fn approve(&self, id: &str) -> bool {
        self.resolve(id, true)
    }

    /// Deny a pending request. Returns false if there was nothing to deny.
    pub fn deny(&self, id: &str) -> bool {
        self.resolve(id, false)
    }

    fn resolve(&self, id: &str, approved: bool) -> bool {
        let tx = match self.write().get_mut(id) {
            Some(entry) => entry.decision_tx.take(),
            None => None,
        };
        let Some(tx) = tx else {
            debug!("Ignoring decision for unknown or resolved request {id}");
            return false;
        };
        // A waiter that has already given up drops its receiver; the
        // decision is then simply discarded.
        let _ = tx.send(approved);
        info!("Approval request {id} {}", if approved { "approved" } else { "denied" });
        true
    }

    /// Suspend until the request is decided, its deadline passes or `cancel` fires.
    ///
    /// The request is removed from the gate whichever happens first.
    pub async fn wait_for_decision(
        &self,
        id: &str,
        cancel: &CancellationToken,
    ) -> Result<Decision, ApprovalError> {
        let (rx, deadline) = {
            let mut table = self.write();
            let entry = table
                .get_mut(id)
                .ok_or_else(|| ApprovalError::NotFound(id.to_string()))?;
            let rx = entry
                .decision_rx
                .take()
                .ok_or_else(|| ApprovalError::AlreadyAwaited(id.to_string()))?;
            (rx, entry.deadline)
        };

        let outcome = tokio::select! {
            biased;
            res = tokio::time::timeout_at(deadline, rx) => match res {
                Ok(Ok(true)) => Ok(Decision::Approved),
                Ok(Ok(false)) => Ok(Decision::Denied),
                // Sender dropped by cleanup, or the deadline passed.
                Ok(Err(_)) | Err(_) => Ok(Decision::Expired),
            },
            _ = cancel.cancelled() => Err(ApprovalError::Cancelled(id.to_string())),
        };

        self.remove(id);
        if let Ok(Decision::Expired) = outcome {
            info!("Approval request {id} expired");
        }
        outcome
    }

    fn remove(&self, id: &str) {
        if let Some(entry) = self.write().remove(id) {
            if let Some(cleanup) = entry.cleanup {
                cleanup.abort();
            }
        }
    }

    pub fn get_request(&self, id: &str) -> Option<ApprovalRequest> {
        self.read().get(id).map(|e| e.request.clone())
    }

    /// Undecided requests for a session, oldest first.
    pub fn get_pending_for_session(&self, session_id: &str) -> Vec<ApprovalRequest> {
        let mut requests: Vec<ApprovalRequest> = self
            .read()
            .values()
            .filter(|e| e.is_undecided() && e.request.session_id == session_id)
            .map(|e| e.request.clone())
            .collect();
        requests.sort_by_key(|r| r.created_at);
        requests
    }

    /// Deny every undecided request of a session. Returns how many were denied.
    pub fn deny_all_for_session(&self, session_id: &str) -> usize {
        let ids: Vec<String> = self
            .get_pending_for_session(session_id)
            .into_iter()
            .map(|r| r.id)
            .collect();
        ids.iter().filter(|id| self.deny(id)).count()
    }

    /// Deny every undecided request in the gate.
    pub fn deny_all(&self) -> usize {
        let ids: Vec<String> = self
            .read()
            .iter()
            .filter(|(_, e)| e.is_undecided())
            .map(|(id, _)| id.clone())
            .collect();
        ids.iter().filter(|id| self.deny(id)).count()
    }

    pub fn pending_count(&self) -> usize {
        self.read().values().filter(|e| e.is_undecided()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn gate(timeout_ms: u64) -> ApprovalGate {
        ApprovalGate::new(Duration::from_millis(timeout_ms))
            .with_cleanup_delay(Duration::from_millis(10))
    }

    #[test]
    fn request_created_outside_a_runtime_is_kept_until_awaited() {
        let gate = gate(50);
        let req = gate.create_request("s1", "Bash", "Run command", "ls");
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(gate.pending_count(), 1);

        assert!(gate.deny(&req.id));
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let decision = runtime
            .block_on(gate.wait_for_decision(&req.id, &CancellationToken::new()))
            .unwrap();
        assert_eq!(decision, Decision::Denied);
        assert_eq!(gate.pending_count(), 0);
    }

    #[tokio::test]
    async fn decision_before_wait_is_not_lost() {
        let gate = gate(5_000);
        let req = gate.create_request("s1", "Bash", "Delete files/directories", "rm -rf x");

        assert!(gate.approve(&req.id));
        let decision = gate
            .wait_for_decision(&req.id, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(decision, Decision::Approved);
        assert!(gate.get_request(&req.id).is_none());
    }

    #[tokio::test]
    async fn first_decision_wins() {
        let gate = gate(5_000);
        let req = gate.create_request("s1", "Bash", "r", "c");

        assert!(gate.deny(&req.id));
        assert!(!gate.approve(&req.id));
        let decision = gate
            .wait_for_decision(&req.id, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(decision, Decision::Denied);
    }

    #[tokio::test]
    async fn decision_wakes_a_waiter() {
        let gate = Arc::new(gate(5_000));
        let req = gate.create_request("s1", "Bash", "r", "c");

        let waiter = {
            let gate = Arc::clone(&gate);
            let id = req.id.clone();
            tokio::spawn(async move {
                gate.wait_for_decision(&id, &CancellationToken::new()).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(gate.approve(&req.id));

        assert_eq!(waiter.await.unwrap().unwrap(), Decision::Approved);
        assert_eq!(gate.pending_count(), 0);
    }

    #[tokio::test]
    async fn timeout_expires_and_removes_the_request() {
        let gate = gate(30);
        let req = gate.create_request("s1", "Bash", "r", "c");

        let decision = gate
            .wait_for_decision(&req.id, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(decision, Decision::Expired);
        assert!(gate.get_request(&req.id).is_none());
        assert!(!gate.approve(&req.id));
    }

    #[tokio::test]
    async fn unknown_id_is_not_found() {
        let gate = gate(1_000);
        let err = gate
            .wait_for_decision("missing", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ApprovalError::NotFound(id) if id == "missing"));
        assert!(!gate.approve("missing"));
        assert!(!gate.deny("missing"));
    }

    #[tokio::test]
    async fn second_waiter_is_rejected() {
        let gate = Arc::new(gate(5_000));
        let req = gate.create_request("s1", "Bash", "r", "c");
        let cancel = CancellationToken::new();

        let first = {
            let gate = Arc::clone(&gate);
            let id = req.id.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { gate.wait_for_decision(&id, &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let err = gate.wait_for_decision(&req.id, &cancel).await.unwrap_err();
        assert!(matches!(err, ApprovalError::AlreadyAwaited(_)));

        gate.deny(&req.id);
        assert_eq!(first.await.unwrap().unwrap(), Decision::Denied);
    }

    #[tokio::test]
    async fn cancellation_releases_the_waiter() {
        let gate = Arc::new(gate(5_000));
        let req = gate.create_request("s1", "Bash", "r", "c");
        let cancel = CancellationToken::new();

        let waiter = {
            let gate = Arc::clone(&gate);
            let id = req.id.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { gate.wait_for_decision(&id, &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, ApprovalError::Cancelled(_)));
        assert!(gate.get_request(&req.id).is_none());
    }

    #[tokio::test]
    async fn concurrent_requests_get_distinct_ids() {
        let gate = Arc::new(gate(5_000));
        let mut tasks = Vec::new();
        for i in 0..64 {
            let gate = Arc::clone(&gate);
            tasks.push(tokio::spawn(async move {
                gate.create_request(&format!("s{i}"), "Bash", "r", "c").id
            }));
        }
        let mut ids = HashSet::new();
        for task in tasks {
            ids.insert(task.await.unwrap());
        }
        assert_eq!(ids.len(), 64);
        assert_eq!(gate.pending_count(), 64);
    }

    #[tokio::test]
    async fn deny_all_for_session_leaves_other_sessions_alone() {
        let gate = gate(5_000);
        let a1 = gate.create_request("a", "Bash", "r", "c");
        let a2 = gate.create_request("a", "Bash", "r", "c");
        let b = gate.create_request("b", "Bash", "r", "c");

        assert_eq!(gate.get_pending_for_session("a").len(), 2);
        assert_eq!(gate.deny_all_for_session("a"), 2);
        assert!(gate.get_pending_for_session("a").is_empty());
        assert_eq!(gate.get_pending_for_session("b"), vec![b.clone()]);

        let cancel = CancellationToken::new();
        assert_eq!(gate.wait_for_decision(&a1.id, &cancel).await.unwrap(), Decision::Denied);
        assert_eq!(gate.wait_for_decision(&a2.id, &cancel).await.unwrap(), Decision::Denied);
        assert!(gate.approve(&b.id));
    }

    #[tokio::test]
    async fn abandoned_requests_are_cleaned_up() {
        let gate = gate(20);
        let req = gate.create_request("s1", "Bash", "r", "c");
        assert!(gate.get_request(&req.id).is_some());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(gate.get_request(&req.id).is_none());
        assert_eq!(gate.pending_count(), 0);
    }
}
