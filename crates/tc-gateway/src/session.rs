//! Session directory: every known session, and which one is active per user.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{info, warn};
use uuid::Uuid;

use tc_types::session::{Session, SessionStatus};

use crate::error::SessionError;
use crate::storage::SessionStore;

type Result<T> = std::result::Result<T, SessionError>;

pub struct SessionDirectory {
    store: SessionStore,
    /// user id -> that user's active session.
    active: RwLock<HashMap<i64, Session>>,
}

impl SessionDirectory {
    pub fn new(store: SessionStore) -> Self {
        Self {
            store,
            active: RwLock::new(HashMap::new()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<i64, Session>> {
        self.active.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<i64, Session>> {
        self.active.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn active_session(&self, user_id: i64) -> Option<Session> {
        self.read().get(&user_id).cloned()
    }

    /// Make `session` the user's active session, demoting the previous one.
    pub fn set_active_session(&self, mut session: Session) -> Result<Session> {
        session.mark_active();
        let previous = self.write().insert(session.user_id, session.clone());
        if let Some(mut prev) = previous.filter(|p| p.id != session.id) {
            prev.mark_idle();
            self.store.save(&prev)?;
        }
        self.store.save(&session)?;
        Ok(session)
    }

    /// Allocate a new session and make it the user's active one.
    pub fn create_session(
        &self,
        user_id: i64,
        project_path: impl Into<PathBuf>,
        project_name: &str,
    ) -> Result<Session> {
        let session = Session::new(user_id, project_path, project_name);
        let session = self.set_active_session(session)?;
        info!(
            "Session created: id={}, user={user_id}, project={}",
            session.id, session.project_name
        );
        Ok(session)
    }

    /// Load a session the user owns. Unknown, malformed and foreign ids look the same.
    fn owned_session(&self, user_id: i64, id: &str) -> Result<Session> {
        let id: Uuid = id.parse().map_err(|_| SessionError::NotFound)?;
        match self.get_session(&id)? {
            Some(session) if session.user_id == user_id => Ok(session),
            _ => Err(SessionError::NotFound),
        }
    }

    pub fn switch_session(&self, user_id: i64, id: &str) -> Result<Session> {
        let session = self.owned_session(user_id, id)?;
        let session = self.set_active_session(session)?;
        info!("Switched user {user_id} to session {}", session.id);
        Ok(session)
    }

    /// Reactivate the user's most recently active session, if any.
    pub fn continue_latest(&self, user_id: i64) -> Result<Option<Session>> {
        let latest = self
            .user_sessions(user_id)?
            .into_iter()
            .find(|s| s.status != SessionStatus::Archived);
        match latest {
            Some(session) => self.set_active_session(session).map(Some),
            None => Ok(None),
        }
    }

    /// Apply `update` to the session, in memory if active and on disk.
    fn modify(&self, id: &Uuid, update: impl Fn(&mut Session)) -> Result<Session> {
        let in_memory = {
            let mut active = self.write();
            active.values_mut().find(|s| s.id == *id).map(|s| {
                update(s);
                s.clone()
            })
        };
        let session = match in_memory {
            Some(session) => session,
            None => {
                let mut session = self.store.load(id)?.ok_or(SessionError::NotFound)?;
                update(&mut session);
                session
            }
        };
        self.store.save(&session)?;
        Ok(session)
    }

    pub fn update_agent_session_id(&self, id: &Uuid, agent_session_id: &str) -> Result<()> {
        self.modify(id, |s| s.agent_session_id = Some(agent_session_id.to_string()))?;
        Ok(())
    }

    pub fn add_cost(&self, id: &Uuid, cost_usd: f64) -> Result<f64> {
        Ok(self.modify(id, |s| s.add_cost(cost_usd))?.total_cost_usd)
    }

    /// The user's sessions, most recently active first.
    pub fn user_sessions(&self, user_id: i64) -> Result<Vec<Session>> {
        let mut sessions = self.store.list_by_user(user_id)?;
        if let Some(active) = self.active_session(user_id) {
            if let Some(stored) = sessions.iter_mut().find(|s| s.id == active.id) {
                *stored = active;
            }
        }
        sessions.sort_by(|a, b| b.last_active.cmp(&a.last_active));
        Ok(sessions)
    }

    pub fn get_session(&self, id: &Uuid) -> Result<Option<Session>> {
        if let Some(session) = self.read().values().find(|s| s.id == *id) {
            return Ok(Some(session.clone()));
        }
        Ok(self.store.load(id)?)
    }

    /// Archive one of the user's sessions, deactivating it if it was active.
    pub fn archive_session(&self, user_id: i64, id: &str) -> Result<Session> {
        let mut session = self.owned_session(user_id, id)?;
        {
            let mut active = self.write();
            if active.get(&user_id).is_some_and(|s| s.id == session.id) {
                active.remove(&user_id);
            }
        }
        session.archive();
        self.store.save(&session)?;
        info!("Session archived: id={}", session.id);
        Ok(session)
    }

    /// Flush every active session to idle and forget them. Used at shutdown.
    ///
    /// Every session is attempted; the first save failure is returned afterwards.
    /// A record that could not be saved is demoted on the next start by
    /// [`reset_stale_active`](Self::reset_stale_active).
    pub fn mark_all_idle(&self) -> Result<usize> {
        let drained: Vec<Session> = self.write().drain().map(|(_, s)| s).collect();
        let saved = self.demote_all(drained)?;
        if saved > 0 {
            info!("Marked {saved} active session(s) idle");
        }
        Ok(saved)
    }

    /// Demote records still marked active on disk. Nothing is active before the
    /// first command of a run, so these were left behind by an unclean exit.
    pub fn reset_stale_active(&self) -> Result<usize> {
        let stale: Vec<Session> = self
            .store
            .list_all()?
            .into_iter()
            .filter(|s| s.status == SessionStatus::Active)
            .collect();
        let reset = self.demote_all(stale)?;
        if reset > 0 {
            warn!("Reset {reset} session(s) left active by a previous run");
        }
        Ok(reset)
    }

    fn demote_all(&self, sessions: Vec<Session>) -> Result<usize> {
        let mut saved = 0;
        let mut first_error = None;
        for mut session in sessions {
            session.mark_idle();
            match self.store.save(&session) {
                Ok(()) => saved += 1,
                Err(e) => {
                    warn!("Failed to mark session {} idle: {e:#}", session.id);
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(saved),
        }
    }
}
