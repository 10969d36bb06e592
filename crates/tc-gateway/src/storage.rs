//! File-backed session records: one TOML file per session under `<data_dir>/sessions/`.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::warn;
use uuid::Uuid;

use tc_types::session::Session;

const EXTENSION: &str = "toml";

pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    /// Open (and create if needed) the session directory under `data_dir`.
    pub fn open(data_dir: &Path) -> Result<Self> {
        let dir = data_dir.join("sessions");
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &Uuid) -> PathBuf {
        self.dir.join(format!("{id}.{EXTENSION}"))
    }

    /// Write a session record, replacing any previous version atomically.
    pub fn save(&self, session: &Session) -> Result<()> {
        let path = self.path_for(&session.id);
        let tmp = path.with_extension("toml.tmp");
        let body = toml::to_string_pretty(session)
            .with_context(|| format!("Failed to serialize session {}", session.id))?;
        std::fs::write(&tmp, body)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("Failed to replace {}", path.display()))?;
        Ok(())
    }

    /// Load a session record. `Ok(None)` if no such record exists.
    pub fn load(&self, id: &Uuid) -> Result<Option<Session>> {
        let path = self.path_for(id);
        if !path.exists() {
            return Ok(None);
        }
        read_session(&path).map(Some)
    }

    pub fn delete(&self, id: &Uuid) -> Result<()> {
        let path = self.path_for(id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to delete {}", path.display())),
        }
    }

    /// Every readable session record. Corrupt files are logged and skipped.
    pub fn list_all(&self) -> Result<Vec<Session>> {
        let entries = std::fs::read_dir(&self.dir)
            .with_context(|| format!("Failed to list {}", self.dir.display()))?;

        let mut sessions = Vec::new();
        for entry in entries {
            let path = match entry {
                Ok(entry) => entry.path(),
                Err(e) => {
                    warn!("Skipping unreadable entry in {}: {e}", self.dir.display());
                    continue;
                }
            };
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            match read_session(&path) {
                Ok(session) => sessions.push(session),
                Err(e) => warn!("Skipping corrupt session file: {e:#}"),
            }
        }
        Ok(sessions)
    }

    pub fn list_by_user(&self, user_id: i64) -> Result<Vec<Session>> {
        Ok(self
            .list_all()?
            .into_iter()
            .filter(|s| s.user_id == user_id)
            .collect())
    }
}

fn read_session(path: &Path) -> Result<Session> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    toml::from_str(&contents).with_context(|| format!("Failed to parse {}", path.display()))
}
