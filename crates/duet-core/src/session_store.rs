use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::session::{summarize, Session};
use crate::types::{DeliveryState, SessionId, Task, TaskRecord, TaskResult};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SessionStoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("session {id} is corrupt: {reason}")]
    Corrupt { id: SessionId, reason: String },
    #[error("session {id} has no record #{seq}")]
    RecordNotFound { id: SessionId, seq: u64 },
}

pub type Result<T> = std::result::Result<T, SessionStoreError>;

// ---------------------------------------------------------------------------
// SessionStore
// ---------------------------------------------------------------------------

/// Owner of every Session and its task history.
///
/// Sessions are cached in memory and, when a base directory is configured,
/// persisted as one JSON document each (`<base_dir>/<id>.json`). Writes go to
/// a temporary file first and are renamed into place.
pub struct SessionStore {
    base_dir: Option<PathBuf>,
    summary_window: usize,
    summary_max_chars: usize,
    sessions: DashMap<SessionId, Arc<Mutex<Session>>>,
}

impl SessionStore {
    /// Create a store backed by `base_dir`.
    pub fn new(base_dir: PathBuf, config: &SessionConfig) -> Self {
        Self {
            base_dir: Some(base_dir),
            summary_window: config.summary_window,
            summary_max_chars: config.summary_max_chars,
            sessions: DashMap::new(),
        }
    }

    /// Create a store that never touches the filesystem.
    pub fn in_memory(config: &SessionConfig) -> Self {
        Self {
            base_dir: None,
            summary_window: config.summary_window,
            summary_max_chars: config.summary_max_chars,
            sessions: DashMap::new(),
        }
    }

    pub fn summary_max_chars(&self) -> usize {
        self.summary_max_chars
    }

    /// Return the session for `id`, creating and persisting it on first
    /// reference. Idempotent: a known id always yields the same record.
    pub fn resolve(&self, id: &SessionId) -> Result<Session> {
        let slot = self.slot(id)?;
        let session = lock(&slot).clone();
        Ok(session)
    }

    /// Read-only lookup: an unknown id yields `None` and creates nothing.
    pub fn get(&self, id: &SessionId) -> Result<Option<Session>> {
        if let Some(slot) = self.sessions.get(id) {
            return Ok(Some(lock(slot.value()).clone()));
        }
        match self.session_path(id) {
            Some(path) if path.exists() => self.load(&path, id).map(Some),
            _ => Ok(None),
        }
    }

    /// Drop the cached copy of a file-backed session nobody is using. The
    /// next reference reloads it from disk. In-memory sessions stay cached.
    pub fn evict(&self, id: &SessionId) -> bool {
        if self.base_dir.is_none() {
            return false;
        }
        let evicted = self
            .sessions
            .remove_if(id, |_, slot| Arc::strong_count(slot) == 1)
            .is_some();
        if evicted {
            debug!(session_id = %id, "session evicted from cache");
        }
        evicted
    }

    pub fn cached_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Append a terminal outcome to the session's history and recompute its
    /// context summary. Either the record is durably stored or the session is
    /// left untouched.
    pub fn append(
        &self,
        id: &SessionId,
        request: &str,
        task: Task,
        result: TaskResult,
    ) -> Result<TaskRecord> {
        let slot = self.slot(id)?;
        let mut session = lock(&slot);

        let record = TaskRecord {
            seq: session.next_seq(),
            request: request.to_string(),
            task,
            result,
            recorded_at: Utc::now(),
            delivery: DeliveryState::Pending,
        };

        let previous_summary = session.context_summary().to_string();
        let previous_last_used = session.last_used_at;
        session.push_record(record.clone());
        let summary = summarize(
            session.records(),
            self.summary_window,
            self.summary_max_chars,
        );
        session.set_summary(summary);

        if let Err(err) = self.persist(&session) {
            session.pop_record();
            session.set_summary(previous_summary);
            session.last_used_at = previous_last_used;
            warn!(session_id = %id, error = %err, "append rolled back: persist failed");
            return Err(err);
        }

        debug!(session_id = %id, seq = record.seq, success = record.result.success, "task record appended");
        Ok(record)
    }

    /// The bounded planner context for `id`.
    pub fn context_summary(&self, id: &SessionId) -> Result<String> {
        let slot = self.slot(id)?;
        let summary = lock(&slot).context_summary().to_string();
        Ok(summary)
    }

    /// Record whether the Workflow Dispatcher accepted record `seq`.
    ///
    /// The in-memory state is updated even when persisting fails: the
    /// notification already happened, and reverting to `Pending` would let a
    /// recovery pass in this process send it again.
    pub fn mark_delivery(&self, id: &SessionId, seq: u64, state: DeliveryState) -> Result<()> {
        let slot = self.slot(id)?;
        let mut session = lock(&slot);
        match session.record_mut(seq) {
            Some(record) => record.delivery = state,
            None => {
                return Err(SessionStoreError::RecordNotFound {
                    id: id.clone(),
                    seq,
                })
            }
        }
        if let Err(err) = self.persist(&session) {
            warn!(session_id = %id, seq, error = %err, "delivery state kept in memory only");
            return Err(err);
        }
        Ok(())
    }

    /// Every record whose delivery never completed, grouped by session.
    pub fn pending_deliveries(&self) -> Result<Vec<(SessionId, TaskRecord)>> {
        let mut pending = Vec::new();
        for session in self.list_sessions()? {
            for record in session.records() {
                if record.delivery == DeliveryState::Pending {
                    pending.push((session.id.clone(), record.clone()));
                }
            }
        }
        Ok(pending)
    }

    /// All readable sessions, most recently used first. Corrupt documents
    /// are skipped with a warning.
    pub fn list_sessions(&self) -> Result<Vec<Session>> {
        let mut sessions: Vec<Session> = Vec::new();

        if let Some(dir) = &self.base_dir {
            std::fs::create_dir_all(dir)?;
            for entry in std::fs::read_dir(dir)? {
                let path = entry?.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let Some(id) = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .and_then(|s| SessionId::parse(s).ok())
                else {
                    continue;
                };
                let listed = match self.sessions.get(&id) {
                    Some(slot) => Ok(lock(slot.value()).clone()),
                    None => self.load(&path, &id),
                };
                match listed {
                    Ok(session) => sessions.push(session),
                    Err(err) => warn!(session_id = %id, error = %err, "skipping unreadable session"),
                }
            }
        } else {
            for slot in self.sessions.iter() {
                sessions.push(lock(slot.value()).clone());
            }
        }

        sessions.sort_by(|a, b| b.last_used_at.cmp(&a.last_used_at));
        Ok(sessions)
    }

    /// Administrative removal. Returns `true` if a session existed.
    pub fn delete_session(&self, id: &SessionId) -> Result<bool> {
        let cached = self.sessions.remove(id).is_some();
        let on_disk = match self.session_path(id) {
            Some(path) if path.exists() => {
                std::fs::remove_file(path)?;
                true
            }
            _ => false,
        };
        if cached || on_disk {
            info!(session_id = %id, "session deleted");
        }
        Ok(cached || on_disk)
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn slot(&self, id: &SessionId) -> Result<Arc<Mutex<Session>>> {
        if let Some(slot) = self.sessions.get(id) {
            return Ok(slot.clone());
        }
        match self.sessions.entry(id.clone()) {
            Entry::Occupied(slot) => Ok(slot.get().clone()),
            Entry::Vacant(vacant) => {
                let session = self.load_or_create(id)?;
                let slot = Arc::new(Mutex::new(session));
                vacant.insert(slot.clone());
                Ok(slot)
            }
        }
    }

    fn load_or_create(&self, id: &SessionId) -> Result<Session> {
        if let Some(path) = self.session_path(id) {
            if path.exists() {
                let session = self.load(&path, id)?;
                debug!(session_id = %id, tasks = session.task_count(), "session loaded");
                return Ok(session);
            }
        }
        let session = Session::new(id.clone());
        self.persist(&session)?;
        info!(session_id = %id, "session created");
        Ok(session)
    }

    /// Read a stored session and rebuild its summary under this store's
    /// window and bound, which may differ from the ones it was saved with.
    fn load(&self, path: &Path, id: &SessionId) -> Result<Session> {
        let mut session = read_session(path, id)?;
        let summary = summarize(
            session.records(),
            self.summary_window,
            self.summary_max_chars,
        );
        session.set_summary(summary);
        Ok(session)
    }

    fn session_path(&self, id: &SessionId) -> Option<PathBuf> {
        self.base_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.json", id)))
    }

    fn persist(&self, session: &Session) -> Result<()> {
        let Some(path) = self.session_path(&session.id) else {
            return Ok(());
        };
        if let Some(dir) = &self.base_dir {
            std::fs::create_dir_all(dir)?;
        }
        let json = serde_json::to_string_pretty(session)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }
}

fn read_session(path: &Path, id: &SessionId) -> Result<Session> {
    let corrupt = |reason: String| SessionStoreError::Corrupt {
        id: id.clone(),
        reason,
    };
    let data = std::fs::read_to_string(path).map_err(|e| corrupt(e.to_string()))?;
    let session: Session = serde_json::from_str(&data).map_err(|e| corrupt(e.to_string()))?;
    if &session.id != id {
        return Err(corrupt(format!("document belongs to session {}", session.id)));
    }
    for (index, record) in session.records().iter().enumerate() {
        if record.seq != index as u64 {
            return Err(corrupt(format!(
                "record #{index} carries sequence number {}",
                record.seq
            )));
        }
    }
    Ok(session)
}

fn lock(slot: &Mutex<Session>) -> MutexGuard<'_, Session> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TaskAction;

    fn temp_store() -> (SessionStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("create temp dir");
        let store = SessionStore::new(dir.path().to_path_buf(), &SessionConfig::default());
        (store, dir)
    }

    fn sid(raw: &str) -> SessionId {
        SessionId::parse(raw).unwrap()
    }

    fn explain(text: &str) -> Task {
        Task::new(TaskAction::Explain, text).unwrap()
    }

    #[test]
    fn test_resolve_creates_once() {
        let (store, dir) = temp_store();
        let first = store.resolve(&sid("alpha")).unwrap();
        let second = store.resolve(&sid("alpha")).unwrap();
        assert_eq!(first.created_at, second.created_at);
        assert!(dir.path().join("alpha.json").exists());
    }

    #[test]
    fn test_append_updates_summary() {
        let (store, _dir) = temp_store();
        let id = sid("alpha");
        store
            .append(&id, "what does main do", explain("explain main"), TaskResult::succeeded("it starts the server", 1))
            .unwrap();
        let summary = store.context_summary(&id).unwrap();
        assert!(summary.contains("it starts the server"));
    }

    #[test]
    fn test_sequence_numbers_follow_history() {
        let (store, _dir) = temp_store();
        let id = sid("alpha");
        for i in 0..3 {
            let record = store
                .append(&id, "r", explain("x"), TaskResult::succeeded(format!("out {i}"), 1))
                .unwrap();
            assert_eq!(record.seq, i);
        }
    }

    #[test]
    fn test_mark_delivery_unknown_seq() {
        let (store, _dir) = temp_store();
        let id = sid("alpha");
        store.resolve(&id).unwrap();
        let err = store
            .mark_delivery(&id, 7, DeliveryState::Delivered)
            .unwrap_err();
        assert!(matches!(err, SessionStoreError::RecordNotFound { seq: 7, .. }));
    }

    #[test]
    fn test_in_memory_store_lists_sessions() {
        let store = SessionStore::in_memory(&SessionConfig::default());
        store.resolve(&sid("a")).unwrap();
        store.resolve(&sid("b")).unwrap();
        assert_eq!(store.list_sessions().unwrap().len(), 2);
    }

    #[test]
    fn test_delete_session() {
        let (store, dir) = temp_store();
        let id = sid("gone");
        store.resolve(&id).unwrap();
        assert!(store.delete_session(&id).unwrap());
        assert!(!store.delete_session(&id).unwrap());
        assert!(!dir.path().join("gone.json").exists());
    }

    #[test]
    fn test_mismatched_document_is_corrupt() {
        let (store, dir) = temp_store();
        let other = Session::new(sid("other"));
        std::fs::write(
            dir.path().join("mine.json"),
            serde_json::to_string(&other).unwrap(),
        )
        .unwrap();
        let err = store.resolve(&sid("mine")).unwrap_err();
        assert!(matches!(err, SessionStoreError::Corrupt { .. }));
    }
}
