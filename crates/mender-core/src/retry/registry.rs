//! Session registry: live retry sessions keyed by normalized id

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::session::{RetrySession, SessionSummary};
use crate::error::SessionError;

/// Maximum session id length
const MAX_SESSION_ID_LEN: usize = 128;

/// Normalize a session key: lowercase, trim whitespace, reject path characters
pub fn normalize_session_key(key: &str) -> Result<String, &'static str> {
    let normalized = key.trim().to_lowercase();

    if normalized.is_empty() {
        return Err("session id cannot be empty");
    }
    if normalized.len() > MAX_SESSION_ID_LEN {
        return Err("session id too long");
    }
    if normalized.contains('/')
        || normalized.contains('\\')
        || normalized.contains("..")
        || normalized.chars().any(|c| c.is_control())
    {
        return Err("session id contains invalid characters");
    }

    Ok(normalized)
}

/// How a session is driven
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    /// Run to completion by one caller, then evicted
    Batch,
    /// Stepped by external calls; lives until deleted
    Paced,
}

/// One registered session.
///
/// `run_lock` serializes attempts; `state` is only write-locked for the
/// instant an attempt is recorded, so readers never wait on a running attempt.
pub struct SessionHandle {
    id: String,
    mode: SessionMode,
    run_lock: Mutex<()>,
    state: RwLock<RetrySession>,
    cancel: CancellationToken,
}

impl SessionHandle {
    pub fn new(session: RetrySession, mode: SessionMode, cancel: CancellationToken) -> Self {
        Self {
            id: session.id.clone(),
            mode,
            run_lock: Mutex::new(()),
            state: RwLock::new(session),
            cancel,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn mode(&self) -> SessionMode {
        self.mode
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Exclusive right to run the next attempt
    pub async fn lock_run(&self) -> MutexGuard<'_, ()> {
        self.run_lock.lock().await
    }

    pub fn state(&self) -> &RwLock<RetrySession> {
        &self.state
    }

    pub async fn summary(&self) -> SessionSummary {
        self.state.read().await.summary()
    }
}

/// Registry of live sessions.
///
/// `max_sessions` bounds paced sessions only. Batch sessions are removed by
/// the call that created them, so abandoned paced sessions cannot starve them.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<SessionHandle>>>,
    max_sessions: usize,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_sessions,
        }
    }

    /// Register a session; paced sessions fail when the paced slots are full
    pub async fn insert(
        &self,
        session: RetrySession,
        mode: SessionMode,
        cancel: CancellationToken,
    ) -> Result<Arc<SessionHandle>, SessionError> {
        let key = normalize_session_key(&session.id).map_err(SessionError::InvalidId)?;
        let mut sessions = self.sessions.write().await;

        if mode == SessionMode::Paced {
            let paced = sessions
                .values()
                .filter(|h| h.mode == SessionMode::Paced)
                .count();
            if paced >= self.max_sessions {
                warn!("Session registry full ({} paced sessions)", paced);
                return Err(SessionError::CapacityReached(self.max_sessions));
            }
        }

        let handle = Arc::new(SessionHandle::new(session, mode, cancel));
        sessions.insert(key, handle.clone());
        info!("Registered session {}", handle.id());
        Ok(handle)
    }

    pub async fn get(&self, id: &str) -> Result<Arc<SessionHandle>, SessionError> {
        let key = normalize_session_key(id).map_err(SessionError::InvalidId)?;
        self.sessions
            .read()
            .await
            .get(&key)
            .cloned()
            .ok_or_else(|| SessionError::NotFound(key))
    }

    /// Drop a session and cancel any loop still driving it
    pub async fn remove(&self, id: &str) -> Result<Arc<SessionHandle>, SessionError> {
        let key = normalize_session_key(id).map_err(SessionError::InvalidId)?;
        let handle = self
            .sessions
            .write()
            .await
            .remove(&key)
            .ok_or_else(|| SessionError::NotFound(key.clone()))?;
        handle.cancel.cancel();
        info!("Removed session {}", key);
        Ok(handle)
    }

    /// Summaries of all sessions, newest first
    pub async fn list(&self) -> Vec<SessionSummary> {
        let handles: Vec<Arc<SessionHandle>> =
            self.sessions.read().await.values().cloned().collect();

        let mut summaries = Vec::with_capacity(handles.len());
        for handle in handles {
            summaries.push(handle.summary().await);
        }
        summaries.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        summaries
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn paced_count(&self) -> usize {
        self.sessions
            .read()
            .await
            .values()
            .filter(|h| h.mode == SessionMode::Paced)
            .count()
    }

    pub fn capacity(&self) -> usize {
        self.max_sessions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::language::Language;

    fn session(id: &str) -> RetrySession {
        RetrySession::new(id.to_string(), Language::Python, "print(1)".into(), 3)
    }

    #[tokio::test]
    async fn test_insert_get_remove() {
        let registry = SessionRegistry::new(10);
        registry
            .insert(session("retry_abc"), SessionMode::Paced, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(registry.count().await, 1);

        let handle = registry.get("  RETRY_ABC ").await.unwrap();
        assert_eq!(handle.id(), "retry_abc");

        let removed = registry.remove("retry_abc").await.unwrap();
        assert!(removed.cancel_token().is_cancelled());
        assert_eq!(registry.count().await, 0);
    }

    #[tokio::test]
    async fn test_missing_session() {
        let registry = SessionRegistry::new(10);
        assert!(matches!(
            registry.get("retry_nope").await,
            Err(SessionError::NotFound(_))
        ));
        assert!(matches!(
            registry.remove("retry_nope").await,
            Err(SessionError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_capacity() {
        let registry = SessionRegistry::new(1);
        registry
            .insert(session("retry_1"), SessionMode::Paced, CancellationToken::new())
            .await
            .unwrap();
        let err = registry
            .insert(session("retry_2"), SessionMode::Paced, CancellationToken::new())
            .await
            .err()
            .unwrap();
        assert_eq!(err, SessionError::CapacityReached(1));
    }

    #[tokio::test]
    async fn test_batch_sessions_ignore_paced_capacity() {
        let registry = SessionRegistry::new(1);
        registry
            .insert(session("retry_paced"), SessionMode::Paced, CancellationToken::new())
            .await
            .unwrap();

        let batch = registry
            .insert(session("retry_batch"), SessionMode::Batch, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(batch.mode(), SessionMode::Batch);
        assert_eq!(registry.count().await, 2);
        assert_eq!(registry.paced_count().await, 1);

        registry.remove("retry_paced").await.unwrap();
        registry
            .insert(session("retry_paced_2"), SessionMode::Paced, CancellationToken::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_list_newest_first() {
        let registry = SessionRegistry::new(10);
        registry
            .insert(session("retry_old"), SessionMode::Paced, CancellationToken::new())
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        registry
            .insert(session("retry_new"), SessionMode::Paced, CancellationToken::new())
            .await
            .unwrap();

        let list = registry.list().await;
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].session_id, "retry_new");
    }

    #[tokio::test]
    async fn test_summary_readable_while_run_lock_held() {
        let registry = SessionRegistry::new(10);
        let handle = registry
            .insert(session("retry_busy"), SessionMode::Paced, CancellationToken::new())
            .await
            .unwrap();

        let _running = handle.lock_run().await;
        let summary = tokio::time::timeout(std::time::Duration::from_millis(100), handle.summary())
            .await
            .expect("summary must not wait on the run lock");
        assert_eq!(summary.total_attempts, 0);
    }

    #[test]
    fn test_normalize_session_key() {
        assert_eq!(normalize_session_key(" Retry_X ").unwrap(), "retry_x");
        assert!(normalize_session_key("").is_err());
        assert!(normalize_session_key("../etc/passwd").is_err());
        assert!(normalize_session_key("a\\b").is_err());
        assert!(normalize_session_key("a\0b").is_err());
        assert!(normalize_session_key(&"a".repeat(MAX_SESSION_ID_LEN + 1)).is_err());
    }
}
