//! Session manager keeping the live sessions of a process.

use std::{collections::HashMap, future::Future, sync::Arc};

use automatonic_core::{CommandError, ReadinessGate, RemoteTarget, SessionConfig};
use tokio::sync::RwLock;

use crate::session::{Session, SessionId};

/// Session manager error.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("Session not found: {0}")]
    NotFound(SessionId),
    /// A command sent to the session failed.
    #[error("Session {id} failed: {source}")]
    Command {
        id: SessionId,
        #[source]
        source: CommandError,
    },
}

type Sessions = Arc<RwLock<HashMap<SessionId, Session>>>;

/// Registry of live sessions.
///
/// A session is removed once its target closes.
pub struct SessionManager {
    config: SessionConfig,
    sessions: Sessions,
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}

impl SessionManager {
    /// Create a manager whose sessions use `config`.
    #[must_use]
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Start a session on a live target.
    pub async fn launch(&self, target: Arc<dyn RemoteTarget>) -> Session {
        self.register(Session::launch(target, self.config.clone()))
            .await
    }

    /// Start a session whose target is created once `gate` opens.
    pub async fn launch_gated<F, Fut>(&self, gate: &ReadinessGate, connect: F) -> Session
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Arc<dyn RemoteTarget>, CommandError>> + Send + 'static,
    {
        self.register(Session::launch_gated(gate, self.config.clone(), connect))
            .await
    }

    async fn register(&self, session: Session) -> Session {
        let id = session.id();
        self.sessions.write().await.insert(id, session.clone());

        // Neither the session nor the registry is kept alive by the reaper.
        let sessions = Arc::downgrade(&self.sessions);
        let mut closed = session.watch_closed();
        tokio::spawn(async move {
            let _ = closed.wait_for(|closed| *closed).await;
            let Some(sessions) = sessions.upgrade() else {
                return;
            };
            if sessions.write().await.remove(&id).is_some() {
                tracing::debug!(session = %id, "session removed");
            }
        });

        tracing::info!(session = %id, "session launched");
        session
    }

    /// Look up a live session.
    pub async fn get(&self, id: SessionId) -> Option<Session> {
        self.sessions.read().await.get(&id).cloned()
    }

    /// Ids of the live sessions, in no particular order.
    pub async fn ids(&self) -> Vec<SessionId> {
        self.sessions.read().await.keys().copied().collect()
    }

    /// Number of live sessions.
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Whether no session is live.
    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Close one session.
    ///
    /// # Errors
    /// Returns error if the session is unknown or its close command fails.
    pub async fn close(&self, id: SessionId) -> Result<(), ManagerError> {
        let session = self.get(id).await.ok_or(ManagerError::NotFound(id))?;
        session
            .close()
            .await
            .map_err(|source| ManagerError::Command { id, source })
    }

    /// Close every live session, in no particular order. Sessions that are
    /// already closed, or whose connect failed, are skipped.
    ///
    /// # Errors
    /// Every session is asked to close; the first failure is returned.
    pub async fn close_all(&self) -> Result<(), ManagerError> {
        let sessions: Vec<Session> = self.sessions.read().await.values().cloned().collect();
        let mut first_error = None;
        for session in sessions {
            let id = session.id();
            if session.is_closed() {
                tracing::debug!(session = %id, "session already closed");
                continue;
            }
            if let Err(source) = session.close().await {
                tracing::warn!(session = %id, error = %source, "failed to close session");
                first_error.get_or_insert(ManagerError::Command { id, source });
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
