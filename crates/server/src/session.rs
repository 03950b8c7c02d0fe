// Session store: session id -> live transport adapter

use crate::transport::{SseAdapter, StreamableAdapter};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    Closed,
}

/// The binding a session was opened on
pub enum SessionAdapter {
    Sse(SseAdapter),
    Streamable(StreamableAdapter),
}

impl SessionAdapter {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Sse(_) => "sse",
            Self::Streamable(_) => "streamable-http",
        }
    }
}

pub struct Session {
    id: String,
    created_at: DateTime<Utc>,
    adapter: SessionAdapter,
    cancel: CancellationToken,
    last_activity: AtomicI64,
}

impl Session {
    fn new(id: String, adapter: SessionAdapter) -> Self {
        let created_at = Utc::now();
        Self {
            id,
            created_at,
            adapter,
            cancel: CancellationToken::new(),
            last_activity: AtomicI64::new(created_at.timestamp_millis()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn adapter(&self) -> &SessionAdapter {
        &self.adapter
    }

    pub fn streamable(&self) -> Option<&StreamableAdapter> {
        match &self.adapter {
            SessionAdapter::Streamable(adapter) => Some(adapter),
            SessionAdapter::Sse(_) => None,
        }
    }

    pub fn sse(&self) -> Option<&SseAdapter> {
        match &self.adapter {
            SessionAdapter::Sse(adapter) => Some(adapter),
            SessionAdapter::Streamable(_) => None,
        }
    }

    pub fn state(&self) -> SessionState {
        if self.cancel.is_cancelled() {
            SessionState::Closed
        } else {
            SessionState::Active
        }
    }

    /// Fires when the session is torn down. Work tied to the session
    /// should select on a child of this token.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn touch(&self) {
        self.last_activity
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn idle_for(&self) -> Duration {
        let idle_ms = Utc::now().timestamp_millis() - self.last_activity.load(Ordering::Relaxed);
        Duration::from_millis(idle_ms.max(0) as u64)
    }

    /// A client is attached to a push stream right now
    pub fn has_open_stream(&self) -> bool {
        match &self.adapter {
            SessionAdapter::Sse(_) => true,
            SessionAdapter::Streamable(adapter) => adapter.has_open_stream(),
        }
    }

    fn close(&self) {
        self.cancel.cancel();
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("kind", &self.adapter.kind())
            .field("created_at", &self.created_at)
            .field("state", &self.state())
            .finish()
    }
}

/// Owns every live session. Cheap to clone; clones share the same map.
///
/// Mutations take the write lock, so a lookup racing a removal sees the
/// session either fully present or fully gone.
#[derive(Clone, Default)]
pub struct SessionStore {
    sessions: Arc<RwLock<HashMap<String, Arc<Session>>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a fresh id and register `adapter` under it
    pub async fn create(&self, adapter: SessionAdapter) -> Arc<Session> {
        let mut sessions = self.sessions.write().await;

        let mut id = Uuid::new_v4().to_string();
        while sessions.contains_key(&id) {
            id = Uuid::new_v4().to_string();
        }

        let session = Arc::new(Session::new(id.clone(), adapter));
        sessions.insert(id, session.clone());

        tracing::info!(
            session = %session.id(),
            kind = session.adapter().kind(),
            "Session created ({} open)",
            sessions.len()
        );
        session
    }

    /// Look up a live session and mark it active
    pub async fn get(&self, id: &str) -> Option<Arc<Session>> {
        let session = self.sessions.read().await.get(id).cloned()?;
        if session.state() == SessionState::Closed {
            return None;
        }
        session.touch();
        Some(session)
    }

    /// Remove and close a session. Returns it if it was registered.
    pub async fn remove(&self, id: &str) -> Option<Arc<Session>> {
        let session = self.sessions.write().await.remove(id)?;
        session.close();
        tracing::info!(session = %id, "Session closed");
        Some(session)
    }

    /// Close every session, for shutdown
    pub async fn close_all(&self) {
        let drained: Vec<_> = self.sessions.write().await.drain().collect();
        for (_, session) in &drained {
            session.close();
        }
        if !drained.is_empty() {
            tracing::info!("Closed {} sessions", drained.len());
        }
    }

    /// Close sessions idle longer than `max_idle`. Sessions with an
    /// attached push stream are never idle.
    pub async fn evict_idle(&self, max_idle: Duration) -> usize {
        let mut sessions = self.sessions.write().await;
        let expired: Vec<String> = sessions
            .values()
            .filter(|s| !s.has_open_stream() && s.idle_for() >= max_idle)
            .map(|s| s.id().to_string())
            .collect();

        for id in &expired {
            if let Some(session) = sessions.remove(id) {
                session.close();
                tracing::info!(session = %id, "Session evicted after {:?} idle", session.idle_for());
            }
        }
        expired.len()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}
