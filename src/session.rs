//! Debug sessions and the registry that tracks them.
//!
//! A session bundles one dispatcher, its event bus and its memory service.
//! Sessions are independent: each has its own worker and cache and they run
//! in parallel on the tokio runtime.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use uuid::Uuid;

use crate::dispatch::{DispatcherConfig, SessionDispatcher};
use crate::error::DebugError;
use crate::events::EventBus;
use crate::memory::{CacheConfig, ChangeNotification, MemoryService, MemoryTarget};
use crate::shutdown::ShutdownResult;

/// Unique session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-session settings.
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    pub dispatcher: DispatcherConfig,
    pub cache: CacheConfig,
}

/// One debug session.
pub struct Session {
    id: SessionId,
    dispatcher: SessionDispatcher,
    events: Arc<EventBus<ChangeNotification>>,
    memory: MemoryService,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session").field("id", &self.id).field("dispatcher", &self.dispatcher).finish()
    }
}

impl Session {
    /// Start a session against `target` on the ambient tokio runtime.
    pub fn open(target: Arc<dyn MemoryTarget>, config: SessionConfig) -> Self {
        let id = SessionId::new();
        let dispatcher = SessionDispatcher::spawn(config.dispatcher);
        let events = Arc::new(EventBus::new(dispatcher.clone()));
        let memory = MemoryService::new(dispatcher.clone(), Arc::clone(&events), target, config.cache);
        tracing::info!(session = %id, dispatcher = dispatcher.id(), "session: opened");
        Self { id, dispatcher, events, memory }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn dispatcher(&self) -> &SessionDispatcher {
        &self.dispatcher
    }

    pub fn events(&self) -> &Arc<EventBus<ChangeNotification>> {
        &self.events
    }

    pub fn memory(&self) -> &MemoryService {
        &self.memory
    }

    /// Shut the session's dispatcher down with its configured grace period.
    pub async fn close(&self) -> Result<ShutdownResult, DebugError> {
        let result = self.dispatcher.shutdown().await;
        tracing::info!(session = %self.id, ?result, "session: closed");
        result
    }
}

/// Open sessions by id.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a session and register it.
    pub fn open(&self, target: Arc<dyn MemoryTarget>, config: SessionConfig) -> Arc<Session> {
        let session = Arc::new(Session::open(target, config));
        self.sessions.insert(session.id(), Arc::clone(&session));
        session
    }

    pub fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn ids(&self) -> Vec<SessionId> {
        self.sessions.iter().map(|entry| *entry.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Unregister and shut down a session.
    ///
    /// Returns `None` if no session has this id.
    pub async fn close(&self, id: SessionId) -> Option<Result<ShutdownResult, DebugError>> {
        let (_, session) = self.sessions.remove(&id)?;
        Some(session.close().await)
    }

    /// Close every session. Returns how many were closed.
    pub async fn close_all(&self) -> usize {
        let ids = self.ids();
        let mut closed = 0;
        for id in ids {
            if let Some(result) = self.close(id).await {
                if let Err(e) = result {
                    tracing::warn!(session = %id, error = %e, "session: close failed");
                }
                closed += 1;
            }
        }
        closed
    }
}
