//! Downstream client sessions
//!
//! Each `GET /sse` client gets a session: a bounded channel the handler
//! pushes JSON-RPC messages into, drained by that client's SSE stream.

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::protocol::JsonRpcMessage;

/// Per-session outbound queue capacity
const SESSION_QUEUE_CAPACITY: usize = 64;

/// Registry of connected downstream sessions
#[derive(Default)]
pub struct SessionMap {
    sessions: DashMap<String, mpsc::Sender<JsonRpcMessage>>,
}

impl SessionMap {
    /// Create an empty map
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new session, returning its id and the receive side
    #[must_use]
    pub fn create(&self) -> (String, mpsc::Receiver<JsonRpcMessage>) {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel(SESSION_QUEUE_CAPACITY);
        self.sessions.insert(id.clone(), tx);
        debug!(session = %id, "Session opened");
        (id, rx)
    }

    /// Whether a session id is known
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    /// Queue a message for a session; false when the session is gone or
    /// its queue is full
    pub fn push(&self, id: &str, message: JsonRpcMessage) -> bool {
        self.sessions
            .get(id)
            .is_some_and(|tx| tx.try_send(message).is_ok())
    }

    /// Drop a session
    pub fn remove(&self, id: &str) {
        if self.sessions.remove(id).is_some() {
            debug!(session = %id, "Session closed");
        }
    }

    /// Connected session count
    #[must_use]
    pub fn count(&self) -> usize {
        self.sessions.len()
    }
}
