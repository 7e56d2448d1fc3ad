//! Shared daemon state, visible to every IPC connection handler.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::watch;

use crate::cache::Cache;
use crate::util::now_ms;

pub struct DaemonState {
    pub started_at: i64,
    pub testnet: bool,
    pub cache: Arc<Cache>,
    /// Observed socket state of the push transport; the transport itself is
    /// owned by the subscription manager, never by IPC handlers.
    pub connected: watch::Receiver<bool>,
}

impl DaemonState {
    pub fn new(
        started_at: i64,
        testnet: bool,
        cache: Arc<Cache>,
        connected: watch::Receiver<bool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            started_at,
            testnet,
            cache,
            connected,
        })
    }

    pub fn connected(&self) -> bool {
        *self.connected.borrow()
    }

    pub fn status_json(&self) -> Value {
        json!({
            "running": true,
            "testnet": self.testnet,
            "connected": self.connected(),
            "startedAt": self.started_at,
            "uptime": (now_ms() - self.started_at).max(0),
            "cache": self.cache.status(),
        })
    }
}
