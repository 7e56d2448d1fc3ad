//! Subscription manager.
//!
//! Sole owner of the push transport. Routes the two market-wide feeds into
//! their cache slots and keeps the slow-moving perp metadata fresh over
//! HTTP. Handler faults stay inside the per-feed router tasks; nothing here
//! can propagate back into the transport and kill a subscription.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::cache::{Cache, Slot};
use crate::transport::info::InfoClient;
use crate::transport::ws::{SubHandle, Subscription, WsTransport};

pub const PERP_META_REFRESH_SECS: u64 = 60;
const READY_TIMEOUT: Duration = Duration::from_secs(15);

pub struct SubscriptionManager {
    transport: WsTransport,
    info: InfoClient,
    cache: Arc<Cache>,
    handles: Vec<SubHandle>,
    tasks: Vec<JoinHandle<()>>,
    stopped: bool,
}

impl SubscriptionManager {
    pub fn new(transport: WsTransport, info: InfoClient, cache: Arc<Cache>) -> Self {
        Self {
            transport,
            info,
            cache,
            handles: Vec::new(),
            tasks: Vec::new(),
            stopped: false,
        }
    }

    pub fn connected(&self) -> bool {
        self.transport.connected()
    }

    /// Wait for the transport, establish the push feeds, seed perp metadata
    /// and schedule its periodic refresh.
    pub async fn start(&mut self) -> Result<()> {
        self.transport
            .wait_ready(READY_TIMEOUT)
            .await
            .context("push transport never became ready")?;

        let (handle, mut rx) = self.transport.subscribe(Subscription::AllMids);
        self.handles.push(handle);
        let cache = Arc::clone(&self.cache);
        self.tasks.push(tokio::spawn(async move {
            while let Some(data) = rx.recv().await {
                apply_mids(&cache, &data);
            }
        }));

        let (handle, mut rx) = self.transport.subscribe(Subscription::AllDexsAssetCtxs);
        self.handles.push(handle);
        let cache = Arc::clone(&self.cache);
        self.tasks.push(tokio::spawn(async move {
            while let Some(data) = rx.recv().await {
                cache.put(Slot::AssetCtxs, data);
            }
        }));

        // Seed perp metadata now; a failure here only delays the slot until
        // the first successful refresh tick.
        match self.info.all_perp_metas().await {
            Ok(metas) => self.cache.put(Slot::PerpMetas, metas),
            Err(e) => tracing::warn!("initial perp meta fetch failed: {e}"),
        }

        let info = self.info.clone();
        let cache = Arc::clone(&self.cache);
        self.tasks.push(tokio::spawn(async move {
            let mut tick =
                tokio::time::interval(Duration::from_secs(PERP_META_REFRESH_SECS));
            tick.tick().await; // arm
            loop {
                tick.tick().await;
                match info.all_perp_metas().await {
                    Ok(metas) => cache.put(Slot::PerpMetas, metas),
                    Err(e) => tracing::warn!("perp meta refresh failed: {e}"),
                }
            }
        }));

        Ok(())
    }

    /// Idempotent, bounded teardown: cancel the timer and routers, then
    /// unsubscribe in reverse order (fire-and-forget), then close the
    /// transport. No upstream error can block progress here.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;

        for task in self.tasks.drain(..) {
            task.abort();
        }
        for handle in self.handles.drain(..).rev() {
            handle.unsubscribe();
        }
        self.transport.close();
    }
}

/// Merge one mids event into the slot. Events may be scoped to a single dex
/// and carry partial maps; the slot always holds the complete latest mapping
/// and is replaced atomically.
fn apply_mids(cache: &Cache, data: &Value) {
    let incoming = match data.get("mids").and_then(Value::as_object) {
        Some(m) => m,
        None => {
            tracing::debug!("mids event without a mids map dropped");
            return;
        }
    };
    let mut merged = cache
        .get(Slot::Mids)
        .and_then(|(v, _)| v.as_object().cloned())
        .unwrap_or_default();
    for (sym, px) in incoming {
        merged.insert(sym.clone(), px.clone());
    }
    cache.put(Slot::Mids, Value::Object(merged));
}
