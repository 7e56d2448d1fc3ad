//! Reconnecting push transport.
//!
//! A single background task owns the WebSocket connection. Subscribers
//! register through a command channel and receive events on an unbounded
//! per-subscription channel, so a slow or faulty consumer can never stall
//! the socket reader. On reconnect the task replays every active
//! subscription before resuming reads.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;

use super::Network;

const RECONNECT_SECS: u64 = 5;
const PING_SECS: u64 = 50;

/// Logical push feeds offered by the upstream exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subscription {
    AllMids,
    AllDexsAssetCtxs,
    L2Book { coin: String },
    AllDexsClearinghouseState { user: String },
    OrderUpdates { user: String },
    ActiveAssetData { user: String, coin: String },
}

impl Subscription {
    pub fn to_subscription_json(&self) -> Value {
        match self {
            Self::AllMids => json!({"type": "allMids"}),
            Self::AllDexsAssetCtxs => json!({"type": "allDexsAssetCtxs"}),
            Self::L2Book { coin } => json!({"type": "l2Book", "coin": coin}),
            Self::AllDexsClearinghouseState { user } => {
                json!({"type": "allDexsClearinghouseState", "user": user})
            }
            Self::OrderUpdates { user } => json!({"type": "orderUpdates", "user": user}),
            Self::ActiveAssetData { user, coin } => {
                json!({"type": "activeAssetData", "user": user, "coin": coin})
            }
        }
    }

    fn channel(&self) -> &'static str {
        match self {
            Self::AllMids => "allMids",
            Self::AllDexsAssetCtxs => "allDexsAssetCtxs",
            Self::L2Book { .. } => "l2Book",
            Self::AllDexsClearinghouseState { .. } => "allDexsClearinghouseState",
            Self::OrderUpdates { .. } => "orderUpdates",
            Self::ActiveAssetData { .. } => "activeAssetData",
        }
    }

    /// Whether an inbound event on `channel` with payload `data` belongs to
    /// this subscription. Keyed feeds additionally match on their key.
    fn matches(&self, channel: &str, data: &Value) -> bool {
        if channel != self.channel() {
            return false;
        }
        match self {
            Self::L2Book { coin } | Self::ActiveAssetData { coin, .. } => data
                .get("coin")
                .and_then(Value::as_str)
                .map(|c| c.eq_ignore_ascii_case(coin))
                .unwrap_or(true),
            _ => true,
        }
    }
}

enum Cmd {
    Subscribe {
        id: u64,
        sub: Subscription,
        tx: mpsc::UnboundedSender<Value>,
    },
    Unsubscribe {
        id: u64,
    },
    Close,
}

/// Cancellation token for one subscription. Unsubscribing is fire-and-forget
/// and never blocks; errors on a dead transport are swallowed.
pub struct SubHandle {
    id: u64,
    cmd_tx: mpsc::UnboundedSender<Cmd>,
}

impl SubHandle {
    pub fn unsubscribe(&self) {
        let _ = self.cmd_tx.send(Cmd::Unsubscribe { id: self.id });
    }
}

/// Handle to the connection task. Cheap to clone; `close` tears down the
/// task and every registered subscription.
#[derive(Clone)]
pub struct WsTransport {
    cmd_tx: mpsc::UnboundedSender<Cmd>,
    connected_rx: watch::Receiver<bool>,
    next_sub_id: std::sync::Arc<std::sync::atomic::AtomicU64>,
}

impl WsTransport {
    /// Spawn the connection task in reconnecting mode. The task retries
    /// until `close` is called; readiness is observed via `wait_ready`.
    pub fn connect(network: Network) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (connected_tx, connected_rx) = watch::channel(false);
        let url = network.ws_url().to_string();
        tokio::spawn(run(url, cmd_rx, connected_tx));
        Self {
            cmd_tx,
            connected_rx,
            next_sub_id: std::sync::Arc::new(std::sync::atomic::AtomicU64::new(1)),
        }
    }

    /// Whether the underlying socket is currently open.
    pub fn connected(&self) -> bool {
        *self.connected_rx.borrow()
    }

    /// A watch on the socket state, for observers that outlive this handle.
    pub fn connected_watch(&self) -> watch::Receiver<bool> {
        self.connected_rx.clone()
    }

    /// Wait until the socket reports open, or fail after `timeout`.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.connected_rx.clone();
        tokio::time::timeout(timeout, rx.wait_for(|c| *c))
            .await
            .context("timed out waiting for the push transport")?
            .context("push transport task exited")?;
        Ok(())
    }

    /// Register a subscription; events arrive on the returned receiver.
    pub fn subscribe(&self, sub: Subscription) -> (SubHandle, mpsc::UnboundedReceiver<Value>) {
        let id = self
            .next_sub_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = self.cmd_tx.send(Cmd::Subscribe { id, sub, tx });
        (
            SubHandle {
                id,
                cmd_tx: self.cmd_tx.clone(),
            },
            rx,
        )
    }

    /// Stop reconnecting and drop the connection. Idempotent.
    pub fn close(&self) {
        let _ = self.cmd_tx.send(Cmd::Close);
    }
}

async fn run(
    url: String,
    mut cmd_rx: mpsc::UnboundedReceiver<Cmd>,
    connected_tx: watch::Sender<bool>,
) {
    let mut registry: HashMap<u64, (Subscription, mpsc::UnboundedSender<Value>)> = HashMap::new();
    let mut attempt: u64 = 0;

    'reconnect: loop {
        attempt = attempt.wrapping_add(1);
        tracing::debug!(attempt, %url, "ws connect");

        let req = match url.as_str().into_client_request() {
            Ok(mut req) => {
                // Match the browser Origin to avoid edge-proxy quirks.
                req.headers_mut().insert(
                    "Origin",
                    HeaderValue::from_static("https://app.hyperliquid.xyz"),
                );
                req
            }
            Err(e) => {
                tracing::error!("bad ws url: {e}");
                return;
            }
        };

        let ws_stream = match tokio_tungstenite::connect_async(req).await {
            Ok((stream, _resp)) => stream,
            Err(e) => {
                tracing::warn!(attempt, "ws connect failed: {e}");
                if wait_before_reconnect(&mut cmd_rx, &mut registry).await {
                    break 'reconnect;
                }
                continue;
            }
        };

        tracing::info!(attempt, "ws connected");
        let _ = connected_tx.send(true);

        let (mut write, mut read) = ws_stream.split();

        // Replay the active set on every (re)connect.
        let replay: Vec<Subscription> = registry.values().map(|(s, _)| s.clone()).collect();
        let mut replay_failed = false;
        for sub in &replay {
            if send_subscribe(&mut write, sub).await.is_err() {
                replay_failed = true;
                break;
            }
        }
        if replay_failed {
            let _ = connected_tx.send(false);
            if wait_before_reconnect(&mut cmd_rx, &mut registry).await {
                break 'reconnect;
            }
            continue 'reconnect;
        }

        let mut ping = tokio::time::interval(Duration::from_secs(PING_SECS));
        ping.tick().await; // arm

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(txt))) => route(txt.as_str(), &mut registry),
                        Some(Ok(Message::Ping(payload))) => {
                            let _ = write.send(Message::Pong(payload)).await;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            tracing::warn!("ws close: {frame:?}");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            tracing::warn!("ws read error: {e}");
                            break;
                        }
                        None => break,
                    }
                }
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(Cmd::Subscribe { id, sub, tx }) => {
                            let send_res = send_subscribe(&mut write, &sub).await;
                            registry.insert(id, (sub, tx));
                            if send_res.is_err() {
                                break;
                            }
                        }
                        Some(Cmd::Unsubscribe { id }) => {
                            if let Some((sub, _)) = registry.remove(&id) {
                                let frame = json!({
                                    "method": "unsubscribe",
                                    "subscription": sub.to_subscription_json(),
                                });
                                let _ = write.send(Message::Text(frame.to_string().into())).await;
                            }
                        }
                        Some(Cmd::Close) | None => break 'reconnect,
                    }
                }
                _ = ping.tick() => {
                    let frame = json!({"method": "ping"});
                    if write.send(Message::Text(frame.to_string().into())).await.is_err() {
                        break;
                    }
                }
            }
        }

        let _ = connected_tx.send(false);
        if wait_before_reconnect(&mut cmd_rx, &mut registry).await {
            break 'reconnect;
        }
    }

    let _ = connected_tx.send(false);
}

/// Sleep the reconnect delay while still honoring commands. Returns true
/// when the transport was closed.
async fn wait_before_reconnect(
    cmd_rx: &mut mpsc::UnboundedReceiver<Cmd>,
    registry: &mut HashMap<u64, (Subscription, mpsc::UnboundedSender<Value>)>,
) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(RECONNECT_SECS);
    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => return false,
            cmd = cmd_rx.recv() => {
                match cmd {
                    // Registered while disconnected; the subscribe frame goes
                    // out with the replay on the next successful connect.
                    Some(Cmd::Subscribe { id, sub, tx }) => {
                        registry.insert(id, (sub, tx));
                    }
                    Some(Cmd::Unsubscribe { id }) => {
                        registry.remove(&id);
                    }
                    Some(Cmd::Close) | None => return true,
                }
            }
        }
    }
}

async fn send_subscribe<S>(write: &mut S, sub: &Subscription) -> Result<()>
where
    S: SinkExt<Message> + Unpin,
    <S as futures_util::Sink<Message>>::Error: std::fmt::Display,
{
    let frame = json!({
        "method": "subscribe",
        "subscription": sub.to_subscription_json(),
    });
    write
        .send(Message::Text(frame.to_string().into()))
        .await
        .map_err(|e| anyhow::anyhow!("ws subscribe send failed: {e}"))
}

/// Dispatch one inbound frame to every matching subscription. Delivery is a
/// non-blocking channel send; subscriptions whose receiver is gone are
/// pruned here rather than on unsubscribe races.
fn route(
    txt: &str,
    registry: &mut HashMap<u64, (Subscription, mpsc::UnboundedSender<Value>)>,
) {
    let v: Value = match serde_json::from_str(txt) {
        Ok(v) => v,
        Err(e) => {
            tracing::debug!("ws json parse failed: {e}");
            return;
        }
    };
    let channel = v.get("channel").and_then(Value::as_str).unwrap_or("");
    if channel.is_empty() || channel == "subscriptionResponse" || channel == "pong" {
        return;
    }
    let data = match v.get("data") {
        Some(d) => d,
        None => return,
    };

    let mut dead: Vec<u64> = Vec::new();
    for (id, (sub, tx)) in registry.iter() {
        if sub.matches(channel, data) && tx.send(data.clone()).is_err() {
            dead.push(*id);
        }
    }
    for id in dead {
        registry.remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscription_json_shapes() {
        assert_eq!(
            Subscription::AllMids.to_subscription_json(),
            json!({"type": "allMids"})
        );
        assert_eq!(
            Subscription::L2Book { coin: "BTC".into() }.to_subscription_json(),
            json!({"type": "l2Book", "coin": "BTC"})
        );
        assert_eq!(
            Subscription::OrderUpdates { user: "0xabc".into() }.to_subscription_json(),
            json!({"type": "orderUpdates", "user": "0xabc"})
        );
    }

    #[test]
    fn matching_is_channel_and_key_scoped() {
        let mids = Subscription::AllMids;
        assert!(mids.matches("allMids", &json!({"mids": {}})));
        assert!(!mids.matches("l2Book", &json!({"coin": "BTC"})));

        let book = Subscription::L2Book { coin: "BTC".into() };
        assert!(book.matches("l2Book", &json!({"coin": "BTC"})));
        assert!(book.matches("l2Book", &json!({"coin": "btc"})));
        assert!(!book.matches("l2Book", &json!({"coin": "ETH"})));
        // A frame without the key is delivered rather than dropped.
        assert!(book.matches("l2Book", &json!({"levels": []})));
    }

    #[test]
    fn route_prunes_dead_receivers() {
        let mut registry = HashMap::new();
        let (tx, rx) = mpsc::unbounded_channel();
        registry.insert(1, (Subscription::AllMids, tx));
        drop(rx);
        route(
            r#"{"channel":"allMids","data":{"mids":{"BTC":"50000"}}}"#,
            &mut registry,
        );
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn events_reach_matching_subscribers() {
        let mut registry = HashMap::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.insert(1, (Subscription::AllMids, tx));
        let (book_tx, mut book_rx) = mpsc::unbounded_channel();
        registry.insert(2, (Subscription::L2Book { coin: "ETH".into() }, book_tx));

        route(
            r#"{"channel":"allMids","data":{"mids":{"BTC":"50000"}}}"#,
            &mut registry,
        );
        let data = rx.recv().await.unwrap();
        assert_eq!(data["mids"]["BTC"], "50000");
        assert!(book_rx.try_recv().is_err());
    }
}
