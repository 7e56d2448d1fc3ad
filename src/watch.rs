//! Live-view watchers.
//!
//! A watcher fuses a push subscription (or cached polling) with occasional
//! HTTP pulls and emits normalized updates on an unbounded event channel,
//! so delivery from the transport context never blocks and the consumer
//! serializes. Lifecycle is `new -> started -> stopped`: `stop` is safe to
//! call at any time, any number of times, and never raises; a stopped
//! watcher cannot be restarted.

use std::time::Duration;

use anyhow::{bail, Result};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::client::IpcClient;
use crate::paths::HlPaths;
use crate::transport::info::InfoClient;
use crate::transport::ws::{SubHandle, Subscription, WsTransport};
use crate::transport::Network;

pub const PRICE_POLL_MS: u64 = 500;
const READY_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone)]
pub enum WatchEvent {
    Update(Value),
    Error(String),
}

pub type WatchSink = mpsc::UnboundedSender<WatchEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    New,
    Started,
    Stopped,
}

/// Owned resources of a running watcher, released in a fixed order:
/// unsubscribe first, then close the transport, then drop the tasks. Every
/// step is fire-and-forget so a single failure cannot leak the rest.
#[derive(Default)]
struct Teardown {
    handles: Vec<SubHandle>,
    transport: Option<WsTransport>,
    tasks: Vec<JoinHandle<()>>,
}

impl Teardown {
    fn stop(&mut self) {
        for handle in self.handles.drain(..).rev() {
            handle.unsubscribe();
        }
        if let Some(transport) = self.transport.take() {
            transport.close();
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

/// Single-coin mid price. Polls the daemon cache every 500 ms when the
/// daemon is up, otherwise subscribes to the mids feed directly. Exactly one
/// mode is active; switching requires stop + a new watcher.
pub struct PriceWatcher {
    coin: String,
    network: Network,
    paths: HlPaths,
    sink: WatchSink,
    phase: Phase,
    teardown: Teardown,
}

impl PriceWatcher {
    pub fn new(coin: &str, network: Network, paths: HlPaths, sink: WatchSink) -> Self {
        Self {
            coin: coin.trim().to_string(),
            network,
            paths,
            sink,
            phase: Phase::New,
            teardown: Teardown::default(),
        }
    }

    pub async fn start(&mut self) -> Result<()> {
        ensure_new(&mut self.phase)?;

        if IpcClient::server_running(&self.paths) {
            let coin = self.coin.clone();
            let paths = self.paths.clone();
            let sink = self.sink.clone();
            self.teardown.tasks.push(tokio::spawn(async move {
                let mut client: Option<IpcClient> = None;
                let mut tick =
                    tokio::time::interval(Duration::from_millis(PRICE_POLL_MS));
                loop {
                    tick.tick().await;
                    if client.is_none() {
                        client = IpcClient::try_connect(&paths).await;
                        if client.is_none() {
                            let _ = sink.send(WatchEvent::Error(
                                "daemon unavailable".to_string(),
                            ));
                            continue;
                        }
                    }
                    if let Some(c) = client.as_ref() {
                        match c.get_prices(Some(coin.as_str())).await {
                            Ok((entry, _)) => {
                                let _ = sink.send(WatchEvent::Update(entry));
                            }
                            Err(e) => {
                                let _ = sink.send(WatchEvent::Error(e.to_string()));
                                // Reconnect on the next tick.
                                client = None;
                            }
                        }
                    }
                }
            }));
        } else {
            let transport = WsTransport::connect(self.network);
            transport.wait_ready(READY_TIMEOUT).await?;
            let (handle, mut rx) = transport.subscribe(Subscription::AllMids);
            let coin = self.coin.clone();
            let sink = self.sink.clone();
            self.teardown.tasks.push(tokio::spawn(async move {
                while let Some(data) = rx.recv().await {
                    if let Some(entry) = mids_entry(&data, &coin) {
                        let _ = sink.send(WatchEvent::Update(entry));
                    }
                }
            }));
            self.teardown.handles.push(handle);
            self.teardown.transport = Some(transport);
        }
        Ok(())
    }

    pub fn stop(&mut self) {
        if self.phase == Phase::Stopped {
            return;
        }
        self.phase = Phase::Stopped;
        self.teardown.stop();
    }
}

/// L2 order book for one symbol, normalized to `{bids, asks, time}`.
pub struct BookWatcher {
    coin: String,
    network: Network,
    sink: WatchSink,
    phase: Phase,
    teardown: Teardown,
}

impl BookWatcher {
    pub fn new(coin: &str, network: Network, sink: WatchSink) -> Self {
        Self {
            coin: coin.trim().to_string(),
            network,
            sink,
            phase: Phase::New,
            teardown: Teardown::default(),
        }
    }

    pub async fn start(&mut self) -> Result<()> {
        ensure_new(&mut self.phase)?;

        let transport = WsTransport::connect(self.network);
        transport.wait_ready(READY_TIMEOUT).await?;
        let (handle, mut rx) = transport.subscribe(Subscription::L2Book {
            coin: self.coin.to_uppercase(),
        });
        let sink = self.sink.clone();
        self.teardown.tasks.push(tokio::spawn(async move {
            while let Some(data) = rx.recv().await {
                let _ = sink.send(WatchEvent::Update(normalize_l2_book(&data)));
            }
        }));
        self.teardown.handles.push(handle);
        self.teardown.transport = Some(transport);
        Ok(())
    }

    pub fn stop(&mut self) {
        if self.phase == Phase::Stopped {
            return;
        }
        self.phase = Phase::Stopped;
        self.teardown.stop();
    }
}

/// Raw clearinghouse state for an address, forwarded as delivered.
pub struct PositionWatcher {
    user: String,
    network: Network,
    sink: WatchSink,
    phase: Phase,
    teardown: Teardown,
}

impl PositionWatcher {
    pub fn new(user: &str, network: Network, sink: WatchSink) -> Self {
        Self {
            user: user.trim().to_lowercase(),
            network,
            sink,
            phase: Phase::New,
            teardown: Teardown::default(),
        }
    }

    pub async fn start(&mut self) -> Result<()> {
        ensure_new(&mut self.phase)?;

        let transport = WsTransport::connect(self.network);
        transport.wait_ready(READY_TIMEOUT).await?;
        let (handle, mut rx) =
            transport.subscribe(Subscription::AllDexsClearinghouseState {
                user: self.user.clone(),
            });
        let sink = self.sink.clone();
        self.teardown.tasks.push(tokio::spawn(async move {
            while let Some(data) = rx.recv().await {
                let _ = sink.send(WatchEvent::Update(data));
            }
        }));
        self.teardown.handles.push(handle);
        self.teardown.transport = Some(transport);
        Ok(())
    }

    pub fn stop(&mut self) {
        if self.phase == Phase::Stopped {
            return;
        }
        self.phase = Phase::Stopped;
        self.teardown.stop();
    }
}

/// Open orders for an address. The push feed only announces deltas, so
/// every event triggers an unconditional `openOrders` pull and the pulled
/// list is what gets emitted; one pull at start seeds the initial snapshot.
/// Rapid pushes may coalesce into a single emitted snapshot.
pub struct OrdersWatcher {
    user: String,
    network: Network,
    sink: WatchSink,
    phase: Phase,
    teardown: Teardown,
}

impl OrdersWatcher {
    pub fn new(user: &str, network: Network, sink: WatchSink) -> Self {
        Self {
            user: user.trim().to_lowercase(),
            network,
            sink,
            phase: Phase::New,
            teardown: Teardown::default(),
        }
    }

    pub async fn start(&mut self) -> Result<()> {
        ensure_new(&mut self.phase)?;

        let info = InfoClient::new(self.network);
        let transport = WsTransport::connect(self.network);
        transport.wait_ready(READY_TIMEOUT).await?;
        let (handle, mut rx) = transport.subscribe(Subscription::OrderUpdates {
            user: self.user.clone(),
        });

        let sink = self.sink.clone();
        let user = self.user.clone();
        self.teardown.tasks.push(tokio::spawn(async move {
            // Initial snapshot before the first push arrives.
            pull_open_orders(&info, &user, &sink).await;
            while let Some(_delta) = rx.recv().await {
                // The pull is authoritative; the delta is only a trigger.
                pull_open_orders(&info, &user, &sink).await;
            }
        }));
        self.teardown.handles.push(handle);
        self.teardown.transport = Some(transport);
        Ok(())
    }

    pub fn stop(&mut self) {
        if self.phase == Phase::Stopped {
            return;
        }
        self.phase = Phase::Stopped;
        self.teardown.stop();
    }
}

async fn pull_open_orders(info: &InfoClient, user: &str, sink: &WatchSink) {
    match info.open_orders(user).await {
        Ok(orders) => {
            let _ = sink.send(WatchEvent::Update(orders));
        }
        // Pull failures surface to the consumer but never tear down the
        // subscription.
        Err(e) => {
            let _ = sink.send(WatchEvent::Error(e.to_string()));
        }
    }
}

/// Merged perp + spot balances for an address. Each clearinghouse push also
/// pulls the spot state; when the spot pull fails the previous spot snapshot
/// rides along so the merged update still goes out.
pub struct BalanceWatcher {
    user: String,
    network: Network,
    sink: WatchSink,
    phase: Phase,
    teardown: Teardown,
}

impl BalanceWatcher {
    pub fn new(user: &str, network: Network, sink: WatchSink) -> Self {
        Self {
            user: user.trim().to_lowercase(),
            network,
            sink,
            phase: Phase::New,
            teardown: Teardown::default(),
        }
    }

    pub async fn start(&mut self) -> Result<()> {
        ensure_new(&mut self.phase)?;

        let info = InfoClient::new(self.network);
        let transport = WsTransport::connect(self.network);
        transport.wait_ready(READY_TIMEOUT).await?;
        let (handle, mut rx) =
            transport.subscribe(Subscription::AllDexsClearinghouseState {
                user: self.user.clone(),
            });

        let sink = self.sink.clone();
        let user = self.user.clone();
        self.teardown.tasks.push(tokio::spawn(async move {
            let mut last_spot: Option<Value> = None;
            while let Some(perp) = rx.recv().await {
                match info.spot_clearinghouse_state(&user).await {
                    Ok(spot) => last_spot = Some(spot),
                    Err(e) => {
                        tracing::debug!("spot state pull failed, reusing last: {e}")
                    }
                }
                let _ = sink.send(WatchEvent::Update(merge_balance(
                    &perp,
                    last_spot.as_ref(),
                )));
            }
        }));
        self.teardown.handles.push(handle);
        self.teardown.transport = Some(transport);
        Ok(())
    }

    pub fn stop(&mut self) {
        if self.phase == Phase::Stopped {
            return;
        }
        self.phase = Phase::Stopped;
        self.teardown.stop();
    }
}

fn ensure_new(phase: &mut Phase) -> Result<()> {
    match *phase {
        Phase::New => {
            *phase = Phase::Started;
            Ok(())
        }
        Phase::Started => bail!("watcher already started"),
        Phase::Stopped => bail!("a stopped watcher cannot be restarted"),
    }
}

/// Pick one coin's entry out of a mids event, keyed by upper-cased symbol.
fn mids_entry(data: &Value, coin: &str) -> Option<Value> {
    let mids = data.get("mids").and_then(Value::as_object)?;
    let (_, px) = mids.iter().find(|(sym, _)| sym.eq_ignore_ascii_case(coin))?;
    Some(json!({ coin.to_uppercase(): px }))
}

/// Flatten the upstream two-level array into named sides.
fn normalize_l2_book(data: &Value) -> Value {
    let levels = data.get("levels").and_then(Value::as_array);
    let side = |idx: usize| -> Value {
        levels
            .and_then(|l| l.get(idx))
            .cloned()
            .unwrap_or_else(|| json!([]))
    };
    json!({
        "bids": side(0),
        "asks": side(1),
        "time": data.get("time").cloned().unwrap_or(Value::Null),
    })
}

fn merge_balance(perp: &Value, spot: Option<&Value>) -> Value {
    json!({
        "perp": perp,
        "spot": spot.cloned().unwrap_or(Value::Null),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mids_entry_is_case_insensitive_and_upper_keyed() {
        let data = json!({"mids": {"BTC": "50000", "ETH": "3000"}});
        assert_eq!(mids_entry(&data, "btc").unwrap(), json!({"BTC": "50000"}));
        assert!(mids_entry(&data, "DOGE").is_none());
        assert!(mids_entry(&json!({}), "BTC").is_none());
    }

    #[test]
    fn l2_book_normalization() {
        let data = json!({
            "coin": "BTC",
            "time": 1700000000000i64,
            "levels": [
                [{"px": "49999", "sz": "1.5", "n": 3}],
                [{"px": "50001", "sz": "0.7", "n": 2}]
            ]
        });
        let book = normalize_l2_book(&data);
        assert_eq!(book["bids"][0]["px"], "49999");
        assert_eq!(book["asks"][0]["px"], "50001");
        assert_eq!(book["time"], 1700000000000i64);

        // Missing sides degrade to empty arrays, not panics.
        let empty = normalize_l2_book(&json!({"coin": "BTC"}));
        assert_eq!(empty["bids"], json!([]));
        assert_eq!(empty["asks"], json!([]));
        assert_eq!(empty["time"], Value::Null);
    }

    #[test]
    fn balance_merge_retains_last_spot() {
        let perp = json!({"marginSummary": {"accountValue": "1000"}});
        let merged = merge_balance(&perp, None);
        assert_eq!(merged["spot"], Value::Null);

        let spot = json!({"balances": [{"coin": "USDC", "total": "250"}]});
        let merged = merge_balance(&perp, Some(&spot));
        assert_eq!(merged["spot"]["balances"][0]["coin"], "USDC");
        assert_eq!(merged["perp"]["marginSummary"]["accountValue"], "1000");
    }

    #[tokio::test]
    async fn stop_is_idempotent_at_any_phase() {
        let (sink, _rx) = mpsc::unbounded_channel();
        let paths = HlPaths::in_dir("/nonexistent/.hl");
        let mut watcher = PriceWatcher::new("BTC", Network::Mainnet, paths, sink);

        // stop before start is a no-op.
        watcher.stop();
        watcher.stop();

        let (sink, _rx) = mpsc::unbounded_channel();
        let mut book = BookWatcher::new("BTC", Network::Mainnet, sink);
        book.stop();
        book.stop();
    }

    #[tokio::test]
    async fn stopped_watcher_cannot_restart() {
        let (sink, _rx) = mpsc::unbounded_channel();
        let mut book = BookWatcher::new("BTC", Network::Mainnet, sink);
        book.stop();
        assert!(book.start().await.is_err());
    }
}
