//! IPC server.
//!
//! Accepts local-socket connections and serves newline-delimited JSON
//! requests against the cache. One connection may interleave arbitrarily
//! many requests; responses echo the originating id and go back in arrival
//! order. Handlers take no locks beyond the cache's own.

use std::fs;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tokio::task::JoinSet;

use super::state::DaemonState;
use crate::cache::Slot;
use crate::proto::{
    RpcRequest, RpcResponse, ERR_NO_DATA, METHOD_GET_ASSET_CTXS, METHOD_GET_PERP_META,
    METHOD_GET_PRICES, METHOD_GET_STATUS, METHOD_SHUTDOWN,
};

pub struct IpcServer {
    listener: UnixListener,
    state: Arc<DaemonState>,
    shutdown: watch::Sender<bool>,
}

impl IpcServer {
    /// Bind the listening socket, unlinking any stale file first.
    pub fn bind(
        socket_path: &std::path::Path,
        state: Arc<DaemonState>,
        shutdown: watch::Sender<bool>,
    ) -> Result<Self> {
        if socket_path.exists() {
            fs::remove_file(socket_path)
                .with_context(|| format!("remove stale socket {}", socket_path.display()))?;
        }
        let listener = UnixListener::bind(socket_path)
            .with_context(|| format!("bind {}", socket_path.display()))?;
        Ok(Self {
            listener,
            state,
            shutdown,
        })
    }

    /// Serve until the shutdown watch flips (IPC `shutdown` or a signal).
    /// On exit the accept loop has stopped and every connection task has
    /// been torn down; pending peers observe their connection closing.
    pub async fn run(self) {
        let mut shutdown_rx = self.shutdown.subscribe();
        let mut conns: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, _addr)) => {
                            let state = Arc::clone(&self.state);
                            let shutdown = self.shutdown.clone();
                            conns.spawn(handle_conn(stream, state, shutdown));
                        }
                        Err(e) => {
                            tracing::warn!("accept failed: {e}");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
                Some(_finished) = conns.join_next(), if !conns.is_empty() => {}
            }
        }

        conns.shutdown().await;
        tracing::info!("ipc server stopped");
    }
}

async fn handle_conn(
    stream: UnixStream,
    state: Arc<DaemonState>,
    shutdown: watch::Sender<bool>,
) {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        // No id to answer on: malformed frames are dropped, not answered.
        let req: RpcRequest = match serde_json::from_str(&line) {
            Ok(req) => req,
            Err(e) => {
                tracing::debug!("malformed ipc frame dropped: {e}");
                continue;
            }
        };

        let is_shutdown = req.method == METHOD_SHUTDOWN;
        let resp = dispatch(&req, &state);
        let mut out = match serde_json::to_string(&resp) {
            Ok(out) => out,
            Err(e) => {
                tracing::warn!("response encode failed: {e}");
                continue;
            }
        };
        out.push('\n');
        if write_half.write_all(out.as_bytes()).await.is_err() {
            break;
        }

        if is_shutdown {
            let _ = write_half.flush().await;
            let _ = shutdown.send(true);
            break;
        }
    }
}

fn dispatch(req: &RpcRequest, state: &DaemonState) -> RpcResponse {
    match req.method.as_str() {
        METHOD_GET_PRICES => get_prices(req, state),
        METHOD_GET_ASSET_CTXS => cache_read(req, state, Slot::AssetCtxs),
        METHOD_GET_PERP_META => cache_read(req, state, Slot::PerpMetas),
        METHOD_GET_STATUS => RpcResponse::ok(&req.id, state.status_json()),
        METHOD_SHUTDOWN => RpcResponse::ok(&req.id, json!({"ok": true})),
        other => RpcResponse::err(&req.id, format!("Unknown method: {other}")),
    }
}

fn cache_read(req: &RpcRequest, state: &DaemonState, slot: Slot) -> RpcResponse {
    match state.cache.get(slot) {
        Some((payload, cached_at)) => RpcResponse::cached(&req.id, payload, cached_at),
        None => RpcResponse::err(&req.id, ERR_NO_DATA),
    }
}

fn get_prices(req: &RpcRequest, state: &DaemonState) -> RpcResponse {
    let (mids, cached_at) = match state.cache.get(Slot::Mids) {
        Some(slot) => slot,
        None => return RpcResponse::err(&req.id, ERR_NO_DATA),
    };

    let coin = req
        .params
        .get("coin")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|c| !c.is_empty());

    match coin {
        None => RpcResponse::cached(&req.id, mids, cached_at),
        Some(coin) => {
            let entry = mids
                .as_object()
                .and_then(|m| m.iter().find(|(sym, _)| sym.eq_ignore_ascii_case(coin)));
            match entry {
                Some((_, px)) => RpcResponse::cached(
                    &req.id,
                    json!({ coin.to_uppercase(): px }),
                    cached_at,
                ),
                None => RpcResponse::err(
                    &req.id,
                    format!("Coin not found: {}", coin.to_uppercase()),
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Cache;
    use crate::util::now_ms;
    use tokio::sync::watch;

    fn test_state(testnet: bool, connected: bool) -> Arc<DaemonState> {
        // A dropped sender freezes the watch at its last value, which is
        // exactly what these tests want.
        let (_tx, rx) = watch::channel(connected);
        DaemonState::new(now_ms(), testnet, Arc::new(Cache::new()), rx)
    }

    fn req(id: &str, method: &str, params: Value) -> RpcRequest {
        RpcRequest {
            id: id.to_string(),
            method: method.to_string(),
            params,
        }
    }

    #[test]
    fn get_prices_on_empty_cache_is_no_data() {
        let state = test_state(false, false);
        let resp = dispatch(&req("1", METHOD_GET_PRICES, Value::Null), &state);
        assert_eq!(resp.id, "1");
        assert_eq!(resp.error.as_deref(), Some(ERR_NO_DATA));
        assert!(resp.result.is_none());
    }

    #[test]
    fn get_prices_filters_case_insensitively() {
        let state = test_state(false, false);
        state
            .cache
            .put(Slot::Mids, json!({"BTC": "50000", "ETH": "3000"}));

        let resp = dispatch(&req("2", METHOD_GET_PRICES, json!({"coin": "btc"})), &state);
        assert_eq!(resp.result.unwrap(), json!({"BTC": "50000"}));
        assert!(resp.cached_at.is_some());

        let resp = dispatch(
            &req("3", METHOD_GET_PRICES, json!({"coin": "UNKNOWN"})),
            &state,
        );
        assert_eq!(resp.error.as_deref(), Some("Coin not found: UNKNOWN"));
    }

    #[test]
    fn get_status_reflects_state() {
        let state = test_state(true, true);
        state.cache.put(Slot::Mids, json!({"BTC": "50000"}));
        let resp = dispatch(&req("4", METHOD_GET_STATUS, Value::Null), &state);
        let status = resp.result.unwrap();
        assert_eq!(status["running"], true);
        assert_eq!(status["testnet"], true);
        assert_eq!(status["connected"], true);
        assert!(status["uptime"].as_i64().unwrap() >= 0);
        assert_eq!(status["cache"]["hasMids"], true);
        assert_eq!(status["cache"]["hasAssetCtxs"], false);
    }

    #[test]
    fn unknown_method_is_an_error() {
        let state = test_state(false, false);
        let resp = dispatch(&req("5", "frobnicate", Value::Null), &state);
        assert_eq!(resp.error.as_deref(), Some("Unknown method: frobnicate"));
    }

    #[test]
    fn shutdown_acks_before_teardown() {
        let state = test_state(false, false);
        let resp = dispatch(&req("6", METHOD_SHUTDOWN, Value::Null), &state);
        assert_eq!(resp.result.unwrap(), json!({"ok": true}));
    }
}
