//! IPC client for the daemon socket.
//!
//! Requests are multiplexed on one connection: each carries a fresh id and
//! parks a oneshot in the pending map; a background reader drains frames and
//! completes them by id. A closed connection rejects everything pending with
//! `"Connection closed"`, and a request outstanding for more than five
//! seconds fails with `"Request timeout"`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::paths::HlPaths;
use crate::proto::{
    RpcRequest, RpcResponse, ERR_CONNECTION_CLOSED, ERR_REQUEST_TIMEOUT, METHOD_GET_ASSET_CTXS,
    METHOD_GET_PERP_META, METHOD_GET_PRICES, METHOD_GET_STATUS, METHOD_SHUTDOWN,
};

pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

type Pending = Arc<Mutex<HashMap<String, oneshot::Sender<RpcResponse>>>>;

pub struct IpcClient {
    writer: tokio::sync::Mutex<tokio::net::unix::OwnedWriteHalf>,
    pending: Pending,
    closed: Arc<AtomicBool>,
    next_id: AtomicU64,
    reader: JoinHandle<()>,
}

impl IpcClient {
    pub async fn connect(paths: &HlPaths) -> Result<Self> {
        let stream = UnixStream::connect(&paths.socket)
            .await
            .map_err(|e| anyhow!("daemon connect failed: {e}"))?;
        let (read_half, write_half) = stream.into_split();

        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        let reader = {
            let pending = Arc::clone(&pending);
            let closed = Arc::clone(&closed);
            tokio::spawn(async move {
                let mut lines = BufReader::new(read_half).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let resp: RpcResponse = match serde_json::from_str(&line) {
                        Ok(r) => r,
                        Err(e) => {
                            tracing::debug!("unparseable daemon frame dropped: {e}");
                            continue;
                        }
                    };
                    if let Some(tx) = pending.lock().unwrap().remove(&resp.id) {
                        let _ = tx.send(resp);
                    }
                }
                closed.store(true, Ordering::SeqCst);
                // Dropping the senders rejects every pending request.
                pending.lock().unwrap().clear();
            })
        };

        Ok(Self {
            writer: tokio::sync::Mutex::new(write_half),
            pending,
            closed,
            next_id: AtomicU64::new(1),
            reader,
        })
    }

    /// `true` when the daemon socket file exists. A pure filesystem probe:
    /// the fast-path check before attempting a connection.
    pub fn server_running(paths: &HlPaths) -> bool {
        paths.socket.exists()
    }

    /// Connect, or `None` when the daemon is absent or refusing.
    pub async fn try_connect(paths: &HlPaths) -> Option<Self> {
        if !Self::server_running(paths) {
            return None;
        }
        Self::connect(paths).await.ok()
    }

    /// One round-trip. Returns the unwrapped result with its cache stamp, or
    /// the server's error string as the error.
    pub async fn request(&self, method: &str, params: Value) -> Result<(Value, Option<i64>)> {
        if self.closed.load(Ordering::SeqCst) {
            bail!("{ERR_CONNECTION_CLOSED}");
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed).to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(id.clone(), tx);

        let req = RpcRequest {
            id: id.clone(),
            method: method.to_string(),
            params,
        };
        let mut line = serde_json::to_string(&req)?;
        line.push('\n');

        {
            let mut writer = self.writer.lock().await;
            if writer.write_all(line.as_bytes()).await.is_err()
                || writer.flush().await.is_err()
            {
                self.pending.lock().unwrap().remove(&id);
                bail!("{ERR_CONNECTION_CLOSED}");
            }
        }

        let resp = match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Err(_elapsed) => {
                self.pending.lock().unwrap().remove(&id);
                bail!("{ERR_REQUEST_TIMEOUT}");
            }
            Ok(Err(_dropped)) => bail!("{ERR_CONNECTION_CLOSED}"),
            Ok(Ok(resp)) => resp,
        };

        if let Some(err) = resp.error {
            bail!(err);
        }
        Ok((resp.result.unwrap_or(Value::Null), resp.cached_at))
    }

    pub async fn get_prices(&self, coin: Option<&str>) -> Result<(Value, Option<i64>)> {
        let params = match coin {
            Some(c) => json!({"coin": c}),
            None => Value::Null,
        };
        self.request(METHOD_GET_PRICES, params).await
    }

    pub async fn get_asset_ctxs(&self) -> Result<(Value, Option<i64>)> {
        self.request(METHOD_GET_ASSET_CTXS, Value::Null).await
    }

    pub async fn get_perp_meta(&self) -> Result<(Value, Option<i64>)> {
        self.request(METHOD_GET_PERP_META, Value::Null).await
    }

    pub async fn get_status(&self) -> Result<Value> {
        let (result, _) = self.request(METHOD_GET_STATUS, Value::Null).await?;
        Ok(result)
    }

    pub async fn shutdown(&self) -> Result<Value> {
        let (result, _) = self.request(METHOD_SHUTDOWN, Value::Null).await?;
        Ok(result)
    }
}

impl Drop for IpcClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
