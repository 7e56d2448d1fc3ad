//! Daemon-first reads with direct-upstream fallback.
//!
//! Each read makes exactly one daemon attempt and, on any failure, at most
//! one direct HTTP call. There is no retry loop: a degraded daemon must not
//! inflate a CLI invocation by multi-second retries. Writes never pass
//! through here.

use anyhow::{bail, Result};
use serde_json::{json, Value};

use crate::client::IpcClient;
use crate::paths::HlPaths;
use crate::transport::info::InfoClient;
use crate::transport::Network;

/// A read result, with the daemon's cache stamp when it served the data.
#[derive(Debug, Clone)]
pub struct Fetched {
    pub value: Value,
    pub cached_at: Option<i64>,
}

impl Fetched {
    fn direct(value: Value) -> Self {
        Self {
            value,
            cached_at: None,
        }
    }
}

pub struct MarketReader {
    paths: HlPaths,
    info: InfoClient,
}

impl MarketReader {
    pub fn new(paths: HlPaths, network: Network) -> Self {
        Self {
            paths,
            info: InfoClient::new(network),
        }
    }

    /// All mids, or a single-entry mapping when `coin` is given.
    pub async fn prices(&self, coin: Option<&str>) -> Result<Fetched> {
        if let Some(client) = IpcClient::try_connect(&self.paths).await {
            match client.get_prices(coin).await {
                Ok((value, cached_at)) => return Ok(Fetched { value, cached_at }),
                Err(e) => tracing::debug!("daemon price read failed, falling back: {e}"),
            }
        }
        let mids = self.info.all_mids().await?;
        match coin {
            None => Ok(Fetched::direct(mids)),
            Some(coin) => {
                let entry = mids
                    .as_object()
                    .and_then(|m| m.iter().find(|(sym, _)| sym.eq_ignore_ascii_case(coin)));
                match entry {
                    Some((_, px)) => {
                        Ok(Fetched::direct(json!({ coin.to_uppercase(): px })))
                    }
                    None => bail!("Coin not found: {}", coin.to_uppercase()),
                }
            }
        }
    }

    pub async fn asset_ctxs(&self) -> Result<Fetched> {
        if let Some(client) = IpcClient::try_connect(&self.paths).await {
            match client.get_asset_ctxs().await {
                Ok((value, cached_at)) => return Ok(Fetched { value, cached_at }),
                Err(e) => tracing::debug!("daemon ctx read failed, falling back: {e}"),
            }
        }
        let pair = self.info.meta_and_asset_ctxs().await?;
        let ctxs = pair
            .get(1)
            .cloned()
            .unwrap_or(Value::Null);
        Ok(Fetched::direct(ctxs))
    }

    pub async fn perp_meta(&self) -> Result<Fetched> {
        if let Some(client) = IpcClient::try_connect(&self.paths).await {
            match client.get_perp_meta().await {
                Ok((value, cached_at)) => return Ok(Fetched { value, cached_at }),
                Err(e) => tracing::debug!("daemon meta read failed, falling back: {e}"),
            }
        }
        Ok(Fetched::direct(self.info.all_perp_metas().await?))
    }

    /// Combined `[meta, assetCtxs]`: served from the two cache slots when the
    /// daemon has both, otherwise one direct `metaAndAssetCtxs` call.
    pub async fn meta_and_ctxs(&self) -> Result<Fetched> {
        if let Some(client) = IpcClient::try_connect(&self.paths).await {
            let combined = async {
                let (meta, meta_at) = client.get_perp_meta().await?;
                let (ctxs, _) = client.get_asset_ctxs().await?;
                anyhow::Ok(Fetched {
                    value: json!([meta, ctxs]),
                    cached_at: meta_at,
                })
            }
            .await;
            match combined {
                Ok(fetched) => return Ok(fetched),
                Err(e) => tracing::debug!("daemon combined read failed, falling back: {e}"),
            }
        }
        Ok(Fetched::direct(self.info.meta_and_asset_ctxs().await?))
    }
}
