//! HTTP info client.
//!
//! Every info query is a POST of `{"type": ...}` to the network's `/info`
//! endpoint. Responses are returned as raw JSON so decimal strings survive
//! untouched; typed views are built at the call sites that need them.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::Client;
use serde_json::{json, Value};

use super::Network;

const HTTP_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone)]
pub struct InfoClient {
    http: Client,
    url: String,
}

impl InfoClient {
    pub fn new(network: Network) -> Self {
        let http = Client::builder()
            .user_agent(concat!("hl-cli/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()
            .unwrap_or_default();
        Self {
            http,
            url: network.info_url().to_string(),
        }
    }

    async fn post(&self, body: Value) -> Result<Value> {
        let kind = body
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        let resp = self
            .http
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("info {kind} request failed"))?;
        let status = resp.status();
        if !status.is_success() {
            bail!("info {kind} failed: HTTP {status}");
        }
        resp.json()
            .await
            .with_context(|| format!("info {kind} response was not JSON"))
    }

    /// Mapping of asset symbol to mid-price string across all dexes.
    pub async fn all_mids(&self) -> Result<Value> {
        self.post(json!({"type": "allMids"})).await
    }

    pub async fn meta(&self) -> Result<Value> {
        self.post(json!({"type": "meta"})).await
    }

    /// Perp market descriptors for every dex.
    pub async fn all_perp_metas(&self) -> Result<Value> {
        self.post(json!({"type": "allPerpMetas"})).await
    }

    /// `[meta, assetCtxs]` pair for the default dex.
    pub async fn meta_and_asset_ctxs(&self) -> Result<Value> {
        self.post(json!({"type": "metaAndAssetCtxs"})).await
    }

    pub async fn spot_meta(&self) -> Result<Value> {
        self.post(json!({"type": "spotMeta"})).await
    }

    pub async fn clearinghouse_state(&self, user: &str) -> Result<Value> {
        self.post(json!({"type": "clearinghouseState", "user": user}))
            .await
    }

    pub async fn spot_clearinghouse_state(&self, user: &str) -> Result<Value> {
        self.post(json!({"type": "spotClearinghouseState", "user": user}))
            .await
    }

    pub async fn open_orders(&self, user: &str) -> Result<Value> {
        self.post(json!({"type": "openOrders", "user": user})).await
    }

    pub async fn l2_book(&self, coin: &str) -> Result<Value> {
        self.post(json!({"type": "l2Book", "coin": coin})).await
    }

    pub async fn referral(&self, user: &str) -> Result<Value> {
        self.post(json!({"type": "referral", "user": user})).await
    }

    pub async fn user_role(&self, user: &str) -> Result<Value> {
        self.post(json!({"type": "userRole", "user": user})).await
    }

    pub async fn extra_agents(&self, user: &str) -> Result<Value> {
        self.post(json!({"type": "extraAgents", "user": user})).await
    }

    pub async fn active_asset_data(&self, user: &str, coin: &str) -> Result<Value> {
        self.post(json!({"type": "activeAssetData", "user": user, "coin": coin}))
            .await
    }
}
