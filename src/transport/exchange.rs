//! Authenticated exchange client.
//!
//! Actions are msgpack-encoded together with the nonce, keccak-hashed and
//! signed with the recoverable secp256k1 key from the environment. The
//! signing identity (wallet address) is derived from the key unless
//! explicitly overridden.

use std::env;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use k256::ecdsa::SigningKey;
use k256::elliptic_curve::sec1::ToEncodedPoint;
use reqwest::Client;
use serde::Serialize;
use serde_json::{json, Value};
use sha3::{Digest, Keccak256};

use super::Network;
use crate::util::now_ms;

pub const PRIVATE_KEY_ENV: &str = "HL_PRIVATE_KEY";
pub const WALLET_ADDRESS_ENV: &str = "HL_WALLET_ADDRESS";

pub const AUTH_GUIDANCE: &str =
    "HL_PRIVATE_KEY is not set. Export your API wallet private key (hex) to sign exchange requests.";

const HTTP_TIMEOUT_SECS: u64 = 10;

pub struct ExchangeClient {
    http: Client,
    url: String,
    signing_key: SigningKey,
    address: String,
}

impl ExchangeClient {
    /// Build a client from `HL_PRIVATE_KEY` / `HL_WALLET_ADDRESS`. Fails with
    /// fixed guidance when no key is configured, before any network call.
    pub fn from_env(network: Network) -> Result<Self> {
        let key_hex = env::var(PRIVATE_KEY_ENV)
            .ok()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty());
        let key_hex = match key_hex {
            Some(k) => k,
            None => bail!("{AUTH_GUIDANCE}"),
        };
        let signing_key = parse_signing_key(&key_hex)?;
        let address = env::var(WALLET_ADDRESS_ENV)
            .ok()
            .map(|a| a.trim().to_lowercase())
            .filter(|a| !a.is_empty())
            .unwrap_or_else(|| derive_address(&signing_key));

        let http = Client::builder()
            .user_agent(concat!("hl-cli/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()
            .unwrap_or_default();

        Ok(Self {
            http,
            url: network.exchange_url().to_string(),
            signing_key,
            address,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    async fn post_action(&self, action: Value) -> Result<Value> {
        let nonce = now_ms() as u64;
        let signature = sign_action(&action, nonce, &self.signing_key)?;
        let payload = json!({
            "action": action,
            "nonce": nonce,
            "signature": signature,
            "vaultAddress": Value::Null,
        });

        let resp = self
            .http
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .context("exchange request failed")?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!("exchange request failed: HTTP {status} {body}");
        }
        let body: Value = resp.json().await.context("exchange response was not JSON")?;
        if body.get("status").and_then(Value::as_str) == Some("err") {
            let detail = body
                .get("response")
                .and_then(Value::as_str)
                .unwrap_or("unknown exchange error");
            bail!("exchange rejected the action: {detail}");
        }
        Ok(body)
    }

    /// Place a single limit order. Market flows express themselves as IOC
    /// limit orders priced off the mid.
    pub async fn order(
        &self,
        asset: u32,
        is_buy: bool,
        price: &str,
        size: &str,
        reduce_only: bool,
        tif: &str,
    ) -> Result<Value> {
        let action = json!({
            "type": "order",
            "orders": [{
                "a": asset,
                "b": is_buy,
                "p": price,
                "s": size,
                "r": reduce_only,
                "t": {"limit": {"tif": tif}},
            }],
            "grouping": "na",
        });
        self.post_action(action).await
    }

    pub async fn cancel(&self, asset: u32, oid: u64) -> Result<Value> {
        let action = json!({
            "type": "cancel",
            "cancels": [{"a": asset, "o": oid}],
        });
        self.post_action(action).await
    }

    pub async fn update_leverage(&self, asset: u32, leverage: u32, cross: bool) -> Result<Value> {
        let action = json!({
            "type": "updateLeverage",
            "asset": asset,
            "isCross": cross,
            "leverage": leverage,
        });
        self.post_action(action).await
    }

    pub async fn set_referrer(&self, code: &str) -> Result<Value> {
        let action = json!({
            "type": "setReferrer",
            "code": code,
        });
        self.post_action(action).await
    }
}

/// The wallet address for read-only account queries: explicit flag, then the
/// env override, then the address derived from the signing key.
pub fn resolve_wallet_address(explicit: Option<&str>) -> Result<String> {
    if let Some(addr) = explicit.map(str::trim).filter(|a| !a.is_empty()) {
        if !looks_like_address(addr) {
            bail!("Invalid address: {addr}");
        }
        return Ok(addr.to_lowercase());
    }
    if let Some(addr) = env::var(WALLET_ADDRESS_ENV)
        .ok()
        .map(|a| a.trim().to_lowercase())
        .filter(|a| !a.is_empty())
    {
        if !looks_like_address(&addr) {
            bail!("Invalid address in {WALLET_ADDRESS_ENV}: {addr}");
        }
        return Ok(addr);
    }
    if let Some(key_hex) = env::var(PRIVATE_KEY_ENV)
        .ok()
        .map(|k| k.trim().to_string())
        .filter(|k| !k.is_empty())
    {
        let key = parse_signing_key(&key_hex)?;
        return Ok(derive_address(&key));
    }
    bail!("No wallet address. Pass --address or set {WALLET_ADDRESS_ENV} or {PRIVATE_KEY_ENV}.");
}

pub fn looks_like_address(addr: &str) -> bool {
    let hex_part = addr.strip_prefix("0x").unwrap_or(addr);
    hex_part.len() == 40 && hex_part.chars().all(|c| c.is_ascii_hexdigit())
}

fn parse_signing_key(key_hex: &str) -> Result<SigningKey> {
    let stripped = key_hex.strip_prefix("0x").unwrap_or(key_hex);
    let bytes = hex::decode(stripped).context("private key is not valid hex")?;
    SigningKey::from_slice(&bytes).context("private key is not a valid secp256k1 scalar")
}

/// Ethereum-style address: keccak of the uncompressed public key, last 20
/// bytes, lowercase hex.
fn derive_address(key: &SigningKey) -> String {
    let pubkey = key.verifying_key().to_encoded_point(false);
    let digest = Keccak256::digest(&pubkey.as_bytes()[1..]);
    format!("0x{}", hex::encode(&digest[12..]))
}

#[derive(Debug, Serialize)]
struct SignedPayload {
    action: Value,
    nonce: u64,
}

fn sign_action(action: &Value, nonce: u64, signing_key: &SigningKey) -> Result<Value> {
    let payload = SignedPayload {
        action: action.clone(),
        nonce,
    };
    let packed = rmp_serde::to_vec_named(&payload).context("msgpack action")?;
    let digest = Keccak256::new().chain_update(&packed);
    let (sig, recid) = signing_key
        .sign_digest_recoverable(digest)
        .context("sign action")?;
    let (r, s) = sig.split_bytes();
    Ok(json!({
        "r": format!("0x{}", hex::encode(r)),
        "s": format!("0x{}", hex::encode(s)),
        "v": 27 + recid.to_byte(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    // Well-known development key (hardhat/anvil account 0).
    const DEV_KEY: &str = "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
    const DEV_ADDR: &str = "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266";

    #[test]
    fn derives_address_from_key() {
        let key = parse_signing_key(DEV_KEY).unwrap();
        assert_eq!(derive_address(&key), DEV_ADDR);
        // 0x prefix on the key is accepted too.
        let key = parse_signing_key(&format!("0x{DEV_KEY}")).unwrap();
        assert_eq!(derive_address(&key), DEV_ADDR);
    }

    #[test]
    fn rejects_bad_keys() {
        assert!(parse_signing_key("zz").is_err());
        assert!(parse_signing_key("00").is_err());
    }

    #[test]
    fn address_shape_validation() {
        assert!(looks_like_address(DEV_ADDR));
        assert!(looks_like_address(&DEV_ADDR[2..]));
        assert!(!looks_like_address("0x1234"));
        assert!(!looks_like_address("not-an-address"));
    }

    #[test]
    fn signature_fields_are_hex_encoded() {
        let key = parse_signing_key(DEV_KEY).unwrap();
        let action = json!({"type": "order", "orders": []});
        let sig = sign_action(&action, 1_700_000_000_000, &key).unwrap();
        let r = sig["r"].as_str().unwrap();
        let s = sig["s"].as_str().unwrap();
        assert_eq!(r.len(), 66);
        assert_eq!(s.len(), 66);
        assert!(r.starts_with("0x"));
        let v = sig["v"].as_u64().unwrap();
        assert!(v == 27 || v == 28);

        // RFC 6979 signing is deterministic.
        let again = sign_action(&action, 1_700_000_000_000, &key).unwrap();
        assert_eq!(sig, again);
    }
}
