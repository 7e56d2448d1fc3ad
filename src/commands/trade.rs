//! Order entry. Writes go straight to the authenticated exchange endpoint;
//! the daemon is only consulted for the mid price that anchors market
//! orders.

use anyhow::{bail, Context, Result};
use serde_json::Value;

use super::market::perp_universe;
use super::print_pretty;
use crate::config;
use crate::fallback::MarketReader;
use crate::paths::HlPaths;
use crate::transport::exchange::ExchangeClient;
use crate::transport::info::InfoClient;
use crate::transport::Network;
use crate::types::{parse_direction, MarketType};

/// Spot asset ids live in a reserved range above the perp universe.
const SPOT_ASSET_OFFSET: u32 = 10_000;

pub async fn place(
    paths: &HlPaths,
    network: Network,
    direction_raw: &str,
    coin: &str,
    size: f64,
    limit_price: Option<f64>,
    slippage_override: Option<f64>,
) -> Result<()> {
    let direction = parse_direction(direction_raw)?;
    if !size.is_finite() || size <= 0.0 {
        bail!("Invalid size: {size} (must be a positive number)");
    }
    if let Some(px) = limit_price {
        if !px.is_finite() || px <= 0.0 {
            bail!("Invalid price: {px} (must be a positive number)");
        }
    }
    if let Some(slip) = slippage_override {
        if !slip.is_finite() || slip < 0.0 {
            bail!("Invalid slippage: {slip} (must be non-negative)");
        }
    }

    // Auth is checked before any network call.
    let exchange = ExchangeClient::from_env(network)?;
    let reader = MarketReader::new(paths.clone(), network);

    let (asset, sz_decimals, mid_key) = match direction.market_type {
        MarketType::Perp => {
            let meta = reader.perp_meta().await?.value;
            let (asset, sz_decimals) = perp_asset(&meta, coin)?;
            (asset, sz_decimals, coin.to_uppercase())
        }
        MarketType::Spot => {
            let spot_meta = InfoClient::new(network).spot_meta().await?;
            spot_asset(&spot_meta, coin)?
        }
    };

    let (price_str, tif) = match limit_price {
        Some(px) => (format_price(px), "Gtc"),
        None => {
            let slippage =
                slippage_override.unwrap_or_else(|| config::load(paths).slippage);
            let entry = reader.prices(Some(mid_key.as_str())).await?.value;
            let mid = entry_mid(&entry)
                .with_context(|| format!("no mid price for {mid_key}"))?;
            (
                format_price(slippage_price(mid, slippage, direction.is_buy)),
                "Ioc",
            )
        }
    };
    let size_str = format_size(size, sz_decimals);

    let resp = exchange
        .order(asset, direction.is_buy, &price_str, &size_str, false, tif)
        .await?;
    print_pretty(&resp)
}

pub async fn cancel(paths: &HlPaths, network: Network, coin: &str, oid: u64) -> Result<()> {
    let exchange = ExchangeClient::from_env(network)?;
    let meta = MarketReader::new(paths.clone(), network)
        .perp_meta()
        .await?
        .value;
    let (asset, _) = perp_asset(&meta, coin)?;
    let resp = exchange.cancel(asset, oid).await?;
    print_pretty(&resp)
}

pub async fn leverage(
    paths: &HlPaths,
    network: Network,
    coin: &str,
    leverage: u32,
    cross: bool,
) -> Result<()> {
    if leverage == 0 {
        bail!("Invalid leverage: 0 (must be at least 1)");
    }
    let exchange = ExchangeClient::from_env(network)?;
    let meta = MarketReader::new(paths.clone(), network)
        .perp_meta()
        .await?
        .value;
    let (asset, _) = perp_asset(&meta, coin)?;
    let resp = exchange.update_leverage(asset, leverage, cross).await?;
    print_pretty(&resp)
}

/// Asset index and size decimals for a perp symbol: its position in the
/// universe ordering.
fn perp_asset(meta: &Value, coin: &str) -> Result<(u32, u32)> {
    let universe = perp_universe(meta).context("malformed perp metadata")?;
    for (idx, entry) in universe.iter().enumerate() {
        let name = entry.get("name").and_then(Value::as_str).unwrap_or("");
        if name.eq_ignore_ascii_case(coin) {
            let sz_decimals = entry
                .get("szDecimals")
                .and_then(Value::as_u64)
                .unwrap_or(0) as u32;
            return Ok((idx as u32, sz_decimals));
        }
    }
    bail!("Unknown coin: {}", coin.to_uppercase())
}

/// Spot pairs resolve by pair name (`PURR/USDC`) or base token, to the
/// reserved id range. The mid key is the pair name, falling back to the
/// `@index` alias used by the mids feed.
fn spot_asset(spot_meta: &Value, coin: &str) -> Result<(u32, u32, String)> {
    let universe = spot_meta
        .get("universe")
        .and_then(Value::as_array)
        .context("malformed spot metadata")?;
    let tokens = spot_meta
        .get("tokens")
        .and_then(Value::as_array)
        .map(|t| t.as_slice())
        .unwrap_or(&[]);

    for entry in universe {
        let name = entry.get("name").and_then(Value::as_str).unwrap_or("");
        let base = name.split('/').next().unwrap_or("");
        if !name.eq_ignore_ascii_case(coin) && !base.eq_ignore_ascii_case(coin) {
            continue;
        }
        let index = entry
            .get("index")
            .and_then(Value::as_u64)
            .context("spot pair without index")? as u32;
        let sz_decimals = entry
            .get("tokens")
            .and_then(Value::as_array)
            .and_then(|pair| pair.first())
            .and_then(Value::as_u64)
            .and_then(|token_idx| tokens.get(token_idx as usize))
            .and_then(|token| token.get("szDecimals"))
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32;
        let mid_key = if name.is_empty() {
            format!("@{index}")
        } else {
            name.to_string()
        };
        return Ok((SPOT_ASSET_OFFSET + index, sz_decimals, mid_key));
    }
    bail!("Unknown coin: {}", coin.to_uppercase())
}

/// The single mid out of a one-entry price mapping.
fn entry_mid(entry: &Value) -> Option<f64> {
    let value = entry.as_object()?.values().next()?;
    value
        .as_str()
        .and_then(|s| s.parse::<f64>().ok())
        .or_else(|| value.as_f64())
}

pub fn slippage_price(mid: f64, slippage_pct: f64, is_buy: bool) -> f64 {
    let factor = if is_buy {
        1.0 + slippage_pct / 100.0
    } else {
        1.0 - slippage_pct / 100.0
    };
    mid * factor
}

/// Exchange price rule: at most five significant figures.
pub fn format_price(px: f64) -> String {
    if px <= 0.0 {
        return "0".to_string();
    }
    let magnitude = px.abs().log10().floor() as i32;
    let decimals = (4 - magnitude).max(0) as usize;
    trim_trailing_zeros(format!("{px:.decimals$}"))
}

pub fn format_size(size: f64, sz_decimals: u32) -> String {
    trim_trailing_zeros(format!("{size:.prec$}", prec = sz_decimals as usize))
}

fn trim_trailing_zeros(s: String) -> String {
    if !s.contains('.') {
        return s;
    }
    let trimmed = s.trim_end_matches('0').trim_end_matches('.');
    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn slippage_prices_straddle_the_mid() {
        assert_eq!(slippage_price(100.0, 1.0, true), 101.0);
        assert_eq!(slippage_price(100.0, 1.0, false), 99.0);
        assert_eq!(slippage_price(100.0, 0.0, true), 100.0);
    }

    #[test]
    fn price_formatting_keeps_five_significant_figures() {
        assert_eq!(format_price(50500.0), "50500");
        assert_eq!(format_price(101.0), "101");
        assert_eq!(format_price(14.31615), "14.316");
        assert_eq!(format_price(0.00123456), "0.0012346");
        assert_eq!(format_price(3000.1), "3000.1");
    }

    #[test]
    fn size_formatting_respects_decimals() {
        assert_eq!(format_size(0.5, 5), "0.5");
        assert_eq!(format_size(1.23456789, 4), "1.2346");
        assert_eq!(format_size(2.0, 0), "2");
    }

    #[test]
    fn perp_asset_resolves_index_and_decimals() {
        let meta = json!([
            {"name": "BTC", "szDecimals": 5, "maxLeverage": 50},
            {"name": "ETH", "szDecimals": 4, "maxLeverage": 50}
        ]);
        assert_eq!(perp_asset(&meta, "eth").unwrap(), (1, 4));
        let err = perp_asset(&meta, "doge").unwrap_err();
        assert_eq!(err.to_string(), "Unknown coin: DOGE");
    }

    #[test]
    fn spot_asset_resolves_pair_or_base_token() {
        let spot = json!({
            "tokens": [
                {"name": "PURR", "szDecimals": 0},
                {"name": "USDC", "szDecimals": 2}
            ],
            "universe": [
                {"name": "PURR/USDC", "index": 0, "tokens": [0, 1]}
            ]
        });
        let (asset, sz, key) = spot_asset(&spot, "PURR").unwrap();
        assert_eq!(asset, 10_000);
        assert_eq!(sz, 0);
        assert_eq!(key, "PURR/USDC");

        let (asset, _, _) = spot_asset(&spot, "purr/usdc").unwrap();
        assert_eq!(asset, 10_000);

        assert!(spot_asset(&spot, "DOGE").is_err());
    }

    #[test]
    fn entry_mid_parses_decimal_strings() {
        assert_eq!(entry_mid(&json!({"BTC": "50000.5"})), Some(50000.5));
        assert_eq!(entry_mid(&json!({"BTC": 123.0})), Some(123.0));
        assert_eq!(entry_mid(&json!({})), None);
    }
}
