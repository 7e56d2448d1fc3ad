//! Market-data commands: one-shot reads via the fallback path, live views
//! via watchers.

use anyhow::{bail, Context, Result};
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;

use super::{print_pretty, watch_loop};
use crate::fallback::MarketReader;
use crate::paths::HlPaths;
use crate::transport::Network;
use crate::types::{AssetContext, PerpMeta};
use crate::watch::{BookWatcher, PriceWatcher};

pub async fn price(paths: &HlPaths, network: Network, coin: &str, watch: bool) -> Result<()> {
    if watch {
        let (sink, rx) = mpsc::unbounded_channel();
        let mut watcher = PriceWatcher::new(coin, network, paths.clone(), sink);
        watcher.start().await?;
        return watch_loop(rx, move || watcher.stop()).await;
    }

    let fetched = MarketReader::new(paths.clone(), network)
        .prices(Some(coin))
        .await?;
    print_pretty(&fetched.value)
}

pub async fn book(network: Network, coin: &str) -> Result<()> {
    let (sink, rx) = mpsc::unbounded_channel();
    let mut watcher = BookWatcher::new(coin, network, sink);
    watcher.start().await?;
    watch_loop(rx, move || watcher.stop()).await
}

pub async fn meta(paths: &HlPaths, network: Network, coin: Option<&str>) -> Result<()> {
    let fetched = MarketReader::new(paths.clone(), network).perp_meta().await?;
    match coin {
        None => print_pretty(&fetched.value),
        Some(coin) => {
            let entry = perp_universe(&fetched.value).and_then(|universe| {
                universe.iter().find(|entry| {
                    entry
                        .get("name")
                        .and_then(Value::as_str)
                        .map(|n| n.eq_ignore_ascii_case(coin))
                        .unwrap_or(false)
                })
            });
            match entry {
                Some(entry) => print_pretty(entry),
                None => bail!("Unknown coin: {}", coin.to_uppercase()),
            }
        }
    }
}

/// One asset's metadata and derived market state, merged.
pub async fn asset(paths: &HlPaths, network: Network, coin: &str) -> Result<()> {
    let pair = MarketReader::new(paths.clone(), network)
        .meta_and_ctxs()
        .await?
        .value;
    let universe = pair
        .get(0)
        .and_then(perp_universe)
        .context("malformed meta payload")?;
    let idx = universe
        .iter()
        .position(|entry| {
            entry
                .get("name")
                .and_then(Value::as_str)
                .map(|n| n.eq_ignore_ascii_case(coin))
                .unwrap_or(false)
        })
        .with_context(|| format!("Unknown coin: {}", coin.to_uppercase()))?;

    let meta: PerpMeta = serde_json::from_value(universe[idx].clone())
        .context("malformed perp market descriptor")?;
    let ctx: AssetContext = pair
        .get(1)
        .and_then(default_dex_ctxs)
        .and_then(|ctxs| ctxs.get(idx))
        .cloned()
        .map(serde_json::from_value)
        .transpose()
        .context("malformed asset context")?
        .with_context(|| format!("no asset context for {}", coin.to_uppercase()))?;

    print_pretty(&json!({
        "name": meta.name,
        "szDecimals": meta.sz_decimals,
        "maxLeverage": meta.max_leverage,
        "onlyIsolated": meta.only_isolated,
        "markPx": ctx.mark_px,
        "midPx": ctx.mid_px,
        "oraclePx": ctx.oracle_px,
        "funding": ctx.funding,
        "openInterest": ctx.open_interest,
        "premium": ctx.premium,
        "prevDayPx": ctx.prev_day_px,
        "dayNtlVlm": ctx.day_ntl_vlm,
    }))
}

/// Funding rates by symbol, optionally narrowed to one coin.
pub async fn funding(paths: &HlPaths, network: Network, coin: Option<&str>) -> Result<()> {
    let reader = MarketReader::new(paths.clone(), network);
    let meta = reader.perp_meta().await?.value;
    let universe = perp_universe(&meta).context("malformed perp metadata")?;
    let ctxs = reader.asset_ctxs().await?.value;
    let ctxs = default_dex_ctxs(&ctxs).context("malformed asset contexts")?;

    let mut rates = Map::new();
    for (entry, ctx) in universe.iter().zip(ctxs.iter()) {
        let name = entry.get("name").and_then(Value::as_str).unwrap_or("");
        if name.is_empty() {
            continue;
        }
        if let Some(filter) = coin {
            if !name.eq_ignore_ascii_case(filter) {
                continue;
            }
        }
        if let Some(funding) = ctx.get("funding") {
            rates.insert(name.to_string(), funding.clone());
        }
    }
    if let Some(filter) = coin {
        if rates.is_empty() {
            bail!("Unknown coin: {}", filter.to_uppercase());
        }
    }
    print_pretty(&Value::Object(rates))
}

/// The perp universe may arrive flat or wrapped in `{"universe": [...]}`
/// depending on which upstream endpoint populated it.
pub fn perp_universe(meta: &Value) -> Option<&Vec<Value>> {
    meta.as_array()
        .or_else(|| meta.get("universe").and_then(Value::as_array))
}

/// Asset contexts arrive either as a flat array (direct `metaAndAssetCtxs`)
/// or as `(dex, contexts)` pairs (the daemon's all-dexes slot); this picks
/// the default dex's array from either shape.
pub fn default_dex_ctxs(value: &Value) -> Option<&Vec<Value>> {
    let arr = value.as_array()?;
    match arr.first() {
        Some(Value::Array(pair)) => pair.get(1).and_then(Value::as_array),
        _ => Some(arr),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn perp_universe_accepts_both_shapes() {
        let flat = json!([{"name": "BTC"}]);
        assert_eq!(perp_universe(&flat).unwrap().len(), 1);

        let wrapped = json!({"universe": [{"name": "BTC"}, {"name": "ETH"}]});
        assert_eq!(perp_universe(&wrapped).unwrap().len(), 2);

        assert!(perp_universe(&json!({"other": 1})).is_none());
    }

    #[test]
    fn default_dex_ctxs_accepts_both_shapes() {
        let flat = json!([{"funding": "0.0000125"}]);
        assert_eq!(default_dex_ctxs(&flat).unwrap().len(), 1);

        let paired = json!([["", [{"funding": "0.0000125"}, {"funding": "0.00002"}]]]);
        assert_eq!(default_dex_ctxs(&paired).unwrap().len(), 2);

        assert!(default_dex_ctxs(&json!({"not": "an array"})).is_none());
    }
}
