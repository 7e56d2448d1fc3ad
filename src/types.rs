//! Market-data types shared across the daemon and CLI.
//!
//! Price and volume fields are decimal strings exactly as the exchange
//! reports them; they are parsed to floats only at the few call sites that
//! do arithmetic, so cached payloads never lose precision through a float
//! round-trip.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Per-asset derived market state, one entry per universe slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetContext {
    pub day_ntl_vlm: String,
    pub funding: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub impact_pxs: Option<Vec<String>>,
    pub mark_px: String,
    #[serde(default)]
    pub mid_px: Option<String>,
    pub open_interest: String,
    pub oracle_px: String,
    #[serde(default)]
    pub premium: Option<String>,
    pub prev_day_px: String,
    pub day_base_vlm: String,
}

/// One perpetual market descriptor from the exchange universe.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerpMeta {
    pub name: String,
    pub sz_decimals: u32,
    pub max_leverage: u32,
    #[serde(default)]
    pub only_isolated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarketType {
    Perp,
    Spot,
}

/// Trade direction parsed from user input: `long`/`short` are perp-market
/// directions, `buy`/`sell` are spot-market directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Direction {
    pub market_type: MarketType,
    pub is_buy: bool,
}

pub fn parse_direction(raw: &str) -> Result<Direction> {
    let dir = match raw.trim().to_ascii_lowercase().as_str() {
        "long" => Direction {
            market_type: MarketType::Perp,
            is_buy: true,
        },
        "short" => Direction {
            market_type: MarketType::Perp,
            is_buy: false,
        },
        "buy" => Direction {
            market_type: MarketType::Spot,
            is_buy: true,
        },
        "sell" => Direction {
            market_type: MarketType::Spot,
            is_buy: false,
        },
        other => bail!("Invalid direction: {other} (expected long, short, buy or sell)"),
    };
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_parsing() {
        let d = parse_direction("long").unwrap();
        assert_eq!(d.market_type, MarketType::Perp);
        assert!(d.is_buy);

        let d = parse_direction("SHORT").unwrap();
        assert_eq!(d.market_type, MarketType::Perp);
        assert!(!d.is_buy);

        let d = parse_direction("buy").unwrap();
        assert_eq!(d.market_type, MarketType::Spot);
        assert!(d.is_buy);

        let d = parse_direction(" Sell ").unwrap();
        assert_eq!(d.market_type, MarketType::Spot);
        assert!(!d.is_buy);

        assert!(parse_direction("invalid").is_err());
        assert!(parse_direction("").is_err());
    }

    #[test]
    fn asset_context_keeps_decimal_strings() {
        let raw = r#"{
            "dayNtlVlm": "1169046.29406",
            "funding": "0.0000125",
            "impactPxs": ["14.3047", "14.3444"],
            "markPx": "14.3161",
            "midPx": "14.314",
            "openInterest": "688.11",
            "oraclePx": "14.32",
            "premium": "0.00031774",
            "prevDayPx": "15.322",
            "dayBaseVlm": "79328.72"
        }"#;
        let ctx: AssetContext = serde_json::from_str(raw).unwrap();
        assert_eq!(ctx.funding, "0.0000125");
        assert_eq!(ctx.mid_px.as_deref(), Some("14.314"));
        assert_eq!(ctx.impact_pxs.as_ref().unwrap().len(), 2);
        // Round-trip must not re-encode through floats.
        let back = serde_json::to_value(&ctx).unwrap();
        assert_eq!(back["markPx"], "14.3161");
    }

    #[test]
    fn perp_meta_defaults_only_isolated() {
        let m: PerpMeta = serde_json::from_str(
            r#"{"name":"BTC","szDecimals":5,"maxLeverage":50}"#,
        )
        .unwrap();
        assert_eq!(m.name, "BTC");
        assert_eq!(m.sz_decimals, 5);
        assert!(!m.only_isolated);
    }
}
