//! User configuration store.
//!
//! A single JSON file at `~/.hl/user-config.json` holding ordering
//! preferences. Loading is a total function: a missing, empty or corrupt
//! file yields the defaults, and unknown keys are ignored so older binaries
//! can read files written by newer ones.

use std::fs;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::paths::HlPaths;

pub const DEFAULT_SLIPPAGE_PCT: f64 = 1.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserConfig {
    /// Market-order slippage tolerance in percent. Market orders are sent as
    /// IOC limit orders priced at `mid * (1 +/- slippage / 100)`.
    pub slippage: f64,
}

impl Default for UserConfig {
    fn default() -> Self {
        Self {
            slippage: DEFAULT_SLIPPAGE_PCT,
        }
    }
}

/// Load the user config, overlaying recognized keys onto the defaults.
/// Never fails: any I/O or parse problem collapses to the defaults.
pub fn load(paths: &HlPaths) -> UserConfig {
    let raw = match fs::read_to_string(&paths.user_config) {
        Ok(raw) => raw,
        Err(_) => return UserConfig::default(),
    };
    let parsed: Value = match serde_json::from_str(&raw) {
        Ok(v) => v,
        Err(_) => return UserConfig::default(),
    };

    let mut cfg = UserConfig::default();
    if let Some(s) = parsed.get("slippage").and_then(Value::as_f64) {
        if s.is_finite() && s >= 0.0 {
            cfg.slippage = s;
        }
    }
    cfg
}

/// Set one recognized key and persist the merged record as pretty JSON.
/// Truncate-then-write: a crashed write leaves either the old or the new
/// file, both of which `load` can read.
pub fn set(paths: &HlPaths, key: &str, value: &Value) -> Result<UserConfig> {
    let mut cfg = load(paths);
    match key {
        "slippage" => {
            let s = value
                .as_f64()
                .with_context(|| format!("slippage must be a number, got {value}"))?;
            if !s.is_finite() || s < 0.0 {
                bail!("slippage must be a non-negative number, got {value}");
            }
            cfg.slippage = s;
        }
        other => bail!("Unknown config key: {other}"),
    }
    save(paths, &cfg)?;
    Ok(cfg)
}

pub fn save(paths: &HlPaths, cfg: &UserConfig) -> Result<()> {
    paths.ensure_dir()?;
    let pretty = serde_json::to_string_pretty(&json!(cfg))?;
    fs::write(&paths.user_config, pretty + "\n")
        .with_context(|| format!("write {}", paths.user_config.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_paths() -> (tempfile::TempDir, HlPaths) {
        let tmp = tempfile::tempdir().unwrap();
        let paths = HlPaths::in_dir(tmp.path());
        (tmp, paths)
    }

    #[test]
    fn load_without_file_returns_defaults() {
        let (_tmp, paths) = temp_paths();
        assert_eq!(load(&paths), UserConfig { slippage: 1.0 });
    }

    #[test]
    fn load_is_total_on_garbage() {
        let (_tmp, paths) = temp_paths();
        paths.ensure_dir().unwrap();

        fs::write(&paths.user_config, "").unwrap();
        assert_eq!(load(&paths).slippage, 1.0);

        fs::write(&paths.user_config, "{not json").unwrap();
        assert_eq!(load(&paths).slippage, 1.0);

        fs::write(&paths.user_config, r#"{"unknown":"x"}"#).unwrap();
        assert_eq!(load(&paths).slippage, 1.0);

        fs::write(&paths.user_config, r#"{"slippage":-2}"#).unwrap();
        assert_eq!(load(&paths).slippage, 1.0);
    }

    #[test]
    fn set_then_load_round_trips() {
        let (_tmp, paths) = temp_paths();
        let cfg = set(&paths, "slippage", &json!(0.5)).unwrap();
        assert_eq!(cfg.slippage, 0.5);
        assert_eq!(load(&paths).slippage, 0.5);
    }

    #[test]
    fn set_rejects_bad_values() {
        let (_tmp, paths) = temp_paths();
        assert!(set(&paths, "slippage", &json!("fast")).is_err());
        assert!(set(&paths, "slippage", &json!(-1.0)).is_err());
        assert!(set(&paths, "ratio", &json!(1.0)).is_err());
        // Nothing was written.
        assert_eq!(load(&paths).slippage, 1.0);
    }
}
