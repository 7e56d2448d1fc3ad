//! `hl config ...` subcommands.

use anyhow::{bail, Result};
use serde_json::{json, Value};

use super::print_pretty;
use crate::config;
use crate::paths::HlPaths;

pub fn set(paths: &HlPaths, key: &str, raw_value: &str) -> Result<()> {
    // Bare words become strings so `config set slippage 0.5` and future
    // string-valued keys both parse.
    let value: Value =
        serde_json::from_str(raw_value).unwrap_or_else(|_| Value::String(raw_value.to_string()));
    let cfg = config::set(paths, key, &value)?;
    print_pretty(&json!(cfg))
}

pub fn get(paths: &HlPaths, key: &str) -> Result<()> {
    let cfg = config::load(paths);
    match key {
        "slippage" => {
            println!("{}", cfg.slippage);
            Ok(())
        }
        other => bail!("Unknown config key: {other}"),
    }
}

pub fn list(paths: &HlPaths) -> Result<()> {
    print_pretty(&json!(config::load(paths)))
}
