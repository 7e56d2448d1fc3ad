//! `hl server ...` subcommands.

use anyhow::{Context, Result};
use serde_json::json;

use super::print_pretty;
use crate::client::IpcClient;
use crate::daemon;
use crate::paths::HlPaths;

pub async fn start(paths: &HlPaths, testnet: bool) -> Result<()> {
    daemon::start_detached(paths, testnet).await?;
    if testnet {
        println!("Daemon started (testnet)");
    } else {
        println!("Daemon started");
    }
    Ok(())
}

pub async fn stop(paths: &HlPaths) -> Result<()> {
    if daemon::stop(paths).await? {
        println!("Daemon stopped");
    } else {
        println!("Daemon is not running");
    }
    Ok(())
}

pub async fn status(paths: &HlPaths) -> Result<()> {
    match IpcClient::try_connect(paths).await {
        Some(client) => {
            let status = client
                .get_status()
                .await
                .context("daemon status request failed")?;
            print_pretty(&status)
        }
        None => print_pretty(&json!({"running": false})),
    }
}
