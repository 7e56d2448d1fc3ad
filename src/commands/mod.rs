//! Thin command plumbing over the client, fallback and watcher layers.

pub mod account;
pub mod config_cmd;
pub mod market;
pub mod server_cmd;
pub mod trade;

use anyhow::Result;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::watch::WatchEvent;

pub fn print_pretty(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Drain watcher events to stdout as JSON lines until Ctrl-C, then run the
/// watcher's stop and exit cleanly. Watcher errors are surfaced on stderr
/// without ending the stream.
pub async fn watch_loop(
    mut rx: mpsc::UnboundedReceiver<WatchEvent>,
    stop: impl FnOnce(),
) -> Result<()> {
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(WatchEvent::Update(value)) => {
                    println!("{}", serde_json::to_string(&value)?);
                }
                Some(WatchEvent::Error(e)) => {
                    eprintln!("Error: {e}");
                }
                None => break,
            },
            _ = &mut ctrl_c => break,
        }
    }

    stop();
    Ok(())
}
