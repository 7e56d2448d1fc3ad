//! Account views: live watchers over the caller's address.

use anyhow::Result;
use tokio::sync::mpsc;

use super::watch_loop;
use crate::transport::exchange::resolve_wallet_address;
use crate::transport::Network;
use crate::watch::{BalanceWatcher, OrdersWatcher, PositionWatcher};

pub async fn orders(network: Network, address: Option<&str>) -> Result<()> {
    let user = resolve_wallet_address(address)?;
    let (sink, rx) = mpsc::unbounded_channel();
    let mut watcher = OrdersWatcher::new(&user, network, sink);
    watcher.start().await?;
    watch_loop(rx, move || watcher.stop()).await
}

pub async fn positions(network: Network, address: Option<&str>) -> Result<()> {
    let user = resolve_wallet_address(address)?;
    let (sink, rx) = mpsc::unbounded_channel();
    let mut watcher = PositionWatcher::new(&user, network, sink);
    watcher.start().await?;
    watch_loop(rx, move || watcher.stop()).await
}

pub async fn balance(network: Network, address: Option<&str>) -> Result<()> {
    let user = resolve_wallet_address(address)?;
    let (sink, rx) = mpsc::unbounded_channel();
    let mut watcher = BalanceWatcher::new(&user, network, sink);
    watcher.start().await?;
    watch_loop(rx, move || watcher.stop()).await
}
