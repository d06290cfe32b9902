//! Wallet balance monitor.
//!
//! The proxy itself never inspects chain state; an injected probe reports
//! whether the wallet can still pay. The monitor polls it on an interval
//! and publishes the latest answer over a `watch` channel that the router
//! consumes as a plain boolean. A failed probe keeps the previous value.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::ProxyError;

/// Answers "is the wallet empty?". Supplied by the host collaborator.
#[async_trait]
pub trait BalanceProbe: Send + Sync {
    async fn is_empty(&self) -> Result<bool, ProxyError>;
}

/// A probe pinned to a constant answer. The default when the host supplies
/// nothing: the wallet is assumed funded.
pub struct StaticBalance(pub bool);

#[async_trait]
impl BalanceProbe for StaticBalance {
    async fn is_empty(&self) -> Result<bool, ProxyError> {
        Ok(self.0)
    }
}

/// Spawn the monitor task. Returns the receiver the router reads and the
/// task handle so the proxy can cancel it on shutdown.
pub fn spawn(
    probe: Arc<dyn BalanceProbe>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> (watch::Receiver<bool>, tokio::task::JoinHandle<()>) {
    let (tx, rx) = watch::channel(false);

    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match probe.is_empty().await {
                        Ok(empty) => {
                            if *tx.borrow() != empty {
                                debug!(empty, "wallet balance flag changed");
                            }
                            let _ = tx.send(empty);
                        }
                        Err(e) => {
                            warn!(error = %e, "balance probe failed, keeping previous flag");
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    });

    (rx, handle)
}

// ── Tests ──────────────────────────────────────────────────────────────
