//! Offer revive/suppress signalling.
//!
//! The bus only sends offers to frameworks that want them. Demand here is
//! the disjunction of the launch queue's unfulfilled counts and the
//! reconciliation loop's need for status traffic. Revives are rate-limited
//! to one per `min_revive_interval`; suppression (when enabled) is sent once
//! demand drains to zero.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::driver::SchedulerDriver;

#[derive(Debug, Clone)]
pub struct ReviveConfig {
    pub min_revive_interval: Duration,
    pub enable_suppress: bool,
}

impl Default for ReviveConfig {
    fn default() -> Self {
        Self {
            min_revive_interval: Duration::from_secs(5),
            enable_suppress: true,
        }
    }
}

/// Spawn the signaller task. It watches both demand channels until the
/// token is cancelled (leadership loss).
pub fn spawn_revive_signaller(
    driver: Arc<dyn SchedulerDriver>,
    config: ReviveConfig,
    mut queue_demand: watch::Receiver<bool>,
    mut reconcile_demand: watch::Receiver<bool>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut last_revive: Option<tokio::time::Instant> = None;
        // Pending edge that arrived inside the rate-limit window.
        let mut want_revive = false;
        let mut suppressed = false;

        loop {
            let demand = *queue_demand.borrow() || *reconcile_demand.borrow();

            if demand {
                let due = match last_revive {
                    None => true,
                    Some(at) => at.elapsed() >= config.min_revive_interval,
                };
                if due {
                    match driver.revive_offers().await {
                        Ok(()) => {
                            tracing::debug!("revived offers");
                            last_revive = Some(tokio::time::Instant::now());
                            want_revive = false;
                            suppressed = false;
                        }
                        Err(e) => tracing::warn!(error = %e, "revive failed"),
                    }
                } else {
                    want_revive = true;
                }
            } else if config.enable_suppress && !suppressed {
                match driver.suppress_offers().await {
                    Ok(()) => {
                        tracing::debug!("suppressed offers");
                        suppressed = true;
                        want_revive = false;
                    }
                    Err(e) => tracing::warn!(error = %e, "suppress failed"),
                }
            }

            // Wait for a demand change, the rate-limit window to open for a
            // deferred revive, or cancellation.
            let window = if want_revive {
                let elapsed = last_revive.map(|at| at.elapsed()).unwrap_or_default();
                config.min_revive_interval.saturating_sub(elapsed)
            } else {
                Duration::from_secs(3600)
            };
            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = queue_demand.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                changed = reconcile_demand.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(window), if want_revive => {}
            }
        }
        tracing::debug!("revive signaller stopped");
    })
}
