//! Periodic dedup cache maintenance

use crate::dedup::{Deduplicator, SweepStats};
use crate::pipeline::{PipelineContext, stop_requested};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info};

/// Sweep expired and excess entries once
pub fn sweep_once(dedup: &Deduplicator) -> SweepStats {
    let stats = dedup.sweep(Instant::now());
    if stats.expired > 0 || stats.evicted > 0 {
        info!(
            expired = stats.expired,
            evicted = stats.evicted,
            remaining = stats.remaining,
            "Dedup cache swept"
        );
    } else {
        debug!(remaining = stats.remaining, "Dedup cache swept");
    }
    stats
}

/// Run [`sweep_once`] every `janitor_interval` until shutdown
pub(crate) async fn run_janitor(ctx: Arc<PipelineContext>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = interval(ctx.config().janitor_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = stop_requested(&mut shutdown) => break,
            _ = ticker.tick() => {
                sweep_once(ctx.dedup());
            }
        }
    }

    debug!("Cache janitor stopped");
}
