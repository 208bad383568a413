//! Stream health evaluation
//!
//! A stream is degraded when any of these hold:
//! - push transport, without a connection for longer than the disconnect
//!   threshold (reconnect attempts do not restart the clock)
//! - consecutive connection failures reaching the failure threshold
//! - accumulated connection and parse errors above the error threshold
//!
//! The monitor re-evaluates every stream on a fixed period, flips the
//! degraded flag, and logs every transition.

use crate::config::PipelineConfig;
use crate::descriptor::TransportKind;
use crate::metrics;
use crate::pipeline::{PipelineContext, stop_requested};
use crate::supervisor::{StreamState, StreamStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

/// Limits a stream must stay within to count as healthy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthThresholds {
    pub disconnect: Duration,
    pub max_consecutive_failures: u32,
    pub max_errors: u64,
}

impl HealthThresholds {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            disconnect: config.disconnect_threshold,
            max_consecutive_failures: config.max_consecutive_failures,
            max_errors: config.error_threshold,
        }
    }
}

/// Why a stream is degraded
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DegradedReason {
    DisconnectedFor(Duration),
    ConsecutiveFailures(u32),
    TooManyErrors(u64),
}

impl fmt::Display for DegradedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DegradedReason::DisconnectedFor(d) => write!(f, "disconnected for {}s", d.as_secs()),
            DegradedReason::ConsecutiveFailures(n) => write!(f, "{n} consecutive connection failures"),
            DegradedReason::TooManyErrors(n) => write!(f, "{n} accumulated errors"),
        }
    }
}

/// Reasons `status` is degraded under `thresholds`; empty when healthy
pub fn evaluate(status: &StreamStatus, thresholds: &HealthThresholds) -> Vec<DegradedReason> {
    let mut reasons = Vec::new();

    if status.transport() == TransportKind::Push
        && status.state() != StreamState::Stopped
        && let Some(down_for) = status.disconnected_for()
        && down_for > thresholds.disconnect
    {
        reasons.push(DegradedReason::DisconnectedFor(down_for));
    }

    let failures = status.consecutive_failures();
    if failures >= thresholds.max_consecutive_failures {
        reasons.push(DegradedReason::ConsecutiveFailures(failures));
    }

    let errors = status.error_count();
    if errors > thresholds.max_errors {
        reasons.push(DegradedReason::TooManyErrors(errors));
    }

    reasons
}

/// Health of one stream at report time
#[derive(Debug, Clone, Serialize)]
pub struct StreamHealth {
    pub name: String,
    pub transport: &'static str,
    pub state: StreamState,
    pub degraded: bool,
    pub reasons: Vec<String>,
    pub consecutive_failures: u32,
    pub connection_errors: u64,
    pub parse_errors: u64,
    pub messages_received: u64,
    pub last_error: Option<String>,
}

/// Health of every stream plus the sink
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub timestamp: DateTime<Utc>,
    pub streams: Vec<StreamHealth>,
    /// `None` when no sink is configured or it was not probed
    pub sink_healthy: Option<bool>,
}

impl HealthReport {
    pub fn healthy(&self) -> bool {
        self.streams.iter().all(|s| !s.degraded) && self.sink_healthy != Some(false)
    }

    pub fn degraded_streams(&self) -> impl Iterator<Item = &StreamHealth> {
        self.streams.iter().filter(|s| s.degraded)
    }
}

/// Evaluate every status, update degraded flags, and log transitions
pub fn check_streams(statuses: &[Arc<StreamStatus>], thresholds: &HealthThresholds) -> Vec<StreamHealth> {
    statuses
        .iter()
        .map(|status| {
            let reasons = evaluate(status, thresholds);
            let degraded = !reasons.is_empty();
            let was_degraded = status.set_degraded(degraded);

            if degraded && !was_degraded {
                let why = reasons.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ");
                warn!(stream = %status.name(), reasons = %why, "Stream degraded");
            } else if !degraded && was_degraded {
                info!(stream = %status.name(), "Stream recovered");
            }
            metrics::try_set_stream_degraded(status.name(), degraded);

            StreamHealth {
                name: status.name().to_string(),
                transport: status.transport().as_str(),
                state: status.state(),
                degraded,
                reasons: reasons.iter().map(ToString::to_string).collect(),
                consecutive_failures: status.consecutive_failures(),
                connection_errors: status.connection_errors(),
                parse_errors: status.parse_errors(),
                messages_received: status.messages_received(),
                last_error: status.last_error(),
            }
        })
        .collect()
}

/// Periodic health monitor; runs until `shutdown` flips to true
pub(crate) async fn run_monitor(ctx: Arc<PipelineContext>, mut shutdown: watch::Receiver<bool>) {
    let thresholds = HealthThresholds::from_config(ctx.config());
    let mut ticker = interval(ctx.config().health_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = stop_requested(&mut shutdown) => break,
            _ = ticker.tick() => {
                let streams = check_streams(&ctx.stream_statuses(), &thresholds);
                let sink_healthy = ctx.publisher().sink_health().await;
                if sink_healthy == Some(false) {
                    warn!("Publish sink unhealthy");
                }
                let degraded = streams.iter().filter(|s| s.degraded).count();
                debug!(streams = streams.len(), degraded = degraded, "Health check complete");
            }
        }
    }

    debug!("Health monitor stopped");
}
