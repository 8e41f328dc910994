//! Periodic ping/pong liveness sweep over every registered connection.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::registry::{ConnectionRegistry, EvictionReason};
use crate::metrics::LIVENESS_SWEEPS_TOTAL;

/// Result of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Connections that were pinged.
    pub probed: usize,
    /// Connections removed during this sweep.
    pub evicted: usize,
}

/// Evicts connections that stay silent for a full sweep period.
///
/// Each sweep clears the alive flag and sends a Ping. Any inbound frame sets
/// the flag again. A connection still unflagged at the next sweep is evicted,
/// so a dead peer lives at most two periods.
pub struct LivenessMonitor {
    registry: Arc<ConnectionRegistry>,
    period: Duration,
}

impl LivenessMonitor {
    /// Monitor `registry`, sweeping every `period`.
    pub fn new(registry: Arc<ConnectionRegistry>, period: Duration) -> Self {
        Self { registry, period }
    }

    /// Sweep period.
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Run one sweep now.
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        for conn in self.registry.snapshot().await {
            if !conn.check_alive() {
                debug!(
                    conn_id = %conn.id,
                    silent_ms = u64::try_from(conn.last_pong_elapsed().as_millis()).unwrap_or(u64::MAX),
                    "no response since last probe"
                );
                if self.registry.evict(&conn.id, EvictionReason::Unresponsive).await {
                    report.evicted += 1;
                }
                continue;
            }
            if conn.send_ping().is_err() {
                if self.registry.evict(&conn.id, EvictionReason::PingFailed).await {
                    report.evicted += 1;
                }
                continue;
            }
            report.probed += 1;
        }
        counter!(LIVENESS_SWEEPS_TOTAL).increment(1);
        if report.evicted > 0 {
            info!(probed = report.probed, evicted = report.evicted, "liveness sweep");
        }
        report
    }

    /// Sweep on a fixed period until `cancel` fires.
    ///
    /// The first sweep runs one full period after start.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = time::interval_at(time::Instant::now() + self.period, self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let _ = self.sweep().await;
                }
                () = cancel.cancelled() => {
                    debug!("liveness monitor stopped");
                    return;
                }
            }
        }
    }
}
