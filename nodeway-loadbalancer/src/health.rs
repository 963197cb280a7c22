//! Active TCP health probes
//!
//! `tcp_health_check` spawns a background probe for one address and returns
//! a `HealthCheckFunc` that reports the probe's latest verdict. The load
//! balancer's own check loop only reads that verdict, so checks stay cheap.

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::interval;
use tokio_util::sync::CancellationToken;

use crate::balancer::{HealthCheckFunc, HealthCheckResult};
use crate::dialer;

const UNKNOWN: u8 = 0;
const FAILED: u8 = 1;
const OK: u8 = 2;

/// Configuration for active health probes
#[derive(Debug, Clone)]
pub struct HealthProbeConfig {
    /// TCP connection timeout for a single probe
    pub probe_timeout: Duration,
    /// Consecutive probe failures before reporting failed
    pub failure_threshold: u32,
    /// Consecutive probe successes before reporting ok
    pub success_threshold: u32,
    pub probe_interval: Duration,
}

impl Default for HealthProbeConfig {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_secs(3),
            failure_threshold: 2,
            success_threshold: 1,
            probe_interval: Duration::from_secs(5),
        }
    }
}

impl From<&nodeway_core::config::LoadBalancerConfig> for HealthProbeConfig {
    fn from(config: &nodeway_core::config::LoadBalancerConfig) -> Self {
        Self {
            probe_timeout: Duration::from_secs(config.probe_timeout_secs.max(1)),
            failure_threshold: config.failure_threshold.max(1),
            success_threshold: 1,
            probe_interval: Duration::from_secs(config.health_check_interval_secs.max(1)),
        }
    }
}

/// Consecutive-result bookkeeping for one probed address
#[derive(Debug, Default)]
struct ProbeState {
    success_count: AtomicU32,
    failure_count: AtomicU32,
    verdict: AtomicU8,
}

impl ProbeState {
    fn record(&self, success: bool, config: &HealthProbeConfig) -> Option<HealthCheckResult> {
        let new_verdict = if success {
            self.failure_count.store(0, Ordering::Relaxed);
            let successes = self.success_count.fetch_add(1, Ordering::Relaxed) + 1;
            (successes >= config.success_threshold).then_some(OK)
        } else {
            self.success_count.store(0, Ordering::Relaxed);
            let failures = self.failure_count.fetch_add(1, Ordering::Relaxed) + 1;
            (failures >= config.failure_threshold).then_some(FAILED)
        };
        let new_verdict = new_verdict?;

        let old = self.verdict.swap(new_verdict, Ordering::AcqRel);
        (old != new_verdict).then(|| decode(new_verdict))
    }

    fn verdict(&self) -> HealthCheckResult {
        decode(self.verdict.load(Ordering::Acquire))
    }
}

const fn decode(verdict: u8) -> HealthCheckResult {
    match verdict {
        OK => HealthCheckResult::Ok,
        FAILED => HealthCheckResult::Failed,
        _ => HealthCheckResult::Unknown,
    }
}

/// Probe `address` in the background until `cancel` fires.
///
/// Reports `Unknown` until enough probes have completed. Must be called
/// from within a tokio runtime.
#[must_use]
pub fn tcp_health_check(
    address: String,
    config: HealthProbeConfig,
    cancel: CancellationToken,
) -> HealthCheckFunc {
    let state = Arc::new(ProbeState::default());
    let probe_state = Arc::clone(&state);

    tokio::spawn(async move {
        let mut timer = interval(config.probe_interval);
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    tracing::debug!(server = %address, "Health probe stopped");
                    return;
                }
                _ = timer.tick() => {
                    let success = dialer::dial(&address, config.probe_timeout).await.is_ok();
                    match probe_state.record(success, &config) {
                        Some(HealthCheckResult::Ok) => {
                            tracing::info!(server = %address, "Server is reachable (probe)");
                        }
                        Some(HealthCheckResult::Failed) => {
                            tracing::warn!(
                                server = %address,
                                consecutive_failures = config.failure_threshold,
                                "Server is unreachable (probe)"
                            );
                        }
                        _ => {}
                    }
                }
            }
        }
    });

    Arc::new(move || state.verdict())
}
