//! Background health monitor
//!
//! Periodically probes every backend through the lifecycle manager and logs
//! state changes. Results are observational: selection keeps spreading traffic
//! over the whole pool.

use crate::backend::BackendPool;
use crate::config::MonitorConfig;
use crate::lifecycle::LifecycleManager;
use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Consecutive probe results for one backend
#[derive(Debug)]
pub struct BackendHealthState {
    consecutive_failures: u32,
    consecutive_successes: u32,
    is_healthy: bool,
}

impl Default for BackendHealthState {
    fn default() -> Self {
        Self {
            consecutive_failures: 0,
            consecutive_successes: 0,
            is_healthy: true, // Assume healthy initially
        }
    }
}

impl BackendHealthState {
    pub fn is_healthy(&self) -> bool {
        self.is_healthy
    }

    /// Fold in one probe result. Returns the new health when it flipped.
    pub fn record(&mut self, probe_ok: bool, failure_threshold: u32, success_threshold: u32) -> Option<bool> {
        if probe_ok {
            self.consecutive_successes += 1;
            self.consecutive_failures = 0;

            if !self.is_healthy && self.consecutive_successes >= success_threshold {
                self.is_healthy = true;
                return Some(true);
            }
        } else {
            self.consecutive_failures += 1;
            self.consecutive_successes = 0;

            if self.is_healthy && self.consecutive_failures >= failure_threshold {
                self.is_healthy = false;
                return Some(false);
            }
        }
        None
    }
}

pub struct HealthMonitor {
    pool: BackendPool,
    lifecycle: Arc<dyn LifecycleManager>,
    config: MonitorConfig,
    shutdown_rx: watch::Receiver<bool>,
}

impl HealthMonitor {
    pub fn new(
        pool: BackendPool,
        lifecycle: Arc<dyn LifecycleManager>,
        config: MonitorConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            pool,
            lifecycle,
            config,
            shutdown_rx,
        }
    }

    pub async fn run(mut self) {
        info!(
            interval_ms = self.config.interval_ms,
            ping_path = %self.config.ping_path,
            backends = self.pool.len(),
            "Health monitor started"
        );

        let mut states: Vec<BackendHealthState> =
            self.pool.iter().map(|_| BackendHealthState::default()).collect();

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.interval()) => {
                    self.probe_round(&mut states).await;
                }
                changed = self.shutdown_rx.changed() => {
                    // A dropped sender counts as shutdown
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        info!("Health monitor shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Probe every backend once and log transitions
    pub async fn probe_round(&self, states: &mut [BackendHealthState]) {
        let probes = self.pool.iter().map(|handle| self.lifecycle.is_healthy(handle));
        // All probes in a round run concurrently
        let results = join_all(probes).await;

        for ((handle, state), ok) in self.pool.iter().zip(states.iter_mut()).zip(results) {
            debug!(backend = %handle, healthy = ok, "Probe finished");

            match state.record(ok, self.config.failure_threshold, self.config.success_threshold) {
                Some(true) => {
                    info!(backend = %handle, index = handle.index(), "Backend is now healthy");
                }
                Some(false) => {
                    warn!(
                        backend = %handle,
                        index = handle.index(),
                        failures = state.consecutive_failures,
                        "Backend is now unhealthy"
                    );
                }
                None => {}
            }
        }
    }
}
