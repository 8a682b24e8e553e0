//! Backend selection policies
//!
//! The front door asks a [`SelectionStrategy`] for one handle per request.
//! Uniform random selection is the default; round-robin is available for
//! deployments that prefer an even, deterministic spread.

use crate::backend::{BackendHandle, BackendPool};
use rand::Rng;
use serde::Deserialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Picks the backend that serves a request
pub trait SelectionStrategy: Send + Sync {
    fn pick<'a>(&self, pool: &'a BackendPool) -> &'a BackendHandle;

    fn name(&self) -> &'static str;
}

/// Uniform choice over `[0, N)`, independent per request
#[derive(Debug, Default)]
pub struct UniformRandom;

impl SelectionStrategy for UniformRandom {
    fn pick<'a>(&self, pool: &'a BackendPool) -> &'a BackendHandle {
        let index = rand::thread_rng().gen_range(0..pool.len());
        pool.get(index).expect("index drawn from 0..len")
    }

    fn name(&self) -> &'static str {
        "random"
    }
}

/// Cycles through backends in pool order
#[derive(Debug, Default)]
pub struct RoundRobin {
    next: AtomicUsize,
}

impl SelectionStrategy for RoundRobin {
    fn pick<'a>(&self, pool: &'a BackendPool) -> &'a BackendHandle {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % pool.len();
        pool.get(index).expect("index reduced modulo len")
    }

    fn name(&self) -> &'static str {
        "round-robin"
    }
}

/// Strategy names accepted in configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum LoadBalanceStrategy {
    #[default]
    #[serde(rename = "random", alias = "uniform")]
    Random,
    #[serde(rename = "round-robin", alias = "round_robin")]
    RoundRobin,
}

impl LoadBalanceStrategy {
    pub fn build(self) -> Arc<dyn SelectionStrategy> {
        match self {
            LoadBalanceStrategy::Random => Arc::new(UniformRandom),
            LoadBalanceStrategy::RoundRobin => Arc::new(RoundRobin::default()),
        }
    }
}
