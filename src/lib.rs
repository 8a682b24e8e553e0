//! Frontdoor - a load-balancing HTTP front door
//!
//! This library provides a small reverse proxy that:
//! - Answers a liveness path directly, without touching any backend
//! - Forwards every other request, unmodified, to one backend of a fixed pool
//! - Picks the backend per request through a pluggable selection strategy
//!   (uniform random by default)
//! - Leaves backend start/stop to an external lifecycle manager
//! - Optionally monitors backend health in the background and logs transitions

pub mod backend;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod monitor;
pub mod pool;
pub mod proxy;
pub mod strategy;
