//! Backend lifecycle seam
//!
//! Starting, idling out and restarting backends belongs to whatever platform
//! runs them. The front door only needs two questions answered, and asks them
//! through [`LifecycleManager`].

use crate::backend::BackendHandle;
use crate::pool::ConnectionPool;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("backend {backend} could not be started: {reason}")]
    StartFailed { backend: String, reason: String },
}

/// Contract with the collaborator that owns backend processes
#[async_trait]
pub trait LifecycleManager: Send + Sync {
    /// Make sure `handle` can take traffic. Called once per forwarded request.
    async fn ensure_running(&self, handle: &BackendHandle) -> Result<(), LifecycleError>;

    /// Probe `handle` without routing user traffic to it
    async fn is_healthy(&self, handle: &BackendHandle) -> bool;
}

/// Backends are started and stopped by the hosting platform.
///
/// `ensure_running` trusts the platform and returns immediately; a backend
/// that is down shows up as a connection error on the forwarded request.
pub struct ExternallyManaged {
    pool: Arc<ConnectionPool>,
    ping_path: String,
    probe_timeout: Duration,
}

impl ExternallyManaged {
    pub fn new(pool: Arc<ConnectionPool>, ping_path: impl Into<String>, probe_timeout: Duration) -> Self {
        Self {
            pool,
            ping_path: ping_path.into(),
            probe_timeout,
        }
    }
}

#[async_trait]
impl LifecycleManager for ExternallyManaged {
    async fn ensure_running(&self, _handle: &BackendHandle) -> Result<(), LifecycleError> {
        Ok(())
    }

    async fn is_healthy(&self, handle: &BackendHandle) -> bool {
        match tokio::time::timeout(
            self.probe_timeout,
            self.pool.check_backend(handle, &self.ping_path),
        )
        .await
        {
            Ok(healthy) => healthy,
            Err(_) => {
                debug!(backend = %handle, timeout_ms = self.probe_timeout.as_millis() as u64, "Ping timed out");
                false
            }
        }
    }
}
