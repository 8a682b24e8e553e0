//! Backend handles and the immutable backend pool

use crate::error::ConfigError;
use hyper::http::uri::Authority;
use std::fmt;
use std::sync::Arc;

/// One addressable backend instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendHandle {
    index: usize,
    authority: Authority,
}

impl BackendHandle {
    pub fn new(index: usize, authority: Authority) -> Self {
        Self { index, authority }
    }

    /// Position of this backend in the pool
    pub fn index(&self) -> usize {
        self.index
    }

    /// `host:port` the backend is reached at
    pub fn authority(&self) -> &Authority {
        &self.authority
    }
}

impl fmt::Display for BackendHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} ({})", self.index, self.authority)
    }
}

/// Fixed, non-empty set of backends shared read-only across requests.
///
/// Cloning is cheap; all clones point at the same handles.
#[derive(Debug, Clone)]
pub struct BackendPool {
    handles: Arc<[BackendHandle]>,
}

impl BackendPool {
    /// Build a pool. Handles are re-indexed by position.
    pub fn new(handles: Vec<BackendHandle>) -> Result<Self, ConfigError> {
        if handles.is_empty() {
            return Err(ConfigError::EmptyPool);
        }

        let handles: Vec<BackendHandle> = handles
            .into_iter()
            .enumerate()
            .map(|(index, handle)| BackendHandle::new(index, handle.authority))
            .collect();

        Ok(Self {
            handles: handles.into(),
        })
    }

    /// Number of backends (always at least 1)
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Always false; kept for API symmetry with `len`
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&BackendHandle> {
        self.handles.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &BackendHandle> {
        self.handles.iter()
    }
}
