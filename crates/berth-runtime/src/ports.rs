//! Host port allocation for published container ports.
//!
//! The allocator is a monitor over the set of leased host ports. It is the
//! only state shared between concurrently starting containers, so every
//! allocate and release goes through one mutex; no two live bindings ever
//! share a host port.

use std::collections::BTreeSet;
use std::net::TcpListener;
use std::sync::{Arc, Mutex, MutexGuard};

use berth_common::config::HarnessConfig;
use berth_common::error::{BerthError, Result};
use serde::{Deserialize, Serialize};

/// Attempts at drawing an OS ephemeral port that is not already leased.
const EPHEMERAL_ATTEMPTS: usize = 64;

/// A container port bound to a leased host port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortBinding {
    /// Port inside the container.
    pub container_port: u16,
    /// Leased host port.
    pub host_port: u16,
}

/// Issues and retires host port leases.
///
/// Cloning shares the lease set.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    host: String,
    range: Option<(u16, u16)>,
    leased: Arc<Mutex<BTreeSet<u16>>>,
}

impl PortAllocator {
    /// Creates an allocator probing `host`, drawing automatic ports from the
    /// OS ephemeral range.
    #[must_use]
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            range: None,
            leased: Arc::new(Mutex::new(BTreeSet::new())),
        }
    }

    /// Creates an allocator drawing automatic ports from `start..=end`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an empty or zero-based range.
    pub fn with_range(host: impl Into<String>, start: u16, end: u16) -> Result<Self> {
        if start == 0 || start > end {
            return Err(BerthError::config(format!("invalid port range {start}-{end}")));
        }
        let mut allocator = Self::new(host);
        allocator.range = Some((start, end));
        Ok(allocator)
    }

    /// Creates an allocator from the harness configuration.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the configured range is invalid.
    pub fn from_config(config: &HarnessConfig) -> Result<Self> {
        match config.port_range {
            Some((start, end)) => Self::with_range(config.host.clone(), start, end),
            None => Ok(Self::new(config.host.clone())),
        }
    }

    /// Host address ports are probed and published on.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Leases a host port for `container_port`.
    ///
    /// With `requested`, that exact port is leased if nobody holds it and the
    /// host can bind it. Without, any free port is chosen.
    ///
    /// # Errors
    ///
    /// Returns [`BerthError::PortInUse`] if the requested port is taken, or a
    /// configuration error if the automatic range is exhausted.
    pub fn allocate(&self, container_port: u16, requested: Option<u16>) -> Result<PortBinding> {
        let mut leased = self.lock()?;
        let host_port = match requested {
            Some(port) => {
                if leased.contains(&port) || !self.is_bindable(port) {
                    return Err(BerthError::PortInUse { port });
                }
                port
            }
            None => self.pick_free(&leased)?,
        };
        let _ = leased.insert(host_port);
        drop(leased);
        tracing::debug!(container_port, host_port, "leased host port");
        Ok(PortBinding {
            container_port,
            host_port,
        })
    }

    /// Returns a binding's host port to the pool. Returns whether it was
    /// leased; releasing twice is harmless.
    pub fn release(&self, binding: PortBinding) -> bool {
        let released = match self.lock() {
            Ok(mut leased) => leased.remove(&binding.host_port),
            Err(e) => {
                tracing::warn!(error = %e, "port pool unavailable, lease not returned");
                false
            }
        };
        if released {
            tracing::debug!(host_port = binding.host_port, "released host port");
        }
        released
    }

    /// Whether `host_port` is currently leased.
    #[must_use]
    pub fn is_leased(&self, host_port: u16) -> bool {
        self.lock().is_ok_and(|leased| leased.contains(&host_port))
    }

    /// Currently leased host ports, ascending.
    #[must_use]
    pub fn leased(&self) -> Vec<u16> {
        self.lock()
            .map(|leased| leased.iter().copied().collect())
            .unwrap_or_default()
    }

    fn pick_free(&self, leased: &BTreeSet<u16>) -> Result<u16> {
        if let Some((start, end)) = self.range {
            return (start..=end)
                .find(|port| !leased.contains(port) && self.is_bindable(*port))
                .ok_or_else(|| {
                    BerthError::config(format!("no free host port left in {start}-{end}"))
                });
        }
        for _ in 0..EPHEMERAL_ATTEMPTS {
            let listener = TcpListener::bind((self.host.as_str(), 0))
                .map_err(|e| BerthError::io(format!("binding an ephemeral port on {}", self.host), e))?;
            let port = listener
                .local_addr()
                .map_err(|e| BerthError::io("reading ephemeral port", e))?
                .port();
            if !leased.contains(&port) {
                return Ok(port);
            }
        }
        Err(BerthError::config(format!(
            "no unleased ephemeral port after {EPHEMERAL_ATTEMPTS} attempts"
        )))
    }

    /// The probe listener is closed right away so the runtime can bind it.
    fn is_bindable(&self, port: u16) -> bool {
        TcpListener::bind((self.host.as_str(), port)).is_ok()
    }

    fn lock(&self) -> Result<MutexGuard<'_, BTreeSet<u16>>> {
        self.leased
            .lock()
            .map_err(|_| BerthError::runtime("port pool lock poisoned"))
    }
}
