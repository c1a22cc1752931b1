//! TTL-bounded discovery cache.
//!
//! The cached device list sits behind a plain mutex that is never held
//! across an await. Refreshes are serialized by a separate async gate so
//! that callers arriving during a refresh wait for it and then read the
//! fresh result instead of invoking the tool again.

use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::device::{Device, DiscoveryError};

/// Default time a discovery result stays valid.
pub const DEFAULT_DISCOVERY_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug)]
struct Snapshot {
    devices: Vec<Device>,
    refreshed_at: Instant,
    /// Cleared by [`DiscoveryCache::invalidate`].
    valid: bool,
}

#[derive(Debug)]
pub struct DiscoveryCache {
    ttl: Duration,
    state: Mutex<Option<Snapshot>>,
    refresh_gate: tokio::sync::Mutex<()>,
}

impl DiscoveryCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            state: Mutex::new(None),
            refresh_gate: tokio::sync::Mutex::new(()),
        }
    }

    fn state(&self) -> MutexGuard<'_, Option<Snapshot>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The cached list, if still inside the TTL window.
    pub fn fresh(&self) -> Option<Vec<Device>> {
        let state = self.state();
        state
            .as_ref()
            .filter(|s| s.valid && s.refreshed_at.elapsed() < self.ttl)
            .map(|s| s.devices.clone())
    }

    /// Return the cached list or run `refresh` to rebuild it.
    ///
    /// A failed refresh leaves the previous snapshot in place (still
    /// expired) so the next caller retries.
    pub async fn get_or_refresh<F, Fut>(&self, refresh: F) -> Result<Vec<Device>, DiscoveryError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<Device>, DiscoveryError>>,
    {
        if let Some(devices) = self.fresh() {
            debug!(devices = devices.len(), "Using cached devices");
            return Ok(devices);
        }

        let _gate = self.refresh_gate.lock().await;
        if let Some(devices) = self.fresh() {
            return Ok(devices);
        }

        let devices = refresh().await?;
        *self.state() = Some(Snapshot {
            devices: devices.clone(),
            refreshed_at: Instant::now(),
            valid: true,
        });
        Ok(devices)
    }

    /// Force the next lookup to refresh.
    pub fn invalidate(&self) {
        if let Some(snapshot) = self.state().as_mut() {
            snapshot.valid = false;
        }
    }

    /// Find a device from the most recent discovery, regardless of age.
    pub fn lookup(&self, id: &str) -> Option<Device> {
        self.state()
            .as_ref()
            .and_then(|s| s.devices.iter().find(|d| d.id == id).cloned())
    }
}

impl Default for DiscoveryCache {
    fn default() -> Self {
        Self::new(DEFAULT_DISCOVERY_TTL)
    }
}
