//! At most one generation at a time; the newest request wins.
//!
//! Acquiring a permit cancels the generation currently holding one and then
//! waits until that generation has released it.

use log::debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;

struct Inner {
    gate: Arc<tokio::sync::Mutex<()>>,
    current: Mutex<Option<(u64, CancellationToken)>>,
    next_id: AtomicU64,
}

impl Inner {
    fn slot(&self) -> std::sync::MutexGuard<'_, Option<(u64, CancellationToken)>> {
        self.current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Clone)]
pub struct SingleFlight {
    inner: Arc<Inner>,
}

impl Default for SingleFlight {
    fn default() -> Self {
        Self::new()
    }
}

impl SingleFlight {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                gate: Arc::new(tokio::sync::Mutex::new(())),
                current: Mutex::new(None),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Cancels the running generation, waits for it to finish, and returns
    /// the permit for the next one.
    ///
    /// A request that is itself superseded while waiting gets a permit whose
    /// token is already cancelled.
    pub async fn acquire(&self) -> FlightPermit {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let previous = self.inner.slot().replace((id, cancel.clone()));
        if let Some((previous_id, previous_cancel)) = previous {
            debug!("Request {} cancels in-flight request {}", id, previous_id);
            previous_cancel.cancel();
        }

        let guard = self.inner.gate.clone().lock_owned().await;
        debug!("Request {} acquired the generation slot", id);
        FlightPermit {
            id,
            cancel,
            inner: self.inner.clone(),
            _guard: guard,
        }
    }

    /// Whether some request currently holds or waits for the slot.
    pub fn is_busy(&self) -> bool {
        self.inner.slot().is_some()
    }
}

/// Held for the whole generation, including streaming. Dropping it releases
/// the slot.
pub struct FlightPermit {
    id: u64,
    cancel: CancellationToken,
    inner: Arc<Inner>,
    _guard: OwnedMutexGuard<()>,
}

impl FlightPermit {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for FlightPermit {
    fn drop(&mut self) {
        let mut slot = self.inner.slot();
        if slot.as_ref().is_some_and(|(id, _)| *id == self.id) {
            *slot = None;
        }
    }
}
