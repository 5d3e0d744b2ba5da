//! Per-key gates for de-duplicating concurrent cache misses within this process.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

type Gates = HashMap<String, Arc<Mutex<()>>>;

/// Hands out one async gate per key. Holding a `FlightPermit` means no other
/// caller in this process is computing the same key.
#[derive(Default)]
pub(crate) struct SingleFlight {
    gates: parking_lot::Mutex<Gates>,
}

impl SingleFlight {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive use of `key`.
    pub(crate) async fn acquire(self: &Arc<Self>, key: &str) -> FlightPermit {
        let gate = {
            let mut gates = self.gates.lock();
            sweep(&mut gates);
            Arc::clone(gates.entry(key.to_string()).or_default())
        };
        let guard = gate.lock_owned().await;
        FlightPermit {
            flights: Arc::clone(self),
            guard: Some(guard),
        }
    }

    /// Number of keys with a gate currently allocated.
    #[cfg(test)]
    pub(crate) fn in_flight(&self) -> usize {
        self.gates.lock().len()
    }
}

/// Drop gates that only the map still references.
///
/// A waiter cancelled after the holder released leaves such a gate behind.
fn sweep(gates: &mut Gates) {
    gates.retain(|_, gate| Arc::strong_count(gate) > 1);
}

/// Releases the gate on drop and forgets it once nobody else is waiting.
pub(crate) struct FlightPermit {
    flights: Arc<SingleFlight>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for FlightPermit {
    fn drop(&mut self) {
        // Unlock first so the strong count below reflects only waiters and the map.
        self.guard.take();
        sweep(&mut self.flights.gates.lock());
    }
}
