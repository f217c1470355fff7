// SoundWatch - Button Input
//
// Falling-edge handler for the connectivity button. The first edge of a press
// raises the toggle request and starts a short lockout; contact bounce inside
// the lockout is ignored. Runs in interrupt context on the device, so it only
// touches atomics.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::net::wifi::ConnectivityIntent;

/// `last_press` holds the accepted edge time plus one; 0 means no press yet.
pub struct DebouncedToggle {
    intent: Arc<ConnectivityIntent>,
    debounce_ms: u32,
    last_press: AtomicU32,
}

impl DebouncedToggle {
    pub fn new(intent: Arc<ConnectivityIntent>, debounce: Duration) -> Self {
        Self {
            intent,
            debounce_ms: debounce.as_millis() as u32,
            last_press: AtomicU32::new(0),
        }
    }

    /// Handle one falling edge seen at `now_ms` (wrapping milliseconds since
    /// boot). Returns whether the edge counted as a press.
    pub fn on_edge(&self, now_ms: u32) -> bool {
        let last = self.last_press.load(Ordering::Acquire);
        if last != 0 && now_ms.wrapping_sub(last - 1) < self.debounce_ms {
            return false;
        }

        // Two edges racing for the same press: only one wins the exchange.
        let accepted = self
            .last_press
            .compare_exchange(last, now_ms.wrapping_add(1), Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if accepted {
            self.intent.request_toggle();
        }
        accepted
    }
}
