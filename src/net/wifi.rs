// SoundWatch - Wireless Link Manager
//
// The user button flips connectivity on and off; while the user wants to be
// online, a dropped link is retried on a fixed cooldown. The link state is
// always queried from the driver, never cached here.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::error::LinkError;

/// Station-mode wireless link. Connect and disconnect only issue the request;
/// completion shows up later through `is_up`.
pub trait WirelessLink: Send + Sync {
    fn is_up(&self) -> bool;
    fn connect(&self) -> Result<(), LinkError>;
    fn disconnect(&self) -> Result<(), LinkError>;
}

impl<L: WirelessLink + ?Sized> WirelessLink for Arc<L> {
    fn is_up(&self) -> bool {
        (**self).is_up()
    }

    fn connect(&self) -> Result<(), LinkError> {
        (**self).connect()
    }

    fn disconnect(&self) -> Result<(), LinkError> {
        (**self).disconnect()
    }
}

// ---------------------------------------------------------------------------
// Connectivity intent: the flag pair shared with the button handler
// ---------------------------------------------------------------------------

/// `toggle_requested` is written by the button handler and consumed by the
/// manager; `auto_retry_active` is written by the manager only.
#[derive(Debug)]
pub struct ConnectivityIntent {
    toggle_requested: AtomicBool,
    auto_retry_active: AtomicBool,
}

impl ConnectivityIntent {
    pub fn new(auto_retry: bool) -> Self {
        Self {
            toggle_requested: AtomicBool::new(false),
            auto_retry_active: AtomicBool::new(auto_retry),
        }
    }

    /// Safe to call from interrupt context.
    pub fn request_toggle(&self) {
        self.toggle_requested.store(true, Ordering::Release);
    }

    /// Read and clear the toggle in one step, so a press is seen exactly once.
    pub fn take_toggle(&self) -> bool {
        self.toggle_requested.swap(false, Ordering::AcqRel)
    }

    pub fn toggle_pending(&self) -> bool {
        self.toggle_requested.load(Ordering::Acquire)
    }

    pub fn auto_retry_active(&self) -> bool {
        self.auto_retry_active.load(Ordering::Acquire)
    }

    fn set_auto_retry(&self, active: bool) {
        self.auto_retry_active.store(active, Ordering::Release);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connected,
}

/// What a control tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkAction {
    Idle,
    Connecting,
    Disconnected,
    Retrying,
    /// The driver refused to issue the request.
    Failed,
}

pub struct ConnectivityManager<L> {
    link: L,
    intent: Arc<ConnectivityIntent>,
    cooldown: Duration,
    last_attempt: Option<Instant>,
}

impl<L: WirelessLink> ConnectivityManager<L> {
    pub fn new(link: L, intent: Arc<ConnectivityIntent>, cooldown: Duration) -> Self {
        Self {
            link,
            intent,
            cooldown,
            last_attempt: None,
        }
    }

    pub fn state(&self) -> LinkState {
        if self.link.is_up() {
            LinkState::Connected
        } else {
            LinkState::Disconnected
        }
    }

    pub fn intent(&self) -> &Arc<ConnectivityIntent> {
        &self.intent
    }

    /// Bring the link up at boot, waiting at most `timeout`.
    ///
    /// Returns whether the link came up. Failure is not fatal; the retry
    /// schedule picks it up later.
    pub fn establish(&mut self, timeout: Duration, poll: Duration) -> bool {
        log::info!("Connecting to Wi-Fi…");
        self.last_attempt = Some(Instant::now());

        if let Err(e) = self.link.connect() {
            log::warn!("Wi-Fi connect failed to start: {}", e);
            return false;
        }

        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.link.is_up() {
                log::info!("Wi-Fi connected");
                return true;
            }
            thread::sleep(poll);
        }

        let up = self.link.is_up();
        if !up {
            log::warn!("Wi-Fi not connected after {} ms, will retry later", timeout.as_millis());
        }
        up
    }

    /// One control step. Never blocks on the link.
    pub fn tick(&mut self, now: Instant) -> LinkAction {
        let toggle = self.intent.take_toggle();

        match (toggle, self.state()) {
            (true, LinkState::Disconnected) => {
                log::info!("Button: connecting Wi-Fi");
                self.last_attempt = Some(now);
                match self.link.connect() {
                    Ok(()) => {
                        self.intent.set_auto_retry(true);
                        LinkAction::Connecting
                    }
                    Err(e) => {
                        log::warn!("Wi-Fi connect failed to start: {}", e);
                        LinkAction::Failed
                    }
                }
            }
            (true, LinkState::Connected) => {
                log::info!("Button: disconnecting Wi-Fi");
                self.intent.set_auto_retry(false);
                match self.link.disconnect() {
                    Ok(()) => LinkAction::Disconnected,
                    Err(e) => {
                        log::warn!("Wi-Fi disconnect failed: {}", e);
                        LinkAction::Failed
                    }
                }
            }
            (false, LinkState::Disconnected) if self.intent.auto_retry_active() => {
                let due = self
                    .last_attempt
                    .map_or(true, |at| now.saturating_duration_since(at) >= self.cooldown);
                if !due {
                    return LinkAction::Idle;
                }

                log::info!("Wi-Fi down, retrying connection");
                self.last_attempt = Some(now);
                match self.link.connect() {
                    Ok(()) => LinkAction::Retrying,
                    Err(e) => {
                        log::warn!("Wi-Fi retry failed to start: {}", e);
                        LinkAction::Failed
                    }
                }
            }
            _ => LinkAction::Idle,
        }
    }
}
