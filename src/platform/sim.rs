// SoundWatch - Host Simulation Board
//
// Runs the firmware pipeline on a workstation: a simulated Modbus sound-level
// module with occasional line noise and dropouts, a Wi-Fi link that takes a
// moment to associate, and a broker that logs what it receives. Pressing
// Enter stands in for the connectivity button.

use std::io::{self, BufRead};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use rand::Rng;

use crate::clock::{now_ms, WallClock};
use crate::config::Config;
use crate::drivers::crc;
use crate::drivers::modbus::{self, SerialPort, REQUEST_LEN};
use crate::error::{FieldBusError, LinkError, PublishError};
use crate::events::SessionEvent;
use crate::input::DebouncedToggle;
use crate::net::mqtt::{PubSubClient, SessionNotifier};
use crate::net::wifi::WirelessLink;
use crate::storage::DirVolume;

const DROPOUT_PROBABILITY: f64 = 0.03;
const CORRUPTION_PROBABILITY: f64 = 0.05;
const LINK_ASSOCIATION_TIME: Duration = Duration::from_millis(1500);

pub type Serial = SimSoundSensor;
pub type Link = SimLink;
pub type Broker = SimBroker;
pub type FlashVolume = DirVolume;
pub type TimeSync = WallClock;

pub fn init_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();
}

pub struct Board {
    pub serial: Serial,
    pub link: Arc<Link>,
    pub volume: FlashVolume,
}

impl Board {
    pub fn take(config: &Config) -> anyhow::Result<Self> {
        log::info!("Simulated board, backlog under {}", config.storage_path.display());
        Ok(Self {
            serial: SimSoundSensor::new(config.device_address),
            link: Arc::new(SimLink::new()),
            volume: DirVolume::new(&config.storage_path),
        })
    }
}

// ---------------------------------------------------------------------------
// Sound-level module
// ---------------------------------------------------------------------------

pub struct SimSoundSensor {
    device_address: u8,
    level_db: f32,
    pending: Vec<u8>,
}

impl SimSoundSensor {
    pub fn new(device_address: u8) -> Self {
        Self {
            device_address,
            level_db: 55.0,
            pending: Vec::new(),
        }
    }
}

impl SerialPort for SimSoundSensor {
    fn write(&mut self, bytes: &[u8]) -> Result<(), FieldBusError> {
        self.pending.clear();
        if bytes.len() != REQUEST_LEN || !crc::validate(bytes) || bytes[0] != self.device_address {
            // A real slave stays silent on a frame it does not accept.
            return Ok(());
        }

        let mut rng = rand::rng();
        if rng.random_bool(DROPOUT_PROBABILITY) {
            return Ok(());
        }

        self.level_db = (self.level_db + rng.random_range(-2.0f32..=2.0)).clamp(35.0, 95.0);
        let mut frame = modbus::build_response(self.device_address, (self.level_db * 10.0).round() as u16);
        if rng.random_bool(CORRUPTION_PROBABILITY) {
            let index = rng.random_range(0..frame.len());
            frame[index] ^= 0x10;
        }
        self.pending.extend_from_slice(&frame);
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, FieldBusError> {
        if self.pending.is_empty() {
            thread::sleep(timeout);
            return Ok(0);
        }
        let n = self.pending.len().min(buf.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }
}

// ---------------------------------------------------------------------------
// Wi-Fi
// ---------------------------------------------------------------------------

pub struct SimLink {
    up: AtomicBool,
    associating_since: Mutex<Option<Instant>>,
}

impl SimLink {
    pub fn new() -> Self {
        Self {
            up: AtomicBool::new(false),
            associating_since: Mutex::new(None),
        }
    }
}

impl Default for SimLink {
    fn default() -> Self {
        Self::new()
    }
}

impl WirelessLink for SimLink {
    fn is_up(&self) -> bool {
        let mut since = self.associating_since.lock().unwrap_or_else(PoisonError::into_inner);
        if since.is_some_and(|at| at.elapsed() >= LINK_ASSOCIATION_TIME) {
            *since = None;
            self.up.store(true, Ordering::Release);
            log::info!("[sim wifi] associated");
        }
        self.up.load(Ordering::Acquire)
    }

    fn connect(&self) -> Result<(), LinkError> {
        if self.up.load(Ordering::Acquire) {
            return Ok(());
        }
        let mut since = self.associating_since.lock().unwrap_or_else(PoisonError::into_inner);
        since.get_or_insert_with(Instant::now);
        Ok(())
    }

    fn disconnect(&self) -> Result<(), LinkError> {
        *self.associating_since.lock().unwrap_or_else(PoisonError::into_inner) = None;
        self.up.store(false, Ordering::Release);
        log::info!("[sim wifi] disconnected");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Broker
// ---------------------------------------------------------------------------

pub struct SimBroker {
    address: SocketAddr,
    link: Arc<SimLink>,
    connected: AtomicBool,
    notifier: SessionNotifier,
}

impl SimBroker {
    fn session_lost(&self) {
        if self.connected.swap(false, Ordering::AcqRel) {
            self.notifier.notify(SessionEvent::Disconnected);
        }
    }
}

impl PubSubClient for SimBroker {
    fn is_connected(&self) -> bool {
        if !self.link.is_up() {
            self.session_lost();
        }
        self.connected.load(Ordering::Acquire)
    }

    fn reconnect(&self) -> Result<(), PublishError> {
        if !self.link.is_up() {
            return Err(PublishError::NotConnected);
        }
        if !self.connected.swap(true, Ordering::AcqRel) {
            log::info!("[sim broker] session up at {}", self.address);
            self.notifier.notify(SessionEvent::Connected);
        }
        Ok(())
    }

    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), PublishError> {
        if !self.is_connected() {
            return Err(PublishError::NotConnected);
        }
        log::info!("[sim broker] {} <- {}", topic, String::from_utf8_lossy(payload));
        Ok(())
    }
}

/// Create the broker client. The session comes up right away if the link is.
pub fn start_broker(
    _config: &Config,
    address: SocketAddr,
    link: Arc<Link>,
    notifier: SessionNotifier,
) -> anyhow::Result<Arc<Broker>> {
    let broker = Arc::new(SimBroker {
        address,
        link,
        connected: AtomicBool::new(false),
        notifier,
    });
    if let Err(e) = broker.reconnect() {
        log::warn!("[sim broker] not connected yet: {}", e);
    }
    Ok(broker)
}

pub fn start_time_sync() -> anyhow::Result<TimeSync> {
    Ok(WallClock)
}

/// Enter on stdin counts as one button press.
pub fn install_button(toggle: Arc<DebouncedToggle>) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("button".into())
        .spawn(move || {
            log::info!("Press Enter to toggle Wi-Fi");
            for line in io::stdin().lock().lines() {
                if line.is_err() {
                    break;
                }
                toggle.on_edge(now_ms());
            }
        })?;
    Ok(())
}
