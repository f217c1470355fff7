// SoundWatch - ESP-IDF Board Support
//
// Peripherals of the real node: RS-485 transceiver on UART1, Wi-Fi station,
// the ESP-IDF MQTT client, a SPIFFS partition for the backlog, SNTP, and the
// connectivity button on a GPIO interrupt.

use std::ffi::{c_void, CString};
use std::net::SocketAddr;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{anyhow, Context};
use esp_idf_hal::delay::TickType;
use esp_idf_hal::gpio::AnyIOPin;
use esp_idf_hal::peripherals::Peripherals;
use esp_idf_hal::uart::{config::Config as UartConfig, UartDriver};
use esp_idf_hal::units::Hertz;
use esp_idf_svc::eventloop::EspSystemEventLoop;
use esp_idf_svc::nvs::EspDefaultNvsPartition;
use esp_idf_svc::sntp::{EspSntp, SyncStatus};
use esp_idf_svc::wifi::{AuthMethod, ClientConfiguration, Configuration, EspWifi};
use esp_idf_sys::*;

use crate::clock::{now_ms, TimeSource, WallClock};
use crate::config::*;
use crate::drivers::modbus::SerialPort;
use crate::error::{FieldBusError, LinkError, PublishError, StorageError};
use crate::events::SessionEvent;
use crate::input::DebouncedToggle;
use crate::net::mqtt::{PubSubClient, SessionNotifier};
use crate::net::wifi::WirelessLink;
use crate::storage::Volume;

pub type Serial = UartPort;
pub type Link = EspLink;
pub type Broker = EspBroker;
pub type FlashVolume = SpiffsVolume;
pub type TimeSync = SntpTime;

pub fn init_logging() {
    // Link esp-idf-sys runtime patches and initialise logging.
    esp_idf_svc::sys::link_patches();
    esp_idf_svc::log::EspLogger::initialize_default();
}

pub struct Board {
    pub serial: Serial,
    pub link: Arc<Link>,
    pub volume: FlashVolume,
}

impl Board {
    pub fn take(config: &Config) -> anyhow::Result<Self> {
        let peripherals = Peripherals::take()?;
        let sysloop = EspSystemEventLoop::take()?;
        let nvs = EspDefaultNvsPartition::take()?;

        // ---- RS-485 sound-level module: TX = PIN_UART_TX, RX = PIN_UART_RX --
        let uart_config = UartConfig::default().baudrate(Hertz(UART_BAUD_RATE));
        let uart = UartDriver::new(
            peripherals.uart1,
            peripherals.pins.gpio8,
            peripherals.pins.gpio9,
            Option::<AnyIOPin>::None,
            Option::<AnyIOPin>::None,
            &uart_config,
        )
        .context("UART init failed")?;

        // ---- Wi-Fi station ----------------------------------------------------
        let mut wifi = EspWifi::new(peripherals.modem, sysloop, Some(nvs))?;
        wifi.set_configuration(&Configuration::Client(ClientConfiguration {
            ssid: config
                .wifi_ssid
                .as_str()
                .try_into()
                .map_err(|_| anyhow!("SSID too long"))?,
            password: config
                .wifi_password
                .as_str()
                .try_into()
                .map_err(|_| anyhow!("Wi-Fi password too long"))?,
            auth_method: if config.wifi_password.is_empty() {
                AuthMethod::None
            } else {
                AuthMethod::WPA2Personal
            },
            ..Default::default()
        }))?;
        wifi.start()?;

        Ok(Self {
            serial: UartPort(uart),
            link: Arc::new(EspLink {
                wifi: Mutex::new(wifi),
            }),
            volume: SpiffsVolume::new(&config.storage_path)?,
        })
    }
}

// ---------------------------------------------------------------------------
// UART
// ---------------------------------------------------------------------------

pub struct UartPort(UartDriver<'static>);

impl SerialPort for UartPort {
    fn write(&mut self, bytes: &[u8]) -> Result<(), FieldBusError> {
        // Drop late bytes of an earlier, timed-out response.
        self.0
            .clear_rx()
            .map_err(|e| FieldBusError::Serial(e.to_string()))?;
        self.0
            .write(bytes)
            .map(|_| ())
            .map_err(|e| FieldBusError::Serial(e.to_string()))
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, FieldBusError> {
        self.0
            .read(buf, TickType::from(timeout).ticks())
            .map_err(|e| FieldBusError::Serial(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Wi-Fi
// ---------------------------------------------------------------------------

pub struct EspLink {
    wifi: Mutex<EspWifi<'static>>,
}

impl WirelessLink for EspLink {
    fn is_up(&self) -> bool {
        let wifi = self.wifi.lock().unwrap_or_else(PoisonError::into_inner);
        wifi.is_up().unwrap_or(false)
    }

    fn connect(&self) -> Result<(), LinkError> {
        let mut wifi = self.wifi.lock().unwrap_or_else(PoisonError::into_inner);
        wifi.connect().map_err(|e| LinkError::Request(e.to_string()))
    }

    fn disconnect(&self) -> Result<(), LinkError> {
        let mut wifi = self.wifi.lock().unwrap_or_else(PoisonError::into_inner);
        wifi.disconnect().map_err(|e| LinkError::Request(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// MQTT (raw ESP-IDF client)
// ---------------------------------------------------------------------------

/// State shared with the client's event handler. Leaked: the handler may
/// fire at any time for the rest of the program.
struct SessionShared {
    connected: AtomicBool,
    notifier: SessionNotifier,
}

pub struct EspBroker {
    client: esp_mqtt_client_handle_t,
    shared: &'static SessionShared,
}

// SAFETY: the ESP-IDF MQTT client API is thread-safe; the handle is never
// freed.
unsafe impl Send for EspBroker {}
unsafe impl Sync for EspBroker {}

pub fn start_broker(
    config: &Config,
    address: SocketAddr,
    _link: Arc<Link>,
    notifier: SessionNotifier,
) -> anyhow::Result<Arc<Broker>> {
    let uri = CString::new(format!("mqtt://{}:{}", address.ip(), address.port()))?;
    let client_id = CString::new(config.client_id.as_str())?;
    let shared: &'static SessionShared = Box::leak(Box::new(SessionShared {
        connected: AtomicBool::new(false),
        notifier,
    }));

    let mqtt_config = esp_mqtt_client_config_t {
        broker: esp_mqtt_client_config_t_broker_t {
            address: esp_mqtt_client_config_t_broker_t_address_t {
                uri: uri.as_ptr(),
                ..Default::default()
            },
            ..Default::default()
        },
        credentials: esp_mqtt_client_config_t_credentials_t {
            client_id: client_id.as_ptr(),
            ..Default::default()
        },
        session: esp_mqtt_client_config_t_session_t {
            keepalive: MQTT_KEEP_ALIVE_SECS as i32,
            ..Default::default()
        },
        ..Default::default()
    };

    unsafe {
        let client = esp_mqtt_client_init(&mqtt_config);
        if client.is_null() {
            return Err(anyhow!("Failed to initialize MQTT client"));
        }
        esp!(esp_mqtt_client_register_event(
            client,
            esp_mqtt_event_id_t_MQTT_EVENT_ANY,
            Some(mqtt_event_handler),
            shared as *const SessionShared as *mut c_void,
        ))?;
        esp!(esp_mqtt_client_start(client)).context("MQTT client start failed")?;

        log::info!("MQTT client started for {}", address);
        Ok(Arc::new(EspBroker { client, shared }))
    }
}

unsafe extern "C" fn mqtt_event_handler(
    handler_args: *mut c_void,
    _base: esp_event_base_t,
    event_id: i32,
    _event_data: *mut c_void,
) {
    let shared = &*(handler_args as *const SessionShared);
    match event_id {
        id if id == esp_mqtt_event_id_t_MQTT_EVENT_CONNECTED as i32 => {
            shared.connected.store(true, Ordering::Release);
            shared.notifier.notify(SessionEvent::Connected);
        }
        id if id == esp_mqtt_event_id_t_MQTT_EVENT_DISCONNECTED as i32 => {
            if shared.connected.swap(false, Ordering::AcqRel) {
                shared.notifier.notify(SessionEvent::Disconnected);
            }
        }
        _ => {}
    }
}

impl PubSubClient for EspBroker {
    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    fn reconnect(&self) -> Result<(), PublishError> {
        esp!(unsafe { esp_mqtt_client_reconnect(self.client) })
            .map_err(|e| PublishError::Rejected(e.to_string()))
    }

    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), PublishError> {
        if !self.is_connected() {
            return Err(PublishError::NotConnected);
        }
        let topic = CString::new(topic).map_err(|e| PublishError::Rejected(e.to_string()))?;
        let msg_id = unsafe {
            esp_mqtt_client_publish(
                self.client,
                topic.as_ptr(),
                payload.as_ptr() as *const _,
                payload.len() as i32,
                1,
                0,
            )
        };
        if msg_id < 0 {
            return Err(PublishError::Rejected(format!("msg_id {}", msg_id)));
        }
        log::debug!("Queued MQTT message {}", msg_id);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// SPIFFS
// ---------------------------------------------------------------------------

pub struct SpiffsVolume {
    base_path: CString,
}

impl SpiffsVolume {
    pub fn new(base_path: &std::path::Path) -> anyhow::Result<Self> {
        let path = base_path
            .to_str()
            .ok_or_else(|| anyhow!("storage path is not UTF-8"))?;
        Ok(Self {
            base_path: CString::new(path)?,
        })
    }
}

impl Volume for SpiffsVolume {
    fn mount(&mut self) -> Result<std::path::PathBuf, StorageError> {
        let conf = esp_vfs_spiffs_conf_t {
            base_path: self.base_path.as_ptr(),
            partition_label: ptr::null(),
            max_files: STORAGE_MAX_FILES as _,
            format_if_mount_failed: false,
        };
        esp!(unsafe { esp_vfs_spiffs_register(&conf) }).map_err(|e| StorageError::Mount(e.to_string()))?;

        let (mut total, mut used) = (0usize, 0usize);
        if unsafe { esp_spiffs_info(ptr::null(), &mut total, &mut used) } == ESP_OK {
            log::info!("SPIFFS: {} of {} bytes used", used, total);
        }
        Ok(std::path::PathBuf::from(self.base_path.to_string_lossy().into_owned()))
    }

    fn format(&mut self) -> Result<(), StorageError> {
        log::warn!("Formatting SPIFFS partition…");
        esp!(unsafe { esp_spiffs_format(ptr::null()) }).map_err(|e| StorageError::Format(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// SNTP
// ---------------------------------------------------------------------------

pub struct SntpTime {
    sntp: EspSntp<'static>,
}

impl TimeSource for SntpTime {
    fn is_synchronized(&self) -> bool {
        self.sntp.get_sync_status() == SyncStatus::Completed || WallClock.is_synchronized()
    }
}

// SAFETY: the SNTP service only exposes a status query.
unsafe impl Sync for SntpTime {}

pub fn start_time_sync() -> anyhow::Result<TimeSync> {
    let sntp = EspSntp::new_default().context("SNTP start failed")?;
    log::info!("SNTP started");
    Ok(SntpTime { sntp })
}

// ---------------------------------------------------------------------------
// Button (falling edge, INPUT_PULLUP)
// ---------------------------------------------------------------------------

pub fn install_button(toggle: Arc<DebouncedToggle>) -> anyhow::Result<()> {
    let conf = gpio_config_t {
        pin_bit_mask: 1u64 << PIN_BUTTON,
        mode: gpio_mode_t_GPIO_MODE_INPUT,
        pull_up_en: gpio_pullup_t_GPIO_PULLUP_ENABLE,
        pull_down_en: gpio_pulldown_t_GPIO_PULLDOWN_DISABLE,
        intr_type: gpio_int_type_t_GPIO_INTR_NEGEDGE,
        ..Default::default()
    };

    unsafe {
        esp!(gpio_config(&conf))?;
        esp!(gpio_install_isr_service(0))?;
        // The handler keeps its reference for the rest of the program.
        esp!(gpio_isr_handler_add(
            PIN_BUTTON,
            Some(button_isr),
            Arc::into_raw(toggle) as *mut c_void,
        ))?;
    }
    log::info!("Button armed on GPIO{}", PIN_BUTTON);
    Ok(())
}

unsafe extern "C" fn button_isr(arg: *mut c_void) {
    let toggle = &*(arg as *const DebouncedToggle);
    toggle.on_edge(now_ms());
}
