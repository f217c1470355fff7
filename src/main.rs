// SoundWatch - Firmware Entry Point
//
// Boot sequence:
//   1. Load the configuration and mount the backlog partition. A partition
//      that cannot be mounted even after a format stops the boot.
//   2. Arm the connectivity button.
//   3. Bring up Wi-Fi (bounded wait; the retry schedule takes over on failure).
//   4. Resolve the broker and start the MQTT client.
//   5. Synchronize the calendar clock (best-effort).
//   6. Spawn the acquisition and publication tasks, or step both on one
//      thread with the `single-core` feature.

use std::sync::Arc;
#[cfg(not(feature = "single-core"))]
use std::thread;
use std::time::Duration;

use anyhow::Context;

use soundwatch::clock::{self, CalendarClock, ClockStatus};
use soundwatch::config::*;
use soundwatch::display::LogDisplay;
use soundwatch::drivers::modbus::FieldBusClient;
use soundwatch::input::DebouncedToggle;
use soundwatch::net::mqtt::{session_channel, BrokerSession, TelemetryPublisher};
use soundwatch::net::resolve;
use soundwatch::net::wifi::{ConnectivityIntent, ConnectivityManager};
use soundwatch::platform::{self, Board};
use soundwatch::storage::{self, OfflineQueue};
use soundwatch::tasks::{self, AcquisitionTask, PublicationTask};

fn main() -> anyhow::Result<()> {
    platform::init_logging();
    log::info!("SoundWatch firmware starting…");

    let config = Config::load().context("invalid configuration")?;
    let mut board = Board::take(&config)?;

    // ---- Backlog storage --------------------------------------------------
    let store = storage::initialize(&mut board.volume).context("backlog storage unavailable")?;
    let queue = OfflineQueue::open(store)?;

    // ---- Connectivity -----------------------------------------------------
    // Auto-retry starts enabled: the device boots wanting to be online.
    let intent = Arc::new(ConnectivityIntent::new(true));
    if let Err(e) = platform::install_button(Arc::new(DebouncedToggle::new(Arc::clone(&intent), config.debounce))) {
        log::warn!("Connectivity button unavailable: {:#}", e);
    }

    let mut connectivity = ConnectivityManager::new(
        Arc::clone(&board.link),
        intent,
        Duration::from_secs(WIFI_RETRY_COOLDOWN_SECS),
    );
    connectivity.establish(
        Duration::from_millis(WIFI_BOOT_CONNECT_TIMEOUT_MS),
        Duration::from_millis(WIFI_BOOT_POLL_MS),
    );

    // ---- Broker -----------------------------------------------------------
    let broker_addr = resolve::resolve_with_fallback(
        &config.broker_host,
        config.broker_port,
        config.broker_fallback,
        Duration::from_millis(DNS_TIMEOUT_MS),
    );
    let (notifier, session_events) = session_channel();
    // Without a client every window goes to the backlog until the next boot.
    let broker = platform::start_broker(&config, broker_addr, Arc::clone(&board.link), notifier)
        .map_err(|e| log::warn!("MQTT client unavailable, running locally: {:#}", e))
        .ok();

    // ---- Calendar clock ---------------------------------------------------
    // Kept alive for the rest of the program so the clock stays disciplined.
    let time_sync = platform::start_time_sync()
        .map_err(|e| log::warn!("Time sync unavailable: {:#}", e))
        .ok();
    let clock_status = match &time_sync {
        Some(source) => clock::synchronize(
            source,
            TIME_SYNC_RETRIES,
            Duration::from_millis(TIME_SYNC_INTERVAL_MS),
        ),
        None => ClockStatus::BestEffort,
    };
    let calendar = CalendarClock::new(config.utc_offset_hours, clock_status)?;

    // ---- Tasks ------------------------------------------------------------
    let bus = FieldBusClient::new(board.serial, Duration::from_millis(MODBUS_RESPONSE_TIMEOUT_MS));
    let session = BrokerSession::new(
        broker.clone(),
        Arc::clone(&board.link),
        Duration::from_millis(MQTT_CHECK_INTERVAL_MS),
    );
    let acquisition = AcquisitionTask::new(&config, bus, connectivity, session);

    let publisher = TelemetryPublisher::new(
        broker,
        Arc::clone(&board.link),
        config.topic.clone(),
        queue,
        session_events,
    );
    let publication = PublicationTask::new(
        config.window_length,
        config.site(),
        calendar,
        publisher,
        LogDisplay::new(),
    );

    log::info!("Boot complete, entering normal operation");

    #[cfg(feature = "single-core")]
    {
        tasks::run_cooperative(acquisition, publication, config.poll_interval);
    }

    #[cfg(not(feature = "single-core"))]
    {
        let (reading_tx, reading_rx) = std::sync::mpsc::sync_channel(READING_CHANNEL_DEPTH);
        let poll_interval = config.poll_interval;

        // Acquisition: Wi-Fi/broker supervision and the Modbus poll.
        thread::Builder::new()
            .name("acquisition".into())
            .stack_size(STACK_ACQUISITION)
            .spawn(move || {
                tasks::acquisition_task(acquisition, reading_tx, poll_interval);
            })?;

        // Publication: aggregation, MQTT and the offline backlog.
        thread::Builder::new()
            .name("publication".into())
            .stack_size(STACK_PUBLICATION)
            .spawn(move || {
                tasks::publication_task(publication, reading_rx, poll_interval);
            })?;

        // Main thread has nothing left to do. Park it forever.
        loop {
            thread::sleep(Duration::from_secs(60));
        }
    }
}
