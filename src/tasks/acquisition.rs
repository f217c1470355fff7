// SoundWatch - Acquisition Task
//
// Every poll interval: service the Wi-Fi and broker state machines, ask the
// sound-level module for a fresh value and push the latest known value to the
// publication task. A failed poll keeps the previous value.

use std::sync::mpsc::SyncSender;
use std::thread;
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::drivers::modbus::{FieldBusClient, SerialPort};
use crate::events::Reading;
use crate::net::mqtt::{BrokerSession, PubSubClient};
use crate::net::wifi::{ConnectivityManager, WirelessLink};

pub struct AcquisitionTask<P, L, C> {
    bus: FieldBusClient<P>,
    device_address: u8,
    register_address: u16,
    register_count: u16,
    connectivity: ConnectivityManager<L>,
    session: BrokerSession<C, L>,
    last_value: Option<f32>,
}

impl<P, L, C> AcquisitionTask<P, L, C>
where
    P: SerialPort,
    L: WirelessLink,
    C: PubSubClient,
{
    pub fn new(
        config: &Config,
        bus: FieldBusClient<P>,
        connectivity: ConnectivityManager<L>,
        session: BrokerSession<C, L>,
    ) -> Self {
        Self {
            bus,
            device_address: config.device_address,
            register_address: config.register_address,
            register_count: config.register_count,
            connectivity,
            session,
            last_value: None,
        }
    }

    /// One poll cycle. Returns the reading to forward, which is the previous
    /// value if this poll failed, or `None` before the first good value.
    pub fn tick(&mut self, now: Instant) -> Option<Reading> {
        self.connectivity.tick(now);
        self.session.check_connection(now);

        match self
            .bus
            .read_decibels(self.device_address, self.register_address, self.register_count)
        {
            Ok(value_db) => {
                log::debug!("Sound level: {:.1} dB", value_db);
                self.last_value = Some(value_db);
            }
            Err(e) => log::warn!("Sensor read failed: {}", e),
        }

        self.last_value.map(|value_db| Reading {
            value_db,
            captured: now,
        })
    }
}

pub fn acquisition_task<P, L, C>(
    mut task: AcquisitionTask<P, L, C>,
    reading_tx: SyncSender<Reading>,
    interval: Duration,
) where
    P: SerialPort,
    L: WirelessLink,
    C: PubSubClient,
{
    log::info!("Acquisition task started");

    loop {
        let tick_start = Instant::now();

        if let Some(reading) = task.tick(tick_start) {
            // Blocks while the channel is full, so every reading reaches the window.
            if reading_tx.send(reading).is_err() {
                log::warn!("Reading channel closed, exiting acquisition task");
                return;
            }
        }

        let elapsed = tick_start.elapsed();
        if elapsed < interval {
            thread::sleep(interval - elapsed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::crc;
    use crate::error::{FieldBusError, LinkError, PublishError};
    use crate::net::wifi::ConnectivityIntent;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::sync::Arc;

    /// Each poll is answered with the next scripted response; `None` is a
    /// silent line.
    struct SensorScript(VecDeque<Option<Vec<u8>>>, Option<Vec<u8>>);

    impl SerialPort for SensorScript {
        fn write(&mut self, _bytes: &[u8]) -> Result<(), FieldBusError> {
            self.1 = self.0.pop_front().flatten();
            Ok(())
        }

        fn read(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize, FieldBusError> {
            match self.1.take() {
                Some(frame) => {
                    let n = frame.len().min(buf.len());
                    buf[..n].copy_from_slice(&frame[..n]);
                    Ok(n)
                }
                None => Ok(0),
            }
        }
    }

    fn frame(raw: u16) -> Option<Vec<u8>> {
        let [hi, lo] = raw.to_be_bytes();
        let mut f = vec![0x01, 0x03, 0x02, hi, lo];
        f.extend_from_slice(&crc::crc16(&f).to_le_bytes());
        Some(f)
    }

    #[derive(Default)]
    struct Offline {
        connects: AtomicUsize,
        up: AtomicBool,
    }

    impl WirelessLink for Offline {
        fn is_up(&self) -> bool {
            self.up.load(Ordering::SeqCst)
        }
        fn connect(&self) -> Result<(), LinkError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn disconnect(&self) -> Result<(), LinkError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct IdleBroker {
        reconnects: AtomicUsize,
    }

    impl PubSubClient for IdleBroker {
        fn is_connected(&self) -> bool {
            false
        }
        fn reconnect(&self) -> Result<(), PublishError> {
            self.reconnects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn publish(&self, _topic: &str, _payload: &[u8]) -> Result<(), PublishError> {
            Err(PublishError::NotConnected)
        }
    }

    type Task = AcquisitionTask<SensorScript, Arc<Offline>, Arc<IdleBroker>>;

    fn task(script: Vec<Option<Vec<u8>>>) -> (Task, Arc<ConnectivityIntent>, Arc<Offline>, Arc<IdleBroker>) {
        let config = Config::default();
        let link = Arc::new(Offline::default());
        let broker = Arc::new(IdleBroker::default());
        let intent = Arc::new(ConnectivityIntent::new(false));
        let bus = FieldBusClient::new(SensorScript(script.into(), None), Duration::from_millis(5));
        let manager = ConnectivityManager::new(Arc::clone(&link), Arc::clone(&intent), Duration::from_secs(60));
        let session = BrokerSession::new(Arc::clone(&broker), Arc::clone(&link), Duration::from_secs(5));
        (AcquisitionTask::new(&config, bus, manager, session), intent, link, broker)
    }

    #[test]
    fn nothing_is_forwarded_before_the_first_good_value() {
        let (mut task, ..) = task(vec![None]);
        assert_eq!(task.tick(Instant::now()), None);
    }

    #[test]
    fn failed_polls_repeat_the_previous_value() {
        let mut corrupted = frame(500);
        if let Some(bytes) = corrupted.as_mut() {
            bytes[3] ^= 0xFF;
        }
        let (mut task, ..) = task(vec![frame(652), None, corrupted, frame(700)]);
        let now = Instant::now();

        let values: Vec<f32> = (0..4).filter_map(|_| task.tick(now)).map(|r| r.value_db).collect();

        assert_eq!(values, vec![65.2, 65.2, 65.2, 70.0]);
    }

    #[test]
    fn tick_services_the_button_and_the_broker() {
        let (mut task, intent, link, broker) = task(vec![frame(600)]);
        intent.request_toggle();

        task.tick(Instant::now());

        assert_eq!(link.connects.load(Ordering::SeqCst), 1);
        // Link still down, so no broker reconnect yet.
        assert_eq!(broker.reconnects.load(Ordering::SeqCst), 0);

        link.up.store(true, Ordering::SeqCst);
        task.tick(Instant::now() + Duration::from_secs(5));
        assert_eq!(broker.reconnects.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn loop_exits_when_the_consumer_is_gone() {
        let (task, ..) = task(vec![frame(600)]);
        let (tx, rx) = mpsc::sync_channel(1);
        drop(rx);

        acquisition_task(task, tx, Duration::from_millis(1));
    }

    #[test]
    fn full_channel_holds_back_readings_instead_of_dropping_them() {
        let script: Vec<_> = (1..=10).map(frame).collect();
        let (task, ..) = task(script);
        let (tx, rx) = mpsc::sync_channel(1);

        let worker = thread::spawn(move || acquisition_task(task, tx, Duration::from_millis(1)));
        // Let the producer run into the full channel before consuming.
        thread::sleep(Duration::from_millis(100));

        let received: Vec<f32> = (0..10).map(|_| rx.recv().unwrap().value_db).collect();
        drop(rx);
        worker.join().unwrap();

        let expected: Vec<f32> = (1..=10u16).map(|raw| f32::from(raw) / 10.0).collect();
        assert_eq!(received, expected);
    }
}
