// SoundWatch - Tasks
//
// Dual-core builds run acquisition and publication on their own threads,
// joined by a bounded reading channel. The `single-core` build steps the same
// two tasks in turn on one thread.

pub mod acquisition;
pub mod publication;

use std::thread;
use std::time::{Duration, Instant};

use crate::display::StatusDisplay;
use crate::drivers::modbus::SerialPort;
use crate::net::mqtt::PubSubClient;
use crate::net::wifi::WirelessLink;
use crate::storage::BlobStore;

pub use acquisition::{acquisition_task, AcquisitionTask};
pub use publication::{publication_task, PublicationTask};

/// Run one acquisition cycle and hand its reading straight to publication.
pub fn step_cooperative<P, L, C, S, D>(
    acquisition: &mut AcquisitionTask<P, L, C>,
    publication: &mut PublicationTask<C, L, S, D>,
    now: Instant,
) where
    P: SerialPort,
    L: WirelessLink,
    C: PubSubClient,
    S: BlobStore,
    D: StatusDisplay,
{
    match acquisition.tick(now) {
        Some(reading) => {
            publication.handle(reading);
        }
        None => publication.idle(),
    }
}

pub fn run_cooperative<P, L, C, S, D>(
    mut acquisition: AcquisitionTask<P, L, C>,
    mut publication: PublicationTask<C, L, S, D>,
    interval: Duration,
) -> !
where
    P: SerialPort,
    L: WirelessLink,
    C: PubSubClient,
    S: BlobStore,
    D: StatusDisplay,
{
    log::info!("Cooperative task loop started");

    loop {
        let tick_start = Instant::now();
        step_cooperative(&mut acquisition, &mut publication, tick_start);

        let elapsed = tick_start.elapsed();
        if elapsed < interval {
            thread::sleep(interval - elapsed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{CalendarClock, ClockStatus};
    use crate::config::Config;
    use crate::drivers::crc;
    use crate::drivers::modbus::FieldBusClient;
    use crate::error::{FieldBusError, LinkError, PublishError};
    use crate::events::{DisplayStatus, SensorSite, SessionEvent};
    use crate::net::mqtt::{session_channel, BrokerSession, TelemetryPublisher};
    use crate::net::wifi::{ConnectivityIntent, ConnectivityManager};
    use crate::storage::{DirStore, OfflineQueue};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    const WINDOW: Duration = Duration::from_secs(60);

    /// Answers each request with the next scripted frame; `None` stays silent.
    struct Meter {
        script: VecDeque<Option<Vec<u8>>>,
        pending: Option<Vec<u8>>,
    }

    impl SerialPort for Meter {
        fn write(&mut self, _bytes: &[u8]) -> Result<(), FieldBusError> {
            self.pending = self.script.pop_front().flatten();
            Ok(())
        }

        fn read(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize, FieldBusError> {
            match self.pending.take() {
                Some(frame) => {
                    buf[..frame.len()].copy_from_slice(&frame);
                    Ok(frame.len())
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

    struct Wifi;

    impl WirelessLink for Wifi {
        fn is_up(&self) -> bool {
            true
        }
        fn connect(&self) -> Result<(), LinkError> {
            Ok(())
        }
        fn disconnect(&self) -> Result<(), LinkError> {
            Ok(())
        }
    }

    struct Broker {
        connected: AtomicBool,
        sent: Mutex<Vec<String>>,
    }

    impl PubSubClient for Broker {
        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }
        fn reconnect(&self) -> Result<(), PublishError> {
            Ok(())
        }
        fn publish(&self, _topic: &str, payload: &[u8]) -> Result<(), PublishError> {
            self.sent
                .lock()
                .unwrap()
                .push(String::from_utf8_lossy(payload).into_owned());
            Ok(())
        }
    }

    struct Quiet;

    impl StatusDisplay for Quiet {
        fn show(&mut self, _status: &DisplayStatus) {}
    }

    #[test]
    fn single_thread_steps_cover_idle_polls_and_a_full_window() {
        let dir = tempfile::tempdir().unwrap();
        let wifi = Arc::new(Wifi);
        let broker = Arc::new(Broker {
            connected: AtomicBool::new(true),
            sent: Mutex::new(Vec::new()),
        });

        let mut queue = OfflineQueue::open(DirStore::open(dir.path()).unwrap()).unwrap();
        queue.enqueue(br#"{"id":"backlog"}"#).unwrap();
        let (notifier, events) = session_channel();

        let config = Config::default();
        let bus = FieldBusClient::new(
            Meter {
                script: vec![None, frame(600), frame(620)].into(),
                pending: None,
            },
            Duration::from_millis(5),
        );
        let manager = ConnectivityManager::new(
            Arc::clone(&wifi),
            Arc::new(ConnectivityIntent::new(false)),
            Duration::from_secs(60),
        );
        let session = BrokerSession::new(Arc::clone(&broker), Arc::clone(&wifi), Duration::from_secs(5));
        let mut acquisition = AcquisitionTask::new(&config, bus, manager, session);

        let publisher = TelemetryPublisher::new(Arc::clone(&broker), Arc::clone(&wifi), "t", queue, events);
        let site = SensorSite {
            sensor_id: "1".into(),
            latitude: 0.0,
            longitude: 0.0,
        };
        let clock = CalendarClock::new(0, ClockStatus::Synchronized).unwrap();
        let mut publication = PublicationTask::new(WINDOW, site, clock, publisher, Quiet);
        let start = Instant::now();

        // No value yet: the step falls through to the idle path, which
        // services the session event and replays the backlog.
        notifier.notify(SessionEvent::Connected);
        step_cooperative(&mut acquisition, &mut publication, start);
        assert_eq!(*broker.sent.lock().unwrap(), vec![r#"{"id":"backlog"}"#.to_string()]);

        step_cooperative(&mut acquisition, &mut publication, start + Duration::from_secs(1));
        assert_eq!(broker.sent.lock().unwrap().len(), 1);

        step_cooperative(&mut acquisition, &mut publication, start + WINDOW + Duration::from_secs(1));
        let sent = broker.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert!(sent[1].contains(r#""avgdB":"61.00","mindB":"60.00","maxdB":"62.00""#));
        assert!(publication.publisher().queue().is_empty().unwrap());
    }
}
