// SoundWatch - Telemetry Publisher
//
// Every closed window becomes one JSON message on a single topic. Messages
// go straight to the broker when both the link and the broker session are up,
// otherwise into the offline backlog. When the session (re)connects the
// backlog is replayed in order.

use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Serialize, Serializer};
use serde_json::value::RawValue;

use crate::config::SESSION_EVENT_DEPTH;
use crate::error::PublishError;
use crate::events::{AggregateSample, SessionEvent};
use crate::net::wifi::WirelessLink;
use crate::storage::{BlobStore, OfflineQueue, ReplayReport};

/// Publish/subscribe client. Delivery is at-least-once (QoS 1).
pub trait PubSubClient: Send + Sync {
    fn is_connected(&self) -> bool;
    /// Ask the client to re-establish its session; completion arrives as a
    /// `SessionEvent`.
    fn reconnect(&self) -> Result<(), PublishError>;
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), PublishError>;
}

impl<C: PubSubClient + ?Sized> PubSubClient for Arc<C> {
    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    fn reconnect(&self) -> Result<(), PublishError> {
        (**self).reconnect()
    }

    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), PublishError> {
        (**self).publish(topic, payload)
    }
}

/// A client that failed to start. Never connected; every sample goes to the
/// backlog.
impl<C: PubSubClient> PubSubClient for Option<C> {
    fn is_connected(&self) -> bool {
        self.as_ref().is_some_and(|client| client.is_connected())
    }

    fn reconnect(&self) -> Result<(), PublishError> {
        match self {
            Some(client) => client.reconnect(),
            None => Err(PublishError::NotConnected),
        }
    }

    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), PublishError> {
        match self {
            Some(client) => client.publish(topic, payload),
            None => Err(PublishError::NotConnected),
        }
    }
}

// ---------------------------------------------------------------------------
// Session events: client callback -> publisher
// ---------------------------------------------------------------------------

/// Sending half handed to the client's event callback. Never blocks.
#[derive(Clone)]
pub struct SessionNotifier {
    tx: SyncSender<SessionEvent>,
}

impl SessionNotifier {
    pub fn notify(&self, event: SessionEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => log::warn!("Session event {:?} dropped, queue full", event),
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

pub fn session_channel() -> (SessionNotifier, Receiver<SessionEvent>) {
    let (tx, rx) = mpsc::sync_channel(SESSION_EVENT_DEPTH);
    (SessionNotifier { tx }, rx)
}

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

/// `{"id":"1","avgdB":"61.00","mindB":"58.00","maxdB":"65.00",
///   "latitude":-3.743987,"longitude":-38.536267,"timestamp":"..."}`
#[derive(Debug, Serialize)]
pub struct TelemetryPayload<'a> {
    id: &'a str,
    #[serde(rename = "avgdB")]
    avg_db: String,
    #[serde(rename = "mindB")]
    min_db: String,
    #[serde(rename = "maxdB")]
    max_db: String,
    #[serde(serialize_with = "six_decimals")]
    latitude: f64,
    #[serde(serialize_with = "six_decimals")]
    longitude: f64,
    timestamp: &'a str,
}

impl<'a> TelemetryPayload<'a> {
    pub fn new(sample: &'a AggregateSample) -> Self {
        Self {
            id: &sample.sensor_id,
            avg_db: format!("{:.2}", sample.average_db),
            min_db: format!("{:.2}", sample.min_db),
            max_db: format!("{:.2}", sample.max_db),
            latitude: sample.latitude,
            longitude: sample.longitude,
            timestamp: &sample.captured_at,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, PublishError> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Coordinates stay JSON numbers but with exactly six decimals.
fn six_decimals<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
    let raw = RawValue::from_string(format!("{value:.6}")).map_err(serde::ser::Error::custom)?;
    raw.serialize(serializer)
}

// ---------------------------------------------------------------------------
// Publisher
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Published,
    Queued,
    /// Neither published nor persisted.
    Dropped,
}

pub struct TelemetryPublisher<C, L, S> {
    client: C,
    link: L,
    topic: String,
    queue: OfflineQueue<S>,
    events: Receiver<SessionEvent>,
}

impl<C: PubSubClient, L: WirelessLink, S: BlobStore> TelemetryPublisher<C, L, S> {
    pub fn new(
        client: C,
        link: L,
        topic: impl Into<String>,
        queue: OfflineQueue<S>,
        events: Receiver<SessionEvent>,
    ) -> Self {
        Self {
            client,
            link,
            topic: topic.into(),
            queue,
            events,
        }
    }

    pub fn is_online(&self) -> bool {
        self.client.is_connected() && self.link.is_up()
    }

    pub fn link_up(&self) -> bool {
        self.link.is_up()
    }

    pub fn broker_connected(&self) -> bool {
        self.client.is_connected()
    }

    pub fn queue(&self) -> &OfflineQueue<S> {
        &self.queue
    }

    pub fn publish(&mut self, sample: &AggregateSample) -> Delivery {
        let payload = match TelemetryPayload::new(sample).to_bytes() {
            Ok(payload) => payload,
            Err(e) => {
                log::error!("Dropping sample: {}", e);
                return Delivery::Dropped;
            }
        };

        if self.is_online() {
            match self.client.publish(&self.topic, &payload) {
                Ok(()) => {
                    log::info!("Published to {}", self.topic);
                    return Delivery::Published;
                }
                Err(e) => log::warn!("Publish failed ({}), saving offline", e),
            }
        } else {
            log::info!("Broker unreachable, saving offline");
        }

        match self.queue.enqueue(&payload) {
            Ok(_) => Delivery::Queued,
            Err(e) => {
                log::error!("Could not save payload, dropping it: {}", e);
                Delivery::Dropped
            }
        }
    }

    /// Drain pending session events; replay the backlog if any event arrived
    /// and the session is up now. Events may have been dropped, so the live
    /// session state decides, not the last event drained.
    pub fn poll_session_events(&mut self) -> Option<ReplayReport> {
        let mut drained = false;
        while let Ok(event) = self.events.try_recv() {
            match event {
                SessionEvent::Connected => log::info!("Broker session connected"),
                SessionEvent::Disconnected => log::warn!("Broker session lost"),
            }
            drained = true;
        }

        if drained && self.is_online() {
            self.replay_backlog()
        } else {
            None
        }
    }

    /// Resend the backlog through the publish path, oldest first.
    pub fn replay_backlog(&mut self) -> Option<ReplayReport> {
        let client = &self.client;
        let topic = self.topic.as_str();

        match self.queue.replay(|payload| client.publish(topic, payload)) {
            Ok(report) => Some(report),
            Err(e) => {
                log::warn!("Backlog replay aborted: {}", e);
                None
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Broker session supervision (runs on the acquisition side)
// ---------------------------------------------------------------------------

pub struct BrokerSession<C, L> {
    client: C,
    link: L,
    interval: Duration,
    last_check: Option<Instant>,
}

impl<C: PubSubClient, L: WirelessLink> BrokerSession<C, L> {
    pub fn new(client: C, link: L, interval: Duration) -> Self {
        Self {
            client,
            link,
            interval,
            last_check: None,
        }
    }

    /// Reconnect the broker session if it is down while the link is up.
    /// Rate-limited to one check per `interval`; returns whether a reconnect
    /// was issued.
    pub fn check_connection(&mut self, now: Instant) -> bool {
        if let Some(at) = self.last_check {
            if now.saturating_duration_since(at) < self.interval {
                return false;
            }
        }
        self.last_check = Some(now);

        if self.client.is_connected() || !self.link.is_up() {
            return false;
        }

        log::info!("Broker session down, reconnecting…");
        match self.client.reconnect() {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Broker reconnect failed: {}", e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LinkError;
    use crate::storage::DirStore;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct FakeClient {
        connected: AtomicBool,
        reconnects: AtomicUsize,
        /// Number of publishes that succeed before the broker starts failing.
        accept: Mutex<Option<usize>>,
        published: Mutex<Vec<Vec<u8>>>,
    }

    impl FakeClient {
        fn online() -> Arc<Self> {
            let client = Self::default();
            client.connected.store(true, Ordering::SeqCst);
            Arc::new(client)
        }

        fn published(&self) -> Vec<String> {
            self.published
                .lock()
                .unwrap()
                .iter()
                .map(|p| String::from_utf8(p.clone()).unwrap())
                .collect()
        }
    }

    impl PubSubClient for FakeClient {
        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        fn reconnect(&self) -> Result<(), PublishError> {
            self.reconnects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn publish(&self, _topic: &str, payload: &[u8]) -> Result<(), PublishError> {
            let mut accept = self.accept.lock().unwrap();
            match accept.as_mut() {
                Some(0) => return Err(PublishError::Rejected("msg_id -1".into())),
                Some(n) => *n -= 1,
                None => {}
            }
            self.published.lock().unwrap().push(payload.to_vec());
            Ok(())
        }
    }

    struct FixedLink(AtomicBool);

    impl WirelessLink for FixedLink {
        fn is_up(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }

        fn connect(&self) -> Result<(), LinkError> {
            Ok(())
        }

        fn disconnect(&self) -> Result<(), LinkError> {
            Ok(())
        }
    }

    fn link(up: bool) -> Arc<FixedLink> {
        Arc::new(FixedLink(AtomicBool::new(up)))
    }

    fn sample(avg: f32) -> AggregateSample {
        AggregateSample {
            sensor_id: "1".into(),
            average_db: avg,
            min_db: 58.0,
            max_db: 65.0,
            latitude: -3.743987,
            longitude: -38.536267,
            captured_at: "2024-05-01 12:00:00".into(),
        }
    }

    type Publisher = TelemetryPublisher<Arc<FakeClient>, Arc<FixedLink>, DirStore>;

    fn publisher(client: &Arc<FakeClient>, link: &Arc<FixedLink>) -> (Publisher, SessionNotifier, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let queue = OfflineQueue::open(DirStore::open(dir.path()).unwrap()).unwrap();
        let (notifier, events) = session_channel();
        let publisher = TelemetryPublisher::new(
            Arc::clone(client),
            Arc::clone(link),
            "sensor/sound/test",
            queue,
            events,
        );
        (publisher, notifier, dir)
    }

    #[test]
    fn payload_matches_the_wire_format() {
        let bytes = TelemetryPayload::new(&sample(61.0)).to_bytes().unwrap();

        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            r#"{"id":"1","avgdB":"61.00","mindB":"58.00","maxdB":"65.00","latitude":-3.743987,"longitude":-38.536267,"timestamp":"2024-05-01 12:00:00"}"#
        );
    }

    #[test]
    fn payload_rounds_to_two_decimals() {
        let mut s = sample(61.456);
        s.latitude = 1.0;
        let text = String::from_utf8(TelemetryPayload::new(&s).to_bytes().unwrap()).unwrap();

        assert!(text.contains(r#""avgdB":"61.46""#));
        assert!(text.contains(r#""latitude":1.000000"#));
    }

    #[test]
    fn online_sample_is_published() {
        let client = FakeClient::online();
        let (mut publisher, _notifier, _dir) = publisher(&client, &link(true));

        assert_eq!(publisher.publish(&sample(61.0)), Delivery::Published);
        assert_eq!(client.published().len(), 1);
        assert!(publisher.queue().is_empty().unwrap());
    }

    #[test]
    fn sample_is_queued_when_either_hop_is_down() {
        let client = FakeClient::online();
        let down = link(false);
        let (mut publisher, _notifier, _dir) = publisher(&client, &down);
        assert_eq!(publisher.publish(&sample(61.0)), Delivery::Queued);

        down.0.store(true, Ordering::SeqCst);
        client.connected.store(false, Ordering::SeqCst);
        assert_eq!(publisher.publish(&sample(62.0)), Delivery::Queued);

        assert!(client.published().is_empty());
        assert_eq!(publisher.queue().len().unwrap(), 2);
    }

    #[test]
    fn failed_publish_falls_back_to_the_backlog() {
        let client = FakeClient::online();
        *client.accept.lock().unwrap() = Some(0);
        let (mut publisher, _notifier, _dir) = publisher(&client, &link(true));

        assert_eq!(publisher.publish(&sample(61.0)), Delivery::Queued);
        assert_eq!(publisher.queue().pending().unwrap(), vec!["data_0.json"]);
    }

    #[test]
    fn connected_event_replays_backlog_in_order() {
        let client = Arc::new(FakeClient::default());
        let (mut publisher, notifier, _dir) = publisher(&client, &link(true));
        publisher.publish(&sample(60.0));
        publisher.publish(&sample(70.0));

        client.connected.store(true, Ordering::SeqCst);
        notifier.notify(SessionEvent::Connected);
        let report = publisher.poll_session_events().unwrap();

        assert_eq!(report.delivered, 2);
        let sent = client.published();
        assert!(sent[0].contains(r#""avgdB":"60.00""#));
        assert!(sent[1].contains(r#""avgdB":"70.00""#));
        assert!(publisher.queue().is_empty().unwrap());
    }

    #[test]
    fn replay_halts_at_the_first_broker_failure() {
        let client = Arc::new(FakeClient::default());
        let (mut publisher, notifier, _dir) = publisher(&client, &link(true));
        for avg in [60.0, 61.0, 62.0] {
            publisher.publish(&sample(avg));
        }

        client.connected.store(true, Ordering::SeqCst);
        *client.accept.lock().unwrap() = Some(2);
        notifier.notify(SessionEvent::Connected);
        let report = publisher.poll_session_events().unwrap();

        assert_eq!(report.delivered, 2);
        assert_eq!(report.stopped_at.as_deref(), Some("data_2.json"));
        assert_eq!(publisher.queue().len().unwrap(), 1);
    }

    #[test]
    fn disconnect_after_connect_skips_replay() {
        let client = Arc::new(FakeClient::default());
        let (mut publisher, notifier, _dir) = publisher(&client, &link(true));
        publisher.publish(&sample(60.0));

        notifier.notify(SessionEvent::Connected);
        notifier.notify(SessionEvent::Disconnected);

        assert_eq!(publisher.poll_session_events(), None);
        assert_eq!(publisher.queue().len().unwrap(), 1);
    }

    #[test]
    fn backlog_replays_even_when_the_final_connected_event_was_dropped() {
        let client = Arc::new(FakeClient::default());
        let (mut publisher, notifier, _dir) = publisher(&client, &link(true));
        publisher.publish(&sample(60.0));

        for _ in 0..SESSION_EVENT_DEPTH / 2 {
            notifier.notify(SessionEvent::Connected);
            notifier.notify(SessionEvent::Disconnected);
        }
        client.connected.store(true, Ordering::SeqCst);
        // Queue is full: this one is lost.
        notifier.notify(SessionEvent::Connected);

        let report = publisher.poll_session_events().unwrap();

        assert_eq!(report.delivered, 1);
        assert_eq!(client.published().len(), 1);
        assert!(publisher.queue().is_empty().unwrap());
    }

    #[test]
    fn no_replay_without_a_session_event() {
        let client = FakeClient::online();
        let (mut publisher, _notifier, _dir) = publisher(&client, &link(false));
        publisher.publish(&sample(60.0));

        assert_eq!(publisher.poll_session_events(), None);
        assert_eq!(publisher.queue().len().unwrap(), 1);
    }

    #[test]
    fn session_check_reconnects_only_with_the_link_up() {
        let client = Arc::new(FakeClient::default());
        let wifi = link(false);
        let mut session = BrokerSession::new(Arc::clone(&client), Arc::clone(&wifi), Duration::from_secs(5));
        let start = Instant::now();

        assert!(!session.check_connection(start));

        wifi.0.store(true, Ordering::SeqCst);
        assert!(!session.check_connection(start + Duration::from_secs(1)));
        assert!(session.check_connection(start + Duration::from_secs(5)));
        assert_eq!(client.reconnects.load(Ordering::SeqCst), 1);

        client.connected.store(true, Ordering::SeqCst);
        assert!(!session.check_connection(start + Duration::from_secs(10)));
        assert_eq!(client.reconnects.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn missing_client_keeps_everything_in_the_backlog() {
        let dir = tempfile::tempdir().unwrap();
        let queue = OfflineQueue::open(DirStore::open(dir.path()).unwrap()).unwrap();
        let (_notifier, events) = session_channel();
        let wifi = link(true);
        let mut publisher = TelemetryPublisher::new(None::<Arc<FakeClient>>, Arc::clone(&wifi), "t", queue, events);

        assert!(!publisher.is_online());
        assert_eq!(publisher.publish(&sample(60.0)), Delivery::Queued);

        let mut session = BrokerSession::new(None::<Arc<FakeClient>>, wifi, Duration::from_secs(5));
        assert!(!session.check_connection(Instant::now()));
    }

    #[test]
    fn notifier_never_blocks_on_a_full_queue() {
        let (notifier, events) = session_channel();
        for _ in 0..SESSION_EVENT_DEPTH + 3 {
            notifier.notify(SessionEvent::Disconnected);
        }
        assert_eq!(events.try_iter().count(), SESSION_EVENT_DEPTH);
    }
}
