// SoundWatch - Publication Task
//
// Consumes readings from the acquisition task, feeds the aggregation window
// and hands every closed window to the publisher. Also the only place that
// reacts to broker session events, so backlog replay never races a live
// publish.

use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};

use crate::clock::CalendarClock;
use crate::display::StatusDisplay;
use crate::events::{AggregateSample, DisplayStatus, Reading, SensorSite};
use crate::net::mqtt::{Delivery, PubSubClient, TelemetryPublisher};
use crate::net::wifi::WirelessLink;
use crate::storage::BlobStore;
use crate::window::AggregationWindow;

pub struct PublicationTask<C, L, S, D> {
    window: AggregationWindow,
    site: SensorSite,
    clock: CalendarClock,
    publisher: TelemetryPublisher<C, L, S>,
    display: D,
}

impl<C, L, S, D> PublicationTask<C, L, S, D>
where
    C: PubSubClient,
    L: WirelessLink,
    S: BlobStore,
    D: StatusDisplay,
{
    pub fn new(
        window_length: Duration,
        site: SensorSite,
        clock: CalendarClock,
        publisher: TelemetryPublisher<C, L, S>,
        display: D,
    ) -> Self {
        Self {
            window: AggregationWindow::new(window_length, Instant::now()),
            site,
            clock,
            publisher,
            display,
        }
    }

    /// Process one reading. Returns the delivery outcome when the reading
    /// closed a window that had samples.
    pub fn handle(&mut self, reading: Reading) -> Option<Delivery> {
        self.publisher.poll_session_events();
        self.window.observe(reading.value_db);

        let mut delivery = None;
        if self.window.should_flush(reading.captured) {
            if let Some(stats) = self.window.flush(reading.captured) {
                log::info!(
                    "Window closed: avg {:.2} dB, min {:.2}, max {:.2} ({} samples)",
                    stats.average_db,
                    stats.min_db,
                    stats.max_db,
                    stats.samples
                );
                let sample = AggregateSample::new(&self.site, stats, self.clock.stamp());
                delivery = Some(self.publisher.publish(&sample));
            }
        }

        self.display.show(&DisplayStatus {
            value_db: reading.value_db,
            link_up: self.publisher.link_up(),
            broker_connected: self.publisher.broker_connected(),
        });
        delivery
    }

    /// Called when no reading arrived for a while.
    pub fn idle(&mut self) {
        self.publisher.poll_session_events();
    }

    pub fn publisher(&self) -> &TelemetryPublisher<C, L, S> {
        &self.publisher
    }
}

pub fn publication_task<C, L, S, D>(
    mut task: PublicationTask<C, L, S, D>,
    reading_rx: Receiver<Reading>,
    idle_poll: Duration,
) where
    C: PubSubClient,
    L: WirelessLink,
    S: BlobStore,
    D: StatusDisplay,
{
    log::info!("Publication task started");

    loop {
        match reading_rx.recv_timeout(idle_poll) {
            Ok(reading) => {
                task.handle(reading);
            }
            Err(RecvTimeoutError::Timeout) => task.idle(),
            Err(RecvTimeoutError::Disconnected) => {
                log::warn!("Reading channel closed, exiting publication task");
                return;
            }
        }
    }
}
