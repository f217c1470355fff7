// SoundWatch - Clocks
//
// Two notions of time: a monotonic millisecond counter for debounce and
// scheduling, and a calendar clock that stamps telemetry. The calendar clock
// is only trustworthy once network time has been received; until then stamps
// are best-effort.

use std::thread;
use std::time::Duration;

use time::{OffsetDateTime, UtcOffset};

// ---------------------------------------------------------------------------
// Utility: milliseconds since boot (wraps at ~49 days, compare with
// wrapping_sub). Usable from interrupt context.
// ---------------------------------------------------------------------------
#[cfg(target_os = "espidf")]
pub fn now_ms() -> u32 {
    unsafe { (esp_idf_sys::esp_timer_get_time() / 1000) as u32 }
}

#[cfg(not(target_os = "espidf"))]
pub fn now_ms() -> u32 {
    use std::sync::OnceLock;
    use std::time::Instant;

    static BOOT: OnceLock<Instant> = OnceLock::new();
    BOOT.get_or_init(Instant::now).elapsed().as_millis() as u32
}

/// Anything that can tell whether the system clock carries real calendar time.
pub trait TimeSource: Send + Sync {
    fn is_synchronized(&self) -> bool;
}

/// Whether calendar stamps can be trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockStatus {
    Synchronized,
    BestEffort,
}

/// The system clock counts as set once it reports a year past 2023; an
/// unset RTC starts at the epoch.
pub struct WallClock;

impl TimeSource for WallClock {
    fn is_synchronized(&self) -> bool {
        OffsetDateTime::now_utc().year() > 2023
    }
}

/// Poll `source` up to `retries` times, `interval` apart.
///
/// Exhausting the retries is not an error: the device keeps running with a
/// best-effort clock.
pub fn synchronize<T: TimeSource + ?Sized>(source: &T, retries: u32, interval: Duration) -> ClockStatus {
    for attempt in 1..=retries {
        if source.is_synchronized() {
            log::info!("Clock synchronized after {} attempt(s)", attempt);
            return ClockStatus::Synchronized;
        }
        log::debug!("Waiting for time sync ({}/{})", attempt, retries);
        thread::sleep(interval);
    }

    if source.is_synchronized() {
        return ClockStatus::Synchronized;
    }
    log::warn!("Time sync failed after {} attempts, timestamps are best-effort", retries);
    ClockStatus::BestEffort
}

/// Local calendar time at a fixed UTC offset.
#[derive(Debug, Clone, Copy)]
pub struct CalendarClock {
    offset: UtcOffset,
    status: ClockStatus,
}

impl CalendarClock {
    pub fn new(offset_hours: i8, status: ClockStatus) -> Result<Self, time::error::ComponentRange> {
        Ok(Self {
            offset: UtcOffset::from_hms(offset_hours, 0, 0)?,
            status,
        })
    }

    /// Current local time as `YYYY-MM-DD HH:MM:SS`.
    pub fn stamp(&self) -> String {
        if self.status == ClockStatus::BestEffort {
            log::warn!("Stamping with an unsynchronized clock");
        }
        self.stamp_at(OffsetDateTime::now_utc())
    }

    pub fn stamp_at(&self, instant: OffsetDateTime) -> String {
        let local = instant.to_offset(self.offset);
        format!(
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
            local.year(),
            u8::from(local.month()),
            local.day(),
            local.hour(),
            local.minute(),
            local.second()
        )
    }
}
