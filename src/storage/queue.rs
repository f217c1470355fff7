// SoundWatch - Offline Telemetry Queue
//
// Durable FIFO of payloads that could not be delivered. Every payload gets
// its own entry `data_<N>.json`, where N only ever grows, across reboots too.
// Replay walks the backlog oldest first and stops at the first delivery
// failure so the broker never sees telemetry out of order.

use crate::error::{PublishError, StorageError};
use crate::storage::BlobStore;

const ENTRY_PREFIX: &str = "data_";
const ENTRY_SUFFIX: &str = ".json";

pub fn entry_name(index: u64) -> String {
    format!("{ENTRY_PREFIX}{index}{ENTRY_SUFFIX}")
}

/// Extract N from `data_<N>.json` (or a bare `data_<N>`).
pub fn entry_index(name: &str) -> Option<u64> {
    let digits = name.strip_prefix(ENTRY_PREFIX)?;
    let digits = digits.strip_suffix(ENTRY_SUFFIX).unwrap_or(digits);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Outcome of one replay pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReplayReport {
    pub delivered: usize,
    /// Entry whose delivery failed; everything from it onwards is still queued.
    pub stopped_at: Option<String>,
}

pub struct OfflineQueue<S> {
    store: S,
    next_index: u64,
}

impl<S: BlobStore> OfflineQueue<S> {
    /// Open the queue and continue numbering after the newest entry.
    pub fn open(store: S) -> Result<Self, StorageError> {
        let mut queue = Self {
            store,
            next_index: 0,
        };
        queue.resume_counter()?;
        Ok(queue)
    }

    /// Rescan the store and set the next key to one past the highest one
    /// found (0 for an empty store).
    pub fn resume_counter(&mut self) -> Result<u64, StorageError> {
        let highest = self
            .store
            .list()?
            .iter()
            .filter_map(|name| entry_index(name))
            .max();

        self.next_index = highest.map_or(0, |n| n + 1);
        log::info!("Backlog counter resumed at {}", self.next_index);
        Ok(self.next_index)
    }

    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    /// Persist one payload under the next key.
    ///
    /// The key is consumed even if the write fails, so keys stay strictly
    /// increasing. Failures are not retried; the caller drops the payload.
    pub fn enqueue(&mut self, payload: &[u8]) -> Result<String, StorageError> {
        let name = entry_name(self.next_index);
        self.next_index += 1;

        self.store.write(&name, payload)?;
        log::info!("Offline: payload saved as {}", name);
        Ok(name)
    }

    /// Pending entries, oldest first.
    pub fn pending(&self) -> Result<Vec<String>, StorageError> {
        let mut entries: Vec<(u64, String)> = self
            .store
            .list()?
            .into_iter()
            .filter(|name| !name.starts_with('.'))
            .filter_map(|name| match entry_index(&name) {
                Some(index) => Some((index, name)),
                None => {
                    log::debug!("Ignoring foreign entry {}", name);
                    None
                }
            })
            .collect();

        entries.sort_unstable_by_key(|(index, _)| *index);
        Ok(entries.into_iter().map(|(_, name)| name).collect())
    }

    pub fn len(&self) -> Result<usize, StorageError> {
        Ok(self.pending()?.len())
    }

    pub fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.len()? == 0)
    }

    /// Hand each pending payload to `publish`, oldest first.
    ///
    /// Delivered entries are deleted. The first failed delivery ends the pass
    /// and leaves that entry and everything after it in place. Storage errors
    /// also end the pass and are returned.
    pub fn replay<F>(&mut self, mut publish: F) -> Result<ReplayReport, StorageError>
    where
        F: FnMut(&[u8]) -> Result<(), PublishError>,
    {
        let mut report = ReplayReport::default();

        for name in self.pending()? {
            let payload = self.store.read(&name)?;
            if payload.is_empty() {
                log::warn!("Backlog entry {} is empty, removing", name);
                self.store.remove(&name)?;
                continue;
            }

            log::info!("Resending {}", name);
            match publish(&payload) {
                Ok(()) => {
                    self.store.remove(&name)?;
                    report.delivered += 1;
                }
                Err(e) => {
                    log::warn!("Resend of {} failed ({}), keeping backlog for later", name, e);
                    report.stopped_at = Some(name);
                    break;
                }
            }
        }

        log::info!("Backlog replay finished: {} delivered", report.delivered);
        Ok(report)
    }
}
