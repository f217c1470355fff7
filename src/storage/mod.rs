// SoundWatch - Persistent Storage
//
// The offline backlog lives on a small flash filesystem. `Volume` covers the
// mount/format lifecycle; `BlobStore` is the flat name -> bytes view the queue
// works against.

pub mod dir;
pub mod queue;

use std::path::PathBuf;

use crate::error::StorageError;

pub use dir::{DirStore, DirVolume};
pub use queue::{OfflineQueue, ReplayReport};

/// Flat key/blob namespace.
pub trait BlobStore {
    /// Entry names in the store's enumeration order.
    fn list(&self) -> Result<Vec<String>, StorageError>;
    fn read(&self, name: &str) -> Result<Vec<u8>, StorageError>;
    /// Create or replace an entry. Either the old or the new content survives
    /// a power cut.
    fn write(&mut self, name: &str, data: &[u8]) -> Result<(), StorageError>;
    fn remove(&mut self, name: &str) -> Result<(), StorageError>;
}

/// Block device with a filesystem that can be mounted into the VFS.
pub trait Volume {
    /// Mount and return the directory the filesystem is reachable under.
    fn mount(&mut self) -> Result<PathBuf, StorageError>;
    /// Wipe the partition and lay down an empty filesystem.
    fn format(&mut self) -> Result<(), StorageError>;
}

/// Mount `volume`, formatting and retrying once if the first mount fails.
///
/// Blank or corrupted media is expected on first boot. A second failure is
/// returned to the caller, which cannot run without durable storage.
pub fn initialize<V: Volume>(volume: &mut V) -> Result<DirStore, StorageError> {
    let root = match volume.mount() {
        Ok(root) => root,
        Err(e) => {
            log::warn!("Storage mount failed ({}), formatting…", e);
            volume.format()?;
            volume.mount()?
        }
    };

    log::info!("Storage mounted at {}", root.display());
    DirStore::open(root)
}
