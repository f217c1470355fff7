// SoundWatch - Directory-backed Blob Store
//
// Works on any mounted VFS directory: SPIFFS on the device, a plain directory
// on the host. Writes go to a hidden temporary entry first and are renamed
// into place, so a power cut never leaves a half-written entry under a
// visible name.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::StorageError;
use crate::storage::{BlobStore, Volume};

const TMP_PREFIX: &str = ".";
const TMP_SUFFIX: &str = ".tmp";

pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    /// Open the store at `root`, discarding temporaries left by an
    /// interrupted write.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let store = Self { root: root.into() };

        for name in store.list()? {
            if name.starts_with(TMP_PREFIX) && name.ends_with(TMP_SUFFIX) {
                log::warn!("Discarding interrupted write {}", name);
                let path = store.path(&name);
                fs::remove_file(&path).map_err(|e| StorageError::io(path.display().to_string(), e))?;
            }
        }
        Ok(store)
    }

    fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StorageError + '_ {
    move |e| StorageError::io(path.display().to_string(), e)
}

impl BlobStore for DirStore {
    fn list(&self) -> Result<Vec<String>, StorageError> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root).map_err(io_err(&self.root))? {
            let entry = entry.map_err(io_err(&self.root))?;
            if !entry.file_type().map_err(io_err(&self.root))?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_owned());
            }
        }
        Ok(names)
    }

    fn read(&self, name: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.path(name);
        fs::read(&path).map_err(io_err(&path))
    }

    fn write(&mut self, name: &str, data: &[u8]) -> Result<(), StorageError> {
        let tmp = self.path(&format!("{TMP_PREFIX}{name}{TMP_SUFFIX}"));
        let path = self.path(name);

        fs::write(&tmp, data).map_err(io_err(&tmp))?;
        if let Err(e) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(StorageError::io(path.display().to_string(), e));
        }
        Ok(())
    }

    fn remove(&mut self, name: &str) -> Result<(), StorageError> {
        let path = self.path(name);
        fs::remove_file(&path).map_err(io_err(&path))
    }
}

/// A plain directory standing in for a flash partition (host builds).
pub struct DirVolume {
    root: PathBuf,
}

impl DirVolume {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Volume for DirVolume {
    fn mount(&mut self) -> Result<PathBuf, StorageError> {
        fs::create_dir_all(&self.root).map_err(|e| StorageError::Mount(e.to_string()))?;
        // Make sure the directory is usable, not merely present.
        fs::read_dir(&self.root).map_err(|e| StorageError::Mount(e.to_string()))?;
        Ok(self.root.clone())
    }

    fn format(&mut self) -> Result<(), StorageError> {
        if self.root.exists() {
            fs::remove_dir_all(&self.root).map_err(|e| StorageError::Format(e.to_string()))?;
        }
        fs::create_dir_all(&self.root).map_err(|e| StorageError::Format(e.to_string()))
    }
}
