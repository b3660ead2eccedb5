//! Where firmware bytes go.
//!
//! A slot is written while the device keeps running the current image. Only
//! [`FirmwareSlot::finalize`] makes the new image the boot image, and it must
//! do so atomically: after a crash the boot path holds either the old image
//! or the complete new one.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum SlotError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("slot not started")]
    NotStarted,
    #[error("could not promote staged image: {0}")]
    Promote(String),
}

pub trait FirmwareSlot: Send {
    /// Prepare to receive `size` bytes. Discards any earlier unfinished image.
    fn begin(&mut self, size: u64) -> Result<(), SlotError>;

    /// Write a chunk. Returns the number of bytes accepted.
    fn write(&mut self, chunk: &[u8]) -> Result<usize, SlotError>;

    /// Make the written image the boot image.
    fn finalize(&mut self) -> Result<(), SlotError>;

    /// Drop the pending image. The boot image is not touched.
    fn abort(&mut self);
}

// ---------------------------------------------------------------------------
// FileSlot
// ---------------------------------------------------------------------------

/// Stages the image at `<boot_path>.staging` and renames it over the boot
/// image on finalize. The staging name is fixed, so an image left behind by
/// a power loss is overwritten by the next [`FirmwareSlot::begin`] rather
/// than accumulating.
pub struct FileSlot {
    boot_path: PathBuf,
    staging_path: PathBuf,
    staged: Option<File>,
}

impl FileSlot {
    pub fn new(boot_path: impl Into<PathBuf>) -> Self {
        let boot_path = boot_path.into();
        let mut name = boot_path.file_name().unwrap_or_default().to_os_string();
        name.push(".staging");
        let staging_path = boot_path.with_file_name(name);
        Self {
            boot_path,
            staging_path,
            staged: None,
        }
    }

    pub fn boot_path(&self) -> &Path {
        &self.boot_path
    }

    pub fn staging_path(&self) -> &Path {
        &self.staging_path
    }

    fn remove_staging(&self) {
        match std::fs::remove_file(&self.staging_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(error = %e, "failed to remove staged firmware image"),
        }
    }
}

impl FirmwareSlot for FileSlot {
    fn begin(&mut self, size: u64) -> Result<(), SlotError> {
        self.abort();
        if let Some(dir) = self.staging_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        if self.staging_path.exists() {
            warn!(path = %self.staging_path.display(), "discarding stale staged image");
        }
        let staged = File::create(&self.staging_path)?;
        debug!(path = %self.staging_path.display(), size, "staging firmware image");
        self.staged = Some(staged);
        Ok(())
    }

    fn write(&mut self, chunk: &[u8]) -> Result<usize, SlotError> {
        let staged = self.staged.as_mut().ok_or(SlotError::NotStarted)?;
        staged.write_all(chunk)?;
        Ok(chunk.len())
    }

    fn finalize(&mut self) -> Result<(), SlotError> {
        let staged = self.staged.take().ok_or(SlotError::NotStarted)?;
        staged.sync_all()?;
        drop(staged);
        if let Err(e) = std::fs::rename(&self.staging_path, &self.boot_path) {
            self.remove_staging();
            return Err(SlotError::Promote(e.to_string()));
        }
        sync_parent(&self.boot_path);
        info!(path = %self.boot_path.display(), "firmware image promoted");
        Ok(())
    }

    fn abort(&mut self) {
        if self.staged.take().is_some() {
            self.remove_staging();
        }
    }
}

/// Flush the directory entry of a freshly renamed file. Best effort: not every
/// platform allows opening a directory.
fn sync_parent(path: &Path) {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty())
        && let Ok(dir) = File::open(parent)
    {
        let _ = dir.sync_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finalize_replaces_boot_image() {
        let dir = tempfile::tempdir().unwrap();
        let boot = dir.path().join("firmware.bin");
        std::fs::write(&boot, b"old").unwrap();

        let mut slot = FileSlot::new(&boot);
        slot.begin(3).unwrap();
        assert_eq!(slot.write(b"new").unwrap(), 3);
        assert_eq!(std::fs::read(&boot).unwrap(), b"old");
        slot.finalize().unwrap();
        assert_eq!(std::fs::read(&boot).unwrap(), b"new");
    }

    #[test]
    fn abort_leaves_boot_image_and_no_staging_files() {
        let dir = tempfile::tempdir().unwrap();
        let boot = dir.path().join("firmware.bin");
        std::fs::write(&boot, b"old").unwrap();

        let mut slot = FileSlot::new(&boot);
        slot.begin(3).unwrap();
        slot.write(b"ne").unwrap();
        slot.abort();

        assert_eq!(std::fs::read(&boot).unwrap(), b"old");
        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn begin_overwrites_image_left_by_power_loss() {
        let dir = tempfile::tempdir().unwrap();
        let boot = dir.path().join("firmware.bin");
        std::fs::write(&boot, b"old").unwrap();
        {
            let mut slot = FileSlot::new(&boot);
            slot.begin(8).unwrap();
            slot.write(b"half").unwrap();
            // Power lost mid-download: neither abort nor finalize runs.
            drop(slot);
        }
        let staging = dir.path().join("firmware.bin.staging");
        assert_eq!(std::fs::read(&staging).unwrap(), b"half");

        let mut slot = FileSlot::new(&boot);
        assert_eq!(slot.staging_path(), staging);
        slot.begin(3).unwrap();
        slot.write(b"new").unwrap();
        assert_eq!(std::fs::read(&staging).unwrap(), b"new");
        slot.finalize().unwrap();

        assert_eq!(std::fs::read(&boot).unwrap(), b"new");
        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn write_before_begin_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut slot = FileSlot::new(dir.path().join("firmware.bin"));
        assert!(matches!(slot.write(b"x"), Err(SlotError::NotStarted)));
        assert!(matches!(slot.finalize(), Err(SlotError::NotStarted)));
    }
}
