// memory_firmware: In-memory firmware source and boot slot with fault
// injection, for exercising the update pipeline without HTTP or disk.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use at_updater::{FirmwareSlot, FirmwareSource, FirmwareStream, SlotError, SourceError};
use bytes::Bytes;
use futures_util::future::BoxFuture;

// ---------------------------------------------------------------------------
// MemorySource
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Image {
    bytes: Bytes,
    content_length: Option<u64>,
    disconnect_after: Option<usize>,
}

/// Serves images registered by locator.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    images: Arc<Mutex<HashMap<String, Image>>>,
    opens: Arc<AtomicUsize>,
    bytes_served: Arc<AtomicUsize>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `bytes` at `locator` with an accurate content length.
    pub fn serve(&self, locator: &str, bytes: impl Into<Bytes>) {
        let bytes = bytes.into();
        let len = bytes.len() as u64;
        self.insert(locator, bytes, Some(len), None);
    }

    /// Serve `bytes` but report `content_length` instead of the true size.
    pub fn serve_with_length(
        &self,
        locator: &str,
        bytes: impl Into<Bytes>,
        content_length: Option<u64>,
    ) {
        self.insert(locator, bytes.into(), content_length, None);
    }

    /// Serve `bytes` but drop the connection after `after` bytes.
    pub fn serve_interrupted(&self, locator: &str, bytes: impl Into<Bytes>, after: usize) {
        let bytes = bytes.into();
        let len = bytes.len() as u64;
        self.insert(locator, bytes, Some(len), Some(after));
    }

    fn insert(
        &self,
        locator: &str,
        bytes: Bytes,
        content_length: Option<u64>,
        disconnect_after: Option<usize>,
    ) {
        if let Ok(mut images) = self.images.lock() {
            images.insert(
                locator.to_owned(),
                Image {
                    bytes,
                    content_length,
                    disconnect_after,
                },
            );
        }
    }

    /// Number of times `open` was called.
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn bytes_served(&self) -> usize {
        self.bytes_served.load(Ordering::SeqCst)
    }
}

impl FirmwareSource for MemorySource {
    fn open<'a>(
        &'a self,
        locator: &'a str,
        _timeout: Duration,
    ) -> BoxFuture<'a, Result<Box<dyn FirmwareStream>, SourceError>> {
        Box::pin(async move {
            self.opens.fetch_add(1, Ordering::SeqCst);
            let image = self
                .images
                .lock()
                .ok()
                .and_then(|images| images.get(locator).cloned())
                .ok_or(SourceError::Status(404))?;
            Ok(Box::new(MemoryStream {
                remaining: image.bytes,
                content_length: image.content_length,
                budget: image.disconnect_after,
                served: Arc::clone(&self.bytes_served),
            }) as Box<dyn FirmwareStream>)
        })
    }
}

struct MemoryStream {
    remaining: Bytes,
    content_length: Option<u64>,
    budget: Option<usize>,
    served: Arc<AtomicUsize>,
}

impl FirmwareStream for MemoryStream {
    fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    fn next_chunk(&mut self, max: usize) -> BoxFuture<'_, Result<Option<Bytes>, SourceError>> {
        Box::pin(async move {
            if self.budget == Some(0) {
                return Err(SourceError::Disconnected("injected disconnect".to_owned()));
            }
            if self.remaining.is_empty() {
                return Ok(None);
            }
            let mut take = self.remaining.len().min(max);
            if let Some(budget) = self.budget.as_mut() {
                take = take.min(*budget);
                *budget -= take;
            }
            self.served.fetch_add(take, Ordering::SeqCst);
            Ok(Some(self.remaining.split_to(take)))
        })
    }
}

// ---------------------------------------------------------------------------
// MemorySlot
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct SlotState {
    boot: Vec<u8>,
    pending: Option<Vec<u8>>,
    fail_finalize: bool,
    short_write_after: Option<usize>,
    aborts: usize,
}

/// A boot slot holding the "installed" image in memory. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemorySlot {
    state: Arc<Mutex<SlotState>>,
}

impl MemorySlot {
    pub fn with_boot_image(boot: impl Into<Vec<u8>>) -> Self {
        let slot = Self::default();
        if let Ok(mut s) = slot.state.lock() {
            s.boot = boot.into();
        }
        slot
    }

    pub fn fail_finalize(&self, fail: bool) {
        if let Ok(mut s) = self.state.lock() {
            s.fail_finalize = fail;
        }
    }

    /// After `n` bytes have been staged, writes accept one byte less than
    /// offered.
    pub fn short_write_after(&self, n: usize) {
        if let Ok(mut s) = self.state.lock() {
            s.short_write_after = Some(n);
        }
    }

    pub fn boot_image(&self) -> Vec<u8> {
        self.state.lock().map(|s| s.boot.clone()).unwrap_or_default()
    }

    pub fn has_pending(&self) -> bool {
        self.state.lock().is_ok_and(|s| s.pending.is_some())
    }

    pub fn aborts(&self) -> usize {
        self.state.lock().map(|s| s.aborts).unwrap_or_default()
    }
}

impl FirmwareSlot for MemorySlot {
    fn begin(&mut self, size: u64) -> Result<(), SlotError> {
        let mut s = self
            .state
            .lock()
            .map_err(|_| SlotError::Promote("poisoned".to_owned()))?;
        s.pending = Some(Vec::with_capacity(usize::try_from(size).unwrap_or(0)));
        Ok(())
    }

    fn write(&mut self, chunk: &[u8]) -> Result<usize, SlotError> {
        let mut s = self
            .state
            .lock()
            .map_err(|_| SlotError::Promote("poisoned".to_owned()))?;
        let limit = s.short_write_after;
        let pending = s.pending.as_mut().ok_or(SlotError::NotStarted)?;
        let accept = match limit {
            Some(n) if pending.len() >= n && !chunk.is_empty() => chunk.len() - 1,
            _ => chunk.len(),
        };
        pending.extend_from_slice(&chunk[..accept]);
        Ok(accept)
    }

    fn finalize(&mut self) -> Result<(), SlotError> {
        let mut s = self
            .state
            .lock()
            .map_err(|_| SlotError::Promote("poisoned".to_owned()))?;
        if s.fail_finalize {
            return Err(SlotError::Promote("injected finalize failure".to_owned()));
        }
        let image = s.pending.take().ok_or(SlotError::NotStarted)?;
        s.boot = image;
        Ok(())
    }

    fn abort(&mut self) {
        if let Ok(mut s) = self.state.lock() {
            s.pending = None;
            s.aborts += 1;
        }
    }
}
