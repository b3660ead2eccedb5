//! The update state machine.
//!
//! `Idle -> Downloading -> Validating -> Applying -> Complete | Failed`
//!
//! [`UpdateJob::step`] advances the job by one bounded unit of work (opening
//! the stream, one chunk, validation, or apply) so the caller's driving loop
//! can keep servicing the transport between steps. Every failure aborts the
//! slot, which leaves the booted image as it was.

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::slot::FirmwareSlot;
use crate::source::{FirmwareSource, FirmwareStream};
use crate::{
    UpdateError, UpdateLimits, UpdatePhase, UpdatePlan, UpdateProgress, UpdateStatus,
    download_percent, validate_checksum_format,
};

/// Minimum advance, in percentage points, between two download progress
/// reports.
const PROGRESS_STEP: u8 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateEvent {
    /// Percent complete, 0..=100, non-decreasing within a job.
    Progress(u8),
    Status(UpdateStatus),
}

pub struct UpdateJob {
    plan: UpdatePlan,
    limits: UpdateLimits,
    phase: UpdatePhase,
    stream: Option<Box<dyn FirmwareStream>>,
    hasher: Sha256,
    bytes_written: u64,
    total_bytes: u64,
    last_percent: u8,
    failure: Option<String>,
}

impl UpdateJob {
    pub fn new(plan: UpdatePlan, limits: UpdateLimits) -> Self {
        Self {
            plan,
            limits,
            phase: UpdatePhase::Idle,
            stream: None,
            hasher: Sha256::new(),
            bytes_written: 0,
            total_bytes: 0,
            last_percent: 0,
            failure: None,
        }
    }

    pub fn plan(&self) -> &UpdatePlan {
        &self.plan
    }

    pub fn phase(&self) -> UpdatePhase {
        self.phase
    }

    pub fn is_finished(&self) -> bool {
        self.phase.is_terminal()
    }

    /// Human-readable reason once the job has failed.
    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn progress(&self) -> UpdateProgress {
        UpdateProgress {
            bytes_written: self.bytes_written,
            total_bytes: self.total_bytes,
            phase: self.phase,
            percent: self.last_percent,
        }
    }

    /// Advance by one unit of work and return what should be reported.
    /// A finished job returns no events.
    pub async fn step(
        &mut self,
        source: &dyn FirmwareSource,
        slot: &mut dyn FirmwareSlot,
    ) -> Vec<UpdateEvent> {
        let mut events = Vec::new();
        let result = match self.phase {
            UpdatePhase::Idle => self.start(source, slot, &mut events).await,
            UpdatePhase::Downloading => self.download_chunk(slot, &mut events).await,
            UpdatePhase::Validating => self.validate(&mut events),
            UpdatePhase::Applying => self.apply(slot, &mut events),
            UpdatePhase::Complete | UpdatePhase::Failed => Ok(()),
        };
        if let Err(e) = result {
            self.fail(&e, slot, &mut events);
        }
        events
    }

    /// Step until the job finishes, collecting every event.
    pub async fn run(
        &mut self,
        source: &dyn FirmwareSource,
        slot: &mut dyn FirmwareSlot,
    ) -> Vec<UpdateEvent> {
        let mut events = Vec::new();
        while !self.is_finished() {
            events.extend(self.step(source, slot).await);
        }
        events
    }

    // -----------------------------------------------------------------------
    // Phases
    // -----------------------------------------------------------------------

    async fn start(
        &mut self,
        source: &dyn FirmwareSource,
        slot: &mut dyn FirmwareSlot,
        events: &mut Vec<UpdateEvent>,
    ) -> Result<(), UpdateError> {
        if let Some(size) = self.plan.declared_size {
            self.check_size(size)?;
        }

        info!(
            version = %self.plan.target_version,
            url = %self.plan.locator,
            "starting firmware update"
        );
        events.push(UpdateEvent::Status(UpdateStatus::Downloading));
        events.push(UpdateEvent::Progress(0));

        let stream = source
            .open(&self.plan.locator, self.limits.request_timeout)
            .await?;

        let total = match (self.plan.declared_size, stream.content_length()) {
            (Some(declared), Some(reported)) if declared != reported => {
                return Err(UpdateError::SizeMismatch { declared, reported });
            }
            (Some(size), _) | (None, Some(size)) => size,
            (None, None) => return Err(UpdateError::MissingContentLength),
        };
        self.check_size(total)?;

        slot.begin(total)?;
        self.stream = Some(stream);
        self.total_bytes = total;
        self.phase = UpdatePhase::Downloading;
        self.report(PROGRESS_STEP, events);
        Ok(())
    }

    async fn download_chunk(
        &mut self,
        slot: &mut dyn FirmwareSlot,
        events: &mut Vec<UpdateEvent>,
    ) -> Result<(), UpdateError> {
        let remaining = self.total_bytes - self.bytes_written;
        let want = usize::try_from(remaining)
            .unwrap_or(usize::MAX)
            .min(self.limits.chunk_size);

        let stream = self.stream.as_mut().ok_or(UpdateError::ShortRead {
            received: self.bytes_written,
            expected: self.total_bytes,
        })?;
        let Some(chunk) = stream.next_chunk(want).await? else {
            return Err(UpdateError::ShortRead {
                received: self.bytes_written,
                expected: self.total_bytes,
            });
        };
        // A stream handing out more than asked would overrun the slot.
        let chunk = if chunk.len() > want {
            chunk.slice(..want)
        } else {
            chunk
        };

        let wrote = slot.write(&chunk)?;
        if wrote != chunk.len() {
            return Err(UpdateError::WriteMismatch {
                expected: chunk.len(),
                wrote,
            });
        }
        self.hasher.update(&chunk);
        self.bytes_written += wrote as u64;

        let percent = download_percent(self.bytes_written, self.total_bytes);
        if percent >= self.last_percent + PROGRESS_STEP {
            self.report(percent, events);
        }

        if self.bytes_written == self.total_bytes {
            self.stream = None;
            self.report(95, events);
            self.phase = UpdatePhase::Validating;
            debug!(bytes = self.bytes_written, "firmware download complete");
            events.push(UpdateEvent::Status(UpdateStatus::Validating));
        }
        Ok(())
    }

    fn validate(&mut self, events: &mut Vec<UpdateEvent>) -> Result<(), UpdateError> {
        let digest = std::mem::take(&mut self.hasher).finalize();
        if let Some(expected) = self.plan.expected_checksum.as_deref() {
            validate_checksum_format(expected)?;
            let actual = hex::encode(digest);
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(UpdateError::ChecksumMismatch {
                    expected: expected.to_ascii_lowercase(),
                    actual,
                });
            }
            debug!("firmware checksum verified");
        }
        self.phase = UpdatePhase::Applying;
        events.push(UpdateEvent::Status(UpdateStatus::Applying));
        Ok(())
    }

    fn apply(
        &mut self,
        slot: &mut dyn FirmwareSlot,
        events: &mut Vec<UpdateEvent>,
    ) -> Result<(), UpdateError> {
        slot.finalize()?;
        self.phase = UpdatePhase::Complete;
        self.report(100, events);
        info!(version = %self.plan.target_version, "firmware update applied");
        events.push(UpdateEvent::Status(UpdateStatus::Completed));
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn check_size(&self, size: u64) -> Result<(), UpdateError> {
        if self.limits.accepts(size) {
            Ok(())
        } else {
            Err(UpdateError::SizeOutOfRange {
                size,
                min: self.limits.min_size,
                max: self.limits.max_size,
            })
        }
    }

    fn report(&mut self, percent: u8, events: &mut Vec<UpdateEvent>) {
        if percent > self.last_percent {
            self.last_percent = percent;
            events.push(UpdateEvent::Progress(percent));
        }
    }

    fn fail(
        &mut self,
        error: &UpdateError,
        slot: &mut dyn FirmwareSlot,
        events: &mut Vec<UpdateEvent>,
    ) {
        slot.abort();
        self.stream = None;
        self.phase = UpdatePhase::Failed;
        let reason = error.to_string();
        warn!(
            version = %self.plan.target_version,
            bytes_written = self.bytes_written,
            error = %reason,
            "firmware update failed"
        );
        self.failure = Some(reason.clone());
        events.push(UpdateEvent::Status(UpdateStatus::Failed { error: reason }));
    }
}
