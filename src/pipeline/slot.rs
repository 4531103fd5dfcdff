//! Single-slot mailbox between the camera callback and the consumer thread

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::utils::CachePadded;

use crate::capture::Frame;
use crate::pipeline::pool::BufferHandle;

/// Holds at most one frame that the consumer has not picked up yet.
///
/// Writing into an occupied slot hands the displaced frame's buffer back to
/// the caller so it can be recycled. Nothing is ever queued behind the
/// pending frame.
#[derive(Debug)]
pub(crate) struct PendingFrameSlot {
    pending: Option<Frame>,
    last_sequence: u64,
    active: bool,
}

impl PendingFrameSlot {
    pub(crate) fn new() -> Self {
        Self {
            pending: None,
            last_sequence: 0,
            active: true,
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active
    }

    pub(crate) fn deactivate(&mut self) -> bool {
        std::mem::replace(&mut self.active, false)
    }

    pub(crate) fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub(crate) fn next_sequence(&mut self) -> u64 {
        self.last_sequence += 1;
        self.last_sequence
    }

    /// Latest-wins store. Returns the buffer of the frame it displaced.
    pub(crate) fn replace(&mut self, frame: Frame) -> Option<BufferHandle> {
        self.pending.replace(frame).map(Frame::into_buffer)
    }

    pub(crate) fn take(&mut self) -> Option<Frame> {
        self.pending.take()
    }
}

/// Point-in-time pipeline counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    /// Frames accepted into the slot.
    pub submitted: u64,
    /// Frames handed to the detector.
    pub processed: u64,
    /// Frames displaced from the slot before the consumer took them.
    pub dropped: u64,
    /// Submissions refused (pipeline stopped, or buffer from another pool).
    pub rejected: u64,
    /// Frames for which the detector returned an error or panicked.
    pub detector_failures: u64,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    processed: AtomicU64,
    dropped: AtomicU64,
    rejected: AtomicU64,
    detector_failures: AtomicU64,
}

/// Statistics, written from both pipeline threads
#[derive(Default)]
pub(crate) struct Stats {
    counters: CachePadded<Counters>,
}

impl Stats {
    pub(crate) fn submitted(&self) {
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("textcam_frames_submitted").increment(1);
    }

    pub(crate) fn processed(&self) {
        self.counters.processed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("textcam_frames_processed").increment(1);
    }

    pub(crate) fn dropped(&self) {
        self.counters.dropped.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("textcam_frames_dropped").increment(1);
    }

    pub(crate) fn rejected(&self) {
        self.counters.rejected.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("textcam_frames_rejected").increment(1);
    }

    pub(crate) fn detector_failed(&self) {
        self.counters.detector_failures.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("textcam_detector_failures").increment(1);
    }

    pub(crate) fn snapshot(&self) -> PipelineStats {
        PipelineStats {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            processed: self.counters.processed.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            detector_failures: self.counters.detector_failures.load(Ordering::Relaxed),
        }
    }
}
