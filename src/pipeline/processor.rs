//! Producer/consumer hand-off between the camera callback and the detector
//!
//! The camera callback thread calls [`FrameSubmitter::submit`], which never
//! blocks on the detector: it swaps the new frame into a single pending slot,
//! recycles whatever frame it displaced, and wakes the consumer. One
//! long-lived consumer thread takes the pending frame, runs the detector
//! outside the lock, and recycles the buffer afterwards.
//!
//! Shutdown is typed: [`FramePipeline::join`] is the only way to obtain a
//! [`StoppedPipeline`], and only a stopped pipeline can release the detector.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::capture::frame::{Frame, FrameLayout, FrameMetadata};
use crate::detector::DetectorSink;
use crate::error::PipelineError;
use crate::pipeline::pool::{BufferHandle, FrameBufferPool};
use crate::pipeline::slot::{PendingFrameSlot, PipelineStats, Stats};
use crate::PipelineConfig;

/// Pipeline lifecycle as observed from outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PipelineLifecycle {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
}

impl PipelineLifecycle {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => PipelineLifecycle::Starting,
            2 => PipelineLifecycle::Running,
            3 => PipelineLifecycle::Stopping,
            _ => PipelineLifecycle::Stopped,
        }
    }
}

struct Shared {
    slot: Mutex<PendingFrameSlot>,
    ready: Condvar,
    pool: FrameBufferPool,
    stats: Stats,
    lifecycle: AtomicU8,
    started_at: Instant,
}

impl Shared {
    fn set_lifecycle(&self, state: PipelineLifecycle) {
        self.lifecycle.store(state as u8, Ordering::Release);
    }

    fn lifecycle(&self) -> PipelineLifecycle {
        PipelineLifecycle::from_u8(self.lifecycle.load(Ordering::Acquire))
    }

    fn recycle(&self, buffer: BufferHandle) {
        if let Err(err) = self.pool.release(buffer) {
            warn!(%err, "Failed to recycle frame buffer");
        }
    }

    fn stop(&self) -> bool {
        let first = {
            let mut slot = self.slot.lock();
            let first = slot.deactivate();
            self.ready.notify_all();
            first
        };
        if first {
            self.set_lifecycle(PipelineLifecycle::Stopping);
            info!("Frame pipeline stopping");
        }
        first
    }
}

/// A running pipeline: one consumer thread that owns the detector.
pub struct FramePipeline<D: DetectorSink> {
    shared: Arc<Shared>,
    consumer: Option<JoinHandle<Option<D>>>,
}

/// Producer-side handle, given to the camera callback.
#[derive(Clone)]
pub struct FrameSubmitter {
    shared: Arc<Shared>,
}

/// Signals the consumer to exit. Safe to call any number of times from any
/// thread.
#[derive(Clone)]
pub struct StopHandle {
    shared: Arc<Shared>,
}

/// Proof that the consumer thread has terminated. Holds the detector until
/// it is released.
pub struct StoppedPipeline<D: DetectorSink> {
    detector: D,
    stats: PipelineStats,
}

impl<D: DetectorSink> FramePipeline<D> {
    /// Spawns the consumer thread. On failure the detector is released
    /// before the error is returned.
    #[instrument(skip_all, fields(pool = pool.id(), kind = ?pool.kind()))]
    pub fn start(
        detector: D,
        pool: FrameBufferPool,
        config: &PipelineConfig,
    ) -> Result<Self, PipelineError> {
        let shared = Arc::new(Shared {
            slot: Mutex::new(PendingFrameSlot::new()),
            ready: Condvar::new(),
            pool,
            stats: Stats::default(),
            lifecycle: AtomicU8::new(PipelineLifecycle::Starting as u8),
            started_at: Instant::now(),
        });

        let core = match config.consumer_core {
            Some(index) => match find_core(index) {
                Some(core) => Some(core),
                None => {
                    shared.set_lifecycle(PipelineLifecycle::Stopped);
                    detector.release();
                    return Err(PipelineError::AffinityUnavailable(index));
                }
            },
            None => None,
        };

        // The detector crosses over only once the thread exists, so a failed
        // spawn can still release it here.
        let (handoff_tx, handoff_rx) = flume::bounded::<D>(1);
        let thread_shared = shared.clone();
        let spawned = thread::Builder::new()
            .name(config.thread_name.clone())
            .spawn(move || {
                if let Some(core) = core {
                    if !core_affinity::set_for_current(core) {
                        warn!(core = core.id, "Could not pin frame consumer");
                    }
                }
                let detector = handoff_rx.recv().ok()?;
                Some(run_consumer(&thread_shared, detector))
            });

        let consumer = match spawned {
            Ok(handle) => handle,
            Err(err) => {
                shared.set_lifecycle(PipelineLifecycle::Stopped);
                detector.release();
                return Err(PipelineError::SpawnFailed(err));
            }
        };

        if let Err(flume::SendError(detector)) = handoff_tx.send(detector) {
            // The thread exited before taking the detector.
            shared.set_lifecycle(PipelineLifecycle::Stopped);
            let _ = consumer.join();
            detector.release();
            return Err(PipelineError::ConsumerPanicked);
        }

        shared.set_lifecycle(PipelineLifecycle::Running);
        info!(thread = %config.thread_name, "Frame pipeline running");

        Ok(Self {
            shared,
            consumer: Some(consumer),
        })
    }

    pub fn submitter(&self) -> FrameSubmitter {
        FrameSubmitter {
            shared: self.shared.clone(),
        }
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            shared: self.shared.clone(),
        }
    }

    pub fn pool(&self) -> &FrameBufferPool {
        &self.shared.pool
    }

    pub fn lifecycle(&self) -> PipelineLifecycle {
        self.shared.lifecycle()
    }

    pub fn stats(&self) -> PipelineStats {
        self.shared.stats.snapshot()
    }

    /// Asks the consumer to exit once the slot is empty. Idempotent.
    pub fn stop(&self) -> bool {
        self.shared.stop()
    }

    /// Stops the pipeline (if not already), waits for the consumer thread to
    /// terminate, and recycles any buffer still left in the slot.
    pub fn join(mut self) -> Result<StoppedPipeline<D>, PipelineError> {
        self.shared.stop();
        let joined = match self.consumer.take() {
            Some(handle) => handle.join(),
            None => Ok(None),
        };
        self.drain();
        self.shared.set_lifecycle(PipelineLifecycle::Stopped);

        match joined {
            Ok(Some(detector)) => {
                let stats = self.shared.stats.snapshot();
                info!(?stats, "Frame consumer joined");
                Ok(StoppedPipeline { detector, stats })
            }
            Ok(None) | Err(_) => {
                error!("Frame consumer did not hand back its detector");
                Err(PipelineError::ConsumerPanicked)
            }
        }
    }

    fn drain(&self) {
        let leftover = self.shared.slot.lock().take();
        if let Some(frame) = leftover {
            debug!(sequence = frame.sequence(), "Recycling frame left after shutdown");
            self.shared.recycle(frame.into_buffer());
        }
    }
}

impl<D: DetectorSink> Drop for FramePipeline<D> {
    fn drop(&mut self) {
        let Some(handle) = self.consumer.take() else {
            return;
        };
        warn!("Frame pipeline dropped while running, shutting down");
        self.shared.stop();
        if let Ok(Some(detector)) = handle.join() {
            detector.release();
        }
        self.drain();
        self.shared.set_lifecycle(PipelineLifecycle::Stopped);
    }
}

impl<D: DetectorSink> StoppedPipeline<D> {
    pub fn stats(&self) -> PipelineStats {
        self.stats
    }

    /// Releases the detector. Consumes the token, so this happens once.
    pub fn release(self) -> PipelineStats {
        self.detector.release();
        info!("Detector released");
        self.stats
    }
}

impl FrameSubmitter {
    /// Makes `buffer` the pending frame and returns its sequence id.
    ///
    /// Never waits on the detector. A frame still pending from an earlier
    /// call is dropped and its buffer recycled. Buffers from another pool
    /// and submissions after stop are refused; the buffer is recycled or
    /// closed either way.
    pub fn submit(&self, buffer: BufferHandle, layout: FrameLayout) -> Result<u64, PipelineError> {
        let shared = &*self.shared;

        if !shared.pool.owns(&buffer) {
            shared.stats.rejected();
            let err = PipelineError::UnknownBuffer {
                pool: shared.pool.id(),
                owner: buffer.pool_id(),
            };
            warn!(%err, "Skipping frame, no buffer mapping for its data");
            // The owner pool never sees this buffer again and keeps it
            // counted as in use. See `FrameBufferPool::release`.
            if let BufferHandle::External(_) = buffer {
                // Closes the image; the pool reports the mismatch again.
                let _ = shared.pool.release(buffer);
            }
            return Err(err);
        }

        let (sequence, displaced) = {
            let mut slot = shared.slot.lock();
            if !slot.is_active() {
                drop(slot);
                shared.stats.rejected();
                shared.recycle(buffer);
                return Err(PipelineError::AlreadyStopped);
            }

            let sequence = slot.next_sequence();
            let meta = FrameMetadata {
                sequence,
                timestamp: shared.started_at.elapsed(),
                layout,
            };
            let displaced = slot.replace(Frame::new(meta, buffer));
            shared.ready.notify_one();
            (sequence, displaced)
        };

        shared.stats.submitted();
        if let Some(stale) = displaced {
            trace!(sequence, "Dropping unconsumed frame");
            shared.stats.dropped();
            shared.recycle(stale);
        }
        Ok(sequence)
    }

    pub fn pool(&self) -> &FrameBufferPool {
        &self.shared.pool
    }

    pub fn is_active(&self) -> bool {
        self.shared.slot.lock().is_active()
    }
}

impl StopHandle {
    /// Returns `true` for the call that actually stopped the pipeline.
    pub fn stop(&self) -> bool {
        self.shared.stop()
    }

    pub fn lifecycle(&self) -> PipelineLifecycle {
        self.shared.lifecycle()
    }
}

fn find_core(index: usize) -> Option<core_affinity::CoreId> {
    core_affinity::get_core_ids()?
        .into_iter()
        .find(|core| core.id == index)
}

fn run_consumer<D: DetectorSink>(shared: &Shared, mut detector: D) -> D {
    debug!("Frame consumer started");

    loop {
        let frame = {
            let mut slot = shared.slot.lock();
            while slot.is_active() && !slot.has_pending() {
                shared.ready.wait(&mut slot);
            }
            match slot.take() {
                Some(frame) => frame,
                None => break,
            }
        };

        let sequence = frame.sequence();
        let started = Instant::now();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| detector.process(&frame)));
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                error!(sequence, %err, "Detector failed on frame");
                shared.stats.detector_failed();
            }
            Err(payload) => {
                error!(sequence, panic = panic_message(&*payload), "Detector panicked on frame");
                shared.stats.detector_failed();
            }
        }
        metrics::histogram!("textcam_detect_time_us").record(started.elapsed().as_micros() as f64);
        shared.stats.processed();
        shared.recycle(frame.into_buffer());
    }

    debug!("Frame consumer exiting");
    detector
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::frame::{PixelFormat, Rotation};
    use std::sync::atomic::AtomicUsize;

    fn layout() -> FrameLayout {
        FrameLayout {
            width: 4,
            height: 2,
            format: PixelFormat::Luma8,
            rotation: Rotation::Deg90,
        }
    }

    struct Counting {
        seen: Arc<AtomicUsize>,
        released: Arc<AtomicUsize>,
    }

    impl DetectorSink for Counting {
        fn process(&mut self, _frame: &Frame) -> Result<(), crate::error::DetectorError> {
            self.seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn release(self) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn lifecycle_runs_to_stopped() {
        let seen = Arc::new(AtomicUsize::new(0));
        let released = Arc::new(AtomicUsize::new(0));
        let pool = FrameBufferPool::recycling(4, 8);
        let pipeline = FramePipeline::start(
            Counting {
                seen: seen.clone(),
                released: released.clone(),
            },
            pool.clone(),
            &PipelineConfig::default(),
        )
        .unwrap();
        assert_eq!(pipeline.lifecycle(), PipelineLifecycle::Running);

        let stop = pipeline.stop_handle();
        let stopped = pipeline.join().unwrap();
        assert_eq!(stop.lifecycle(), PipelineLifecycle::Stopped);
        assert!(!stop.stop());

        stopped.release();
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert_eq!(pool.available(), 4);
    }

    #[test]
    fn submit_after_stop_recycles_buffer() {
        let pool = FrameBufferPool::recycling(2, 8);
        let pipeline = FramePipeline::start(
            |_: &Frame| -> Result<(), crate::error::DetectorError> { Ok(()) },
            pool.clone(),
            &PipelineConfig::default(),
        )
        .unwrap();
        let submitter = pipeline.submitter();
        assert!(pipeline.stop());

        let buffer = pool.acquire().unwrap();
        let err = submitter.submit(buffer.into(), layout()).unwrap_err();
        assert!(matches!(err, PipelineError::AlreadyStopped));
        assert_eq!(pool.available(), 2);

        let stopped = pipeline.join().unwrap();
        assert_eq!(stopped.stats().rejected, 1);
        stopped.release();
    }

    #[test]
    fn frame_carries_layout_and_sequence() {
        let (tx, rx) = flume::unbounded();
        let pool = FrameBufferPool::recycling(2, 8);
        let pipeline = FramePipeline::start(
            move |frame: &Frame| -> Result<(), crate::error::DetectorError> {
                tx.send((frame.sequence(), *frame.layout(), frame.data().to_vec()))?;
                Ok(())
            },
            pool.clone(),
            &PipelineConfig::default(),
        )
        .unwrap();

        let mut buffer = pool.acquire().unwrap();
        buffer.fill_from(&[9, 8, 7]);
        let id = pipeline.submitter().submit(buffer.into(), layout()).unwrap();
        assert_eq!(id, 1);

        let (sequence, seen_layout, data) = rx.recv().unwrap();
        assert_eq!(sequence, 1);
        assert_eq!(seen_layout, layout());
        assert_eq!(data, vec![9, 8, 7]);

        pipeline.join().unwrap().release();
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn dropping_running_pipeline_releases_detector() {
        let released = Arc::new(AtomicUsize::new(0));
        let pipeline = FramePipeline::start(
            Counting {
                seen: Arc::new(AtomicUsize::new(0)),
                released: released.clone(),
            },
            FrameBufferPool::recycling(1, 1),
            &PipelineConfig::default(),
        )
        .unwrap();
        drop(pipeline);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }
}
