//! Typed messages between camera callbacks, the control thread and callers

use bytes::Bytes;
use tracing::trace;

use crate::capture::device::{CaptureMetadata, FocusRegion, RequestTag};
use crate::capture::frame::{FrameLayout, Rotation};
use crate::error::PipelineError;
use crate::pipeline::pool::{BufferHandle, ExternalImage, FrameBufferPool, PooledBuffer};
use crate::pipeline::processor::FrameSubmitter;

/// Input of the capture control thread.
#[derive(Debug)]
pub(crate) enum ControlEvent {
    TakePicture,
    FocusAt(FocusRegion),
    /// Pinch scale factor.
    Zoom(f32),
    CaptureProgressed {
        tag: RequestTag,
        metadata: CaptureMetadata,
    },
    CaptureCompleted {
        tag: RequestTag,
        metadata: CaptureMetadata,
    },
    CaptureFailed {
        tag: RequestTag,
        reason: String,
    },
    StillImage(Bytes),
    Shutdown,
}

/// A finished still capture.
#[derive(Debug, Clone)]
pub struct StillImage {
    /// Counts still captures within the session, starting at 1.
    pub sequence: u64,
    pub jpeg: Bytes,
    pub orientation: Rotation,
}

/// What callers of a session get to observe.
#[derive(Debug, Clone)]
pub enum CaptureEvent {
    /// The still-capture request is about to be issued.
    Shutter,
    Picture(StillImage),
    /// A tap-to-focus request finished.
    FocusFinished { success: bool },
    /// A capture sequence was abandoned and preview resumed.
    CaptureAborted { reason: String },
}

/// Callback handle given to a camera backend when it is opened.
///
/// Frame methods run on the camera's callback thread and never block:
/// frames go straight into the pipeline slot. Everything else is queued for
/// the control thread.
#[derive(Clone)]
pub struct CameraEvents {
    frames: FrameSubmitter,
    layout: FrameLayout,
    control: flume::Sender<ControlEvent>,
}

impl CameraEvents {
    pub(crate) fn new(
        frames: FrameSubmitter,
        layout: FrameLayout,
        control: flume::Sender<ControlEvent>,
    ) -> Self {
        Self {
            frames,
            layout,
            control,
        }
    }

    /// Layout frames must be delivered in.
    pub fn layout(&self) -> FrameLayout {
        self.layout
    }

    pub fn pool(&self) -> &FrameBufferPool {
        self.frames.pool()
    }

    /// A free preview buffer, or `None` while all of them are in flight.
    pub fn acquire_buffer(&self) -> Option<PooledBuffer> {
        self.frames.pool().acquire()
    }

    /// Hands a filled preview buffer to the pipeline.
    pub fn frame_available(&self, buffer: PooledBuffer) -> Result<u64, PipelineError> {
        self.submit(BufferHandle::Pooled(buffer))
    }

    /// Hands a camera-owned image to the pipeline. It is closed after the
    /// detector is done with it, or right away if it gets dropped.
    pub fn image_available(&self, image: Box<dyn ExternalImage>) -> Result<u64, PipelineError> {
        let handle = self.frames.pool().wrap(image);
        self.submit(handle)
    }

    fn submit(&self, handle: BufferHandle) -> Result<u64, PipelineError> {
        let result = self.frames.submit(handle, self.layout);
        if let Err(err) = &result {
            trace!(%err, "Frame not submitted");
        }
        result
    }

    pub fn capture_progressed(&self, tag: RequestTag, metadata: CaptureMetadata) {
        self.send(ControlEvent::CaptureProgressed { tag, metadata });
    }

    pub fn capture_completed(&self, tag: RequestTag, metadata: CaptureMetadata) {
        self.send(ControlEvent::CaptureCompleted { tag, metadata });
    }

    pub fn capture_failed(&self, tag: RequestTag, reason: impl Into<String>) {
        self.send(ControlEvent::CaptureFailed {
            tag,
            reason: reason.into(),
        });
    }

    /// Encoded bytes from the still-image output.
    pub fn still_image(&self, jpeg: Bytes) {
        self.send(ControlEvent::StillImage(jpeg));
    }

    fn send(&self, event: ControlEvent) {
        if self.control.send(event).is_err() {
            trace!("Capture control stopped, dropping camera event");
        }
    }
}
