//! One active camera: frame pipeline plus still-capture control
//!
//! A session runs two threads of its own. The frame consumer belongs to the
//! [`FramePipeline`]. The capture control thread owns the
//! [`CameraDevice`] and the [`CaptureStateMachine`]; it is the only writer of
//! capture state, and everything that wants to change that state (camera
//! results, `take_picture`, `focus_at`) reaches it as a [`ControlEvent`].

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, error, info, instrument, warn};

use super::events::{CameraEvents, CaptureEvent, ControlEvent, StillImage};
use super::state::{CaptureAction, CaptureState, CaptureStateMachine};
use crate::capture::convert::nv21_buffer_len;
use crate::capture::device::{
    AfState, AfTrigger, CameraCharacteristics, CameraDevice, CaptureRequest, FocusRegion,
    PrecaptureTrigger, RequestTag, zoom_level,
};
use crate::capture::frame::{FrameLayout, PixelFormat, Rotation};
use crate::capture::orientation::{detector_rotation, jpeg_orientation, legacy_rotation};
use crate::detector::DetectorSink;
use crate::error::{CameraError, PipelineError, SessionError};
use crate::pipeline::pool::{BackendKind, FrameBufferPool};
use crate::pipeline::processor::{FramePipeline, PipelineLifecycle, StoppedPipeline};
use crate::pipeline::slot::PipelineStats;
use crate::Config;

/// A running camera session.
pub struct CameraSession<D: DetectorSink, C: CameraDevice> {
    pipeline: Option<FramePipeline<D>>,
    control_tx: flume::Sender<ControlEvent>,
    control: Option<JoinHandle<Option<C>>>,
    events: flume::Receiver<CaptureEvent>,
    state: Arc<AtomicU8>,
    zoom: Arc<AtomicU32>,
    characteristics: CameraCharacteristics,
    layout: FrameLayout,
    jpeg_orientation: Rotation,
}

/// A session whose threads have all terminated.
pub struct StoppedSession<D: DetectorSink, C: CameraDevice> {
    pipeline: StoppedPipeline<D>,
    device: C,
}

impl<D: DetectorSink, C: CameraDevice> CameraSession<D, C> {
    /// Opens the camera, starts the frame pipeline and the repeating preview.
    ///
    /// Any failure tears down what was already started and releases the
    /// detector before returning.
    #[instrument(skip_all, fields(backend = ?device.kind()))]
    pub fn start(config: &Config, mut device: C, detector: D) -> Result<Self, SessionError> {
        let kind = device.kind();
        let characteristics = match device.characteristics(&config.camera) {
            Ok(characteristics) => characteristics,
            Err(err) => {
                error!(%err, "Camera not available");
                detector.release();
                return Err(err.into());
            }
        };
        info!(?characteristics, "Camera selected");

        let layout = frame_layout(kind, &characteristics, config);
        let pool = match kind {
            BackendKind::BufferRecycling => FrameBufferPool::recycling(
                config.pipeline.buffer_count,
                nv21_buffer_len(characteristics.preview_width, characteristics.preview_height),
            ),
            BackendKind::OpaqueImage => FrameBufferPool::external(),
        };
        let pipeline = FramePipeline::start(detector, pool, &config.pipeline)?;

        let (control_tx, control_rx) = flume::unbounded();
        let (events_tx, events_rx) = flume::unbounded();
        let camera_events = CameraEvents::new(pipeline.submitter(), layout, control_tx.clone());

        let flash = characteristics
            .flash_supported
            .then_some(config.camera.flash_mode);
        let preview = CaptureRequest::preview(config.camera.focus_mode, flash);

        let started = device
            .open(camera_events)
            .and_then(|()| device.set_repeating_request(&preview));
        if let Err(err) = started {
            error!(%err, "Camera failed to start preview");
            device.close();
            release_pipeline(pipeline);
            return Err(err.into());
        }

        let state = Arc::new(AtomicU8::new(CaptureState::Preview as u8));
        let zoom = Arc::new(AtomicU32::new(0));
        let jpeg_orientation = jpeg_orientation(
            config.camera.display_rotation,
            characteristics.sensor_orientation,
        );

        // The device crosses over only once the thread exists, so a failed
        // spawn can still close it here.
        let (handoff_tx, handoff_rx) = flume::bounded::<Controller<C>>(1);
        let control = match thread::Builder::new()
            .name("capture-control".into())
            .spawn(move || {
                let controller = handoff_rx.recv().ok()?;
                Some(controller.run(control_rx))
            }) {
            Ok(handle) => handle,
            Err(err) => {
                device.close();
                release_pipeline(pipeline);
                return Err(SessionError::ControlSpawn(err));
            }
        };

        let controller = Controller {
            device,
            machine: CaptureStateMachine::new(),
            published: state.clone(),
            zoom: zoom.clone(),
            max_zoom: characteristics.max_zoom,
            preview,
            jpeg_orientation,
            outputs: events_tx,
            stills: 0,
            focusing: false,
        };
        if let Err(flume::SendError(mut controller)) = handoff_tx.send(controller) {
            controller.device.close();
            let _ = control.join();
            release_pipeline(pipeline);
            return Err(SessionError::ControlThreadPanicked);
        }

        info!(?layout, %jpeg_orientation, "Camera session started");

        Ok(Self {
            pipeline: Some(pipeline),
            control_tx,
            control: Some(control),
            events: events_rx,
            state,
            zoom,
            characteristics,
            layout,
            jpeg_orientation,
        })
    }

    /// Starts a still capture. Returns `false` if the session is shutting
    /// down. A request made while a capture is in progress is ignored.
    pub fn take_picture(&self) -> bool {
        self.control_tx.send(ControlEvent::TakePicture).is_ok()
    }

    /// Focuses on `region`. Ignored while a still capture is in progress.
    pub fn focus_at(&self, region: FocusRegion) -> bool {
        self.control_tx.send(ControlEvent::FocusAt(region)).is_ok()
    }

    /// Scales the camera zoom. Factors above 1 zoom in by tenths of the
    /// device maximum, factors below 1 zoom out proportionally. Ignored on
    /// cameras without zoom.
    pub fn zoom(&self, scale: f32) -> bool {
        self.control_tx.send(ControlEvent::Zoom(scale)).is_ok()
    }

    /// Zoom step applied to the preview request, `0` when not zoomed.
    pub fn zoom_level(&self) -> u32 {
        self.zoom.load(Ordering::Acquire)
    }

    pub fn capture_state(&self) -> CaptureState {
        CaptureState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Shutter, picture, focus and abort notifications.
    pub fn events(&self) -> flume::Receiver<CaptureEvent> {
        self.events.clone()
    }

    pub fn characteristics(&self) -> &CameraCharacteristics {
        &self.characteristics
    }

    pub fn frame_layout(&self) -> FrameLayout {
        self.layout
    }

    pub fn jpeg_orientation(&self) -> Rotation {
        self.jpeg_orientation
    }

    pub fn stats(&self) -> PipelineStats {
        self.pipeline
            .as_ref()
            .map(FramePipeline::stats)
            .unwrap_or_default()
    }

    pub fn pipeline_lifecycle(&self) -> PipelineLifecycle {
        self.pipeline
            .as_ref()
            .map_or(PipelineLifecycle::Stopped, FramePipeline::lifecycle)
    }

    /// Closes the camera, then stops and joins the frame consumer.
    pub fn stop(mut self) -> Result<StoppedSession<D, C>, SessionError> {
        let device = self.shutdown_control();
        let pipeline = self
            .pipeline
            .take()
            .ok_or(SessionError::Pipeline(PipelineError::AlreadyStopped))?
            .join()?;

        match device {
            Ok(device) => {
                info!(stats = ?pipeline.stats(), "Camera session stopped");
                Ok(StoppedSession { pipeline, device })
            }
            Err(err) => {
                pipeline.release();
                Err(err)
            }
        }
    }

    fn shutdown_control(&mut self) -> Result<C, SessionError> {
        let handle = self
            .control
            .take()
            .ok_or(SessionError::ControlThreadPanicked)?;
        let _ = self.control_tx.send(ControlEvent::Shutdown);
        handle
            .join()
            .ok()
            .flatten()
            .ok_or(SessionError::ControlThreadPanicked)
    }
}

impl<D: DetectorSink, C: CameraDevice> Drop for CameraSession<D, C> {
    fn drop(&mut self) {
        if self.control.is_some() {
            warn!("Camera session dropped without stop");
            let _ = self.shutdown_control();
        }
    }
}

impl<D: DetectorSink, C: CameraDevice> StoppedSession<D, C> {
    pub fn stats(&self) -> PipelineStats {
        self.pipeline.stats()
    }

    /// Releases the detector and hands the closed camera back.
    pub fn release(self) -> (PipelineStats, C) {
        (self.pipeline.release(), self.device)
    }
}

fn release_pipeline<D: DetectorSink>(pipeline: FramePipeline<D>) {
    match pipeline.join() {
        Ok(stopped) => {
            stopped.release();
        }
        Err(err) => error!(%err, "Frame pipeline did not shut down cleanly"),
    }
}

fn frame_layout(
    kind: BackendKind,
    characteristics: &CameraCharacteristics,
    config: &Config,
) -> FrameLayout {
    let (width, height) = (characteristics.preview_width, characteristics.preview_height);
    match kind {
        BackendKind::BufferRecycling => FrameLayout {
            width,
            height,
            format: PixelFormat::Nv21,
            rotation: legacy_rotation(
                characteristics.facing,
                characteristics.sensor_orientation,
                config.camera.display_rotation,
            )
            .frame,
        },
        BackendKind::OpaqueImage => {
            let (width, height) = if config.pipeline.downscale_quarter {
                (width / 4, height / 4)
            } else {
                (width, height)
            };
            FrameLayout {
                width,
                height,
                format: PixelFormat::Nv21,
                rotation: detector_rotation(characteristics.sensor_orientation),
            }
        }
    }
}

/// State owned by the capture control thread.
struct Controller<C: CameraDevice> {
    device: C,
    machine: CaptureStateMachine,
    published: Arc<AtomicU8>,
    zoom: Arc<AtomicU32>,
    max_zoom: u32,
    preview: CaptureRequest,
    jpeg_orientation: Rotation,
    outputs: flume::Sender<CaptureEvent>,
    stills: u64,
    focusing: bool,
}

impl<C: CameraDevice> Controller<C> {
    fn run(mut self, events: flume::Receiver<ControlEvent>) -> C {
        debug!("Capture control running");
        while let Ok(event) = events.recv() {
            if let ControlEvent::Shutdown = event {
                break;
            }
            self.handle(event);
            self.published
                .store(self.machine.state() as u8, Ordering::Release);
        }

        if let Err(err) = self.device.stop_repeating() {
            debug!(%err, "Stopping preview on shutdown");
        }
        self.device.close();
        self.published
            .store(CaptureState::Preview as u8, Ordering::Release);
        info!("Camera closed");
        self.device
    }

    fn handle(&mut self, event: ControlEvent) {
        match event {
            ControlEvent::TakePicture => {
                if self.focusing && self.machine.state().is_idle() {
                    // Tap-to-focus stopped the preview, and the capture
                    // sequence advances on preview results.
                    debug!("Still capture supersedes tap-to-focus");
                    self.focusing = false;
                    self.restore_preview();
                }
                if let Some(action) = self.machine.take_picture() {
                    self.perform(action);
                }
            }
            ControlEvent::FocusAt(region) => self.focus_at(region),
            ControlEvent::Zoom(scale) => self.zoom(scale),
            ControlEvent::CaptureCompleted {
                tag: RequestTag::StillCapture,
                ..
            } => {
                if let Some(action) = self.machine.on_still_captured() {
                    self.perform(action);
                }
            }
            ControlEvent::CaptureCompleted {
                tag: RequestTag::TapFocus,
                metadata,
            } => {
                let success = metadata.af_state != Some(AfState::NotFocusedLocked);
                self.focus_finished(success);
            }
            ControlEvent::CaptureProgressed { tag, metadata }
            | ControlEvent::CaptureCompleted { tag, metadata } => {
                if let Some(action) = self.machine.on_capture_result(tag, &metadata) {
                    self.perform(action);
                }
            }
            ControlEvent::CaptureFailed { tag, reason } => match tag {
                RequestTag::TapFocus => {
                    warn!(%reason, "Tap-to-focus request failed");
                    self.focus_finished(false);
                }
                RequestTag::FocusLock | RequestTag::Precapture | RequestTag::StillCapture
                    if !self.machine.state().is_idle() =>
                {
                    self.abort(reason);
                }
                _ => debug!(?tag, %reason, "Capture request failed"),
            },
            ControlEvent::StillImage(jpeg) => {
                self.stills += 1;
                metrics::counter!("textcam_still_captures").increment(1);
                info!(sequence = self.stills, bytes = jpeg.len(), "Still image captured");
                let _ = self.outputs.send(CaptureEvent::Picture(StillImage {
                    sequence: self.stills,
                    jpeg,
                    orientation: self.jpeg_orientation,
                }));
            }
            ControlEvent::Shutdown => {}
        }
    }

    fn perform(&mut self, action: CaptureAction) {
        let result = match action {
            CaptureAction::LockFocus => {
                let request = self
                    .preview
                    .tagged(RequestTag::FocusLock)
                    .with_af_trigger(AfTrigger::Start);
                self.device.capture(&request)
            }
            CaptureAction::RunPrecapture => {
                let request = self
                    .preview
                    .tagged(RequestTag::Precapture)
                    .with_precapture_trigger(PrecaptureTrigger::Start);
                self.device.capture(&request)
            }
            CaptureAction::CaptureStill => self.capture_still(),
            CaptureAction::UnlockFocus => self.unlock_focus(),
        };

        if let Err(err) = result {
            self.abort(err.to_string());
        }
    }

    fn capture_still(&mut self) -> Result<(), CameraError> {
        let _ = self.outputs.send(CaptureEvent::Shutter);
        let request = self.preview.still(self.jpeg_orientation);
        self.device.stop_repeating()?;
        self.device.capture(&request)
    }

    fn unlock_focus(&mut self) -> Result<(), CameraError> {
        let cancel = self
            .preview
            .tagged(RequestTag::FocusUnlock)
            .with_af_trigger(AfTrigger::Cancel);
        self.device.capture(&cancel)?;
        self.device.set_repeating_request(&self.preview)
    }

    fn focus_at(&mut self, region: FocusRegion) {
        if !self.machine.state().is_idle() {
            debug!(state = ?self.machine.state(), "Ignoring tap-to-focus during capture");
            return;
        }
        if self.focusing {
            debug!("Tap-to-focus already running");
            return;
        }

        let cancel = self
            .preview
            .tagged(RequestTag::FocusCancel)
            .with_af_trigger(AfTrigger::Cancel);
        let trigger = self
            .preview
            .tagged(RequestTag::TapFocus)
            .with_focus_region(region)
            .with_af_trigger(AfTrigger::Start);

        let issued = self
            .device
            .stop_repeating()
            .and_then(|()| self.device.capture(&cancel))
            .and_then(|()| self.device.capture(&trigger));

        match issued {
            Ok(()) => {
                debug!(?region, "Tap-to-focus issued");
                self.focusing = true;
            }
            Err(err) => {
                warn!(%err, "Tap-to-focus could not be issued");
                self.focus_finished(false);
            }
        }
    }

    fn zoom(&mut self, scale: f32) {
        if self.max_zoom == 0 {
            debug!("Camera has no zoom");
            return;
        }
        let level = zoom_level(self.preview.zoom, self.max_zoom, scale);
        self.zoom.store(level, Ordering::Release);
        if level == self.preview.zoom {
            return;
        }
        debug!(level, max = self.max_zoom, "Zoom");
        self.preview.zoom = level;
        // Otherwise applied when the preview is next restored.
        if self.machine.state().is_idle() && !self.focusing {
            self.restore_preview();
        }
    }

    fn focus_finished(&mut self, success: bool) {
        self.focusing = false;
        let _ = self.outputs.send(CaptureEvent::FocusFinished { success });
        // A still capture in progress owns the repeating request.
        if self.machine.state().is_idle() {
            self.restore_preview();
        }
    }

    fn abort(&mut self, reason: String) {
        let previous = self.machine.abort();
        warn!(?previous, %reason, "Capture sequence aborted");
        metrics::counter!("textcam_capture_aborts").increment(1);
        self.restore_preview();
        let _ = self.outputs.send(CaptureEvent::CaptureAborted { reason });
    }

    fn restore_preview(&mut self) {
        if let Err(err) = self.device.set_repeating_request(&self.preview) {
            warn!(%err, "Could not restore preview");
        }
    }
}
