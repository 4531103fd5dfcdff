//! Camera backend that synthesizes frames and capture results in software
//!
//! Stands in for real hardware in the demo binary and in tests. It models
//! both backend kinds: recycling mode converts each rendered frame into a
//! pooled NV21 buffer, opaque mode hands out its own images and refuses to
//! produce more while `max_images` of them are still open.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::{imageops, ExtendedColorType, GrayImage};
use tracing::{debug, info, trace, warn};

use super::convert::{nv21_frame_len, quarter_len, quarter_nv21, yuv420_to_nv21, Yuv420Planes};
use super::device::{
    AeState, AfState, AfTrigger, CameraCharacteristics, CameraDevice, CaptureMetadata,
    CaptureRequest, Facing, PrecaptureTrigger, RequestTemplate,
};
use super::frame::Rotation;
use crate::control::events::CameraEvents;
use crate::error::CameraError;
use crate::pipeline::pool::{BackendKind, ExternalImage};
use crate::CameraConfig;

/// Behaviour knobs for [`SimulatedCamera`].
#[derive(Debug, Clone)]
pub struct SimulatedSettings {
    pub kind: BackendKind,
    pub sensor_orientation: u32,
    pub flash_supported: bool,
    /// Report AF state in capture metadata.
    pub report_af_state: bool,
    /// Report AE state in capture metadata.
    pub report_ae_state: bool,
    /// AE reports `FlashRequired` until a precapture sequence has run.
    pub needs_precapture: bool,
    /// Results reporting `Precapture` after the precapture trigger.
    pub precapture_frames: u32,
    /// Whether an AF trigger ends in `FocusedLocked` or `NotFocusedLocked`.
    pub focus_locks: bool,
    /// Fail every still-capture request.
    pub fail_still_capture: bool,
    /// Open images allowed at once in opaque mode.
    pub max_images: usize,
    pub jpeg_quality: u8,
    /// Highest zoom step, `0` for a fixed lens.
    pub max_zoom: u32,
}

impl Default for SimulatedSettings {
    fn default() -> Self {
        Self {
            kind: BackendKind::BufferRecycling,
            sensor_orientation: 90,
            flash_supported: true,
            report_af_state: true,
            report_ae_state: true,
            needs_precapture: false,
            precapture_frames: 2,
            focus_locks: true,
            fail_still_capture: false,
            max_images: 2,
            jpeg_quality: 90,
            max_zoom: 30,
        }
    }
}

enum Command {
    Repeating(CaptureRequest),
    StopRepeating,
    Capture(CaptureRequest),
    Close,
}

/// Software camera. Frames and results are produced on a worker thread
/// started by [`open`](CameraDevice::open).
pub struct SimulatedCamera {
    settings: SimulatedSettings,
    facing: Facing,
    width: u32,
    height: u32,
    fps: u32,
    commands: Option<flume::Sender<Command>>,
    worker: Option<JoinHandle<()>>,
    outstanding: Arc<AtomicUsize>,
}

impl SimulatedCamera {
    pub fn new(settings: SimulatedSettings) -> Self {
        Self {
            settings,
            facing: Facing::Back,
            width: 0,
            height: 0,
            fps: 30,
            commands: None,
            worker: None,
            outstanding: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn settings(&self) -> &SimulatedSettings {
        &self.settings
    }

    /// Images handed to the pipeline and not yet closed.
    pub fn outstanding_images(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    pub fn is_open(&self) -> bool {
        self.worker.is_some()
    }

    fn send(&self, command: Command) -> Result<(), CameraError> {
        self.commands
            .as_ref()
            .ok_or(CameraError::Closed)?
            .send(command)
            .map_err(|_| CameraError::Closed)
    }
}

impl CameraDevice for SimulatedCamera {
    fn kind(&self) -> BackendKind {
        self.settings.kind
    }

    fn characteristics(
        &mut self,
        config: &CameraConfig,
    ) -> Result<CameraCharacteristics, CameraError> {
        if config.width < 4 || config.height < 4 {
            return Err(CameraError::Unsupported(format!(
                "preview size {}x{}",
                config.width, config.height
            )));
        }
        // NV21 needs even dimensions.
        self.width = config.width & !1;
        self.height = config.height & !1;
        self.fps = config.fps.max(1);
        self.facing = config.facing;

        Ok(CameraCharacteristics {
            facing: self.facing,
            sensor_orientation: self.settings.sensor_orientation,
            flash_supported: self.settings.flash_supported,
            preview_width: self.width,
            preview_height: self.height,
            max_zoom: self.settings.max_zoom,
        })
    }

    fn open(&mut self, events: CameraEvents) -> Result<(), CameraError> {
        if self.worker.is_some() {
            return Err(CameraError::Unsupported("camera already open".into()));
        }
        if self.width == 0 {
            return Err(CameraError::Unsupported(
                "characteristics not negotiated".into(),
            ));
        }

        let (tx, rx) = flume::unbounded();
        let worker = Worker::new(
            events,
            self.settings.clone(),
            self.width as usize,
            self.height as usize,
            Duration::from_secs(1) / self.fps,
            self.outstanding.clone(),
        );
        let handle = thread::Builder::new()
            .name("simulated-camera".into())
            .spawn(move || worker.run(rx))?;

        info!(
            width = self.width,
            height = self.height,
            fps = self.fps,
            kind = ?self.settings.kind,
            "Simulated camera opened"
        );
        self.commands = Some(tx);
        self.worker = Some(handle);
        Ok(())
    }

    fn set_repeating_request(&mut self, request: &CaptureRequest) -> Result<(), CameraError> {
        self.send(Command::Repeating(request.clone()))
    }

    fn stop_repeating(&mut self) -> Result<(), CameraError> {
        self.send(Command::StopRepeating)
    }

    fn capture(&mut self, request: &CaptureRequest) -> Result<(), CameraError> {
        self.send(Command::Capture(request.clone()))
    }

    fn close(&mut self) {
        if let Some(commands) = self.commands.take() {
            let _ = commands.send(Command::Close);
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("Simulated camera worker panicked");
            }
            debug!("Simulated camera closed");
        }
    }
}

impl Drop for SimulatedCamera {
    fn drop(&mut self) {
        self.close();
    }
}

/// An opaque-mode image. Closing it frees a reader slot.
struct SimulatedImage {
    data: Bytes,
    outstanding: Arc<AtomicUsize>,
}

impl ExternalImage for SimulatedImage {
    fn data(&self) -> &[u8] {
        &self.data
    }

    fn close(self: Box<Self>) {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
    }
}

struct Worker {
    events: CameraEvents,
    settings: SimulatedSettings,
    width: usize,
    height: usize,
    interval: Duration,
    outstanding: Arc<AtomicUsize>,
    repeating: Option<CaptureRequest>,
    sensor_frame: u64,
    af: AfState,
    precapture_left: u32,
    precaptured: bool,
    y: Vec<u8>,
    u: Vec<u8>,
    v: Vec<u8>,
}

impl Worker {
    fn new(
        events: CameraEvents,
        settings: SimulatedSettings,
        width: usize,
        height: usize,
        interval: Duration,
        outstanding: Arc<AtomicUsize>,
    ) -> Self {
        let chroma = (width / 2) * (height / 2);
        Self {
            events,
            settings,
            width,
            height,
            interval,
            outstanding,
            repeating: None,
            sensor_frame: 0,
            af: AfState::Inactive,
            precapture_left: 0,
            precaptured: false,
            y: vec![0; width * height],
            u: vec![128; chroma],
            v: vec![128; chroma],
        }
    }

    fn run(mut self, commands: flume::Receiver<Command>) {
        let mut next_frame = Instant::now() + self.interval;
        loop {
            match commands.recv_deadline(next_frame) {
                Ok(Command::Repeating(request)) => {
                    trace!(zoom = request.zoom, "Repeating request");
                    self.repeating = Some(request);
                }
                Ok(Command::StopRepeating) => self.repeating = None,
                Ok(Command::Capture(request)) => self.one_shot(&request),
                Ok(Command::Close) | Err(flume::RecvTimeoutError::Disconnected) => break,
                Err(flume::RecvTimeoutError::Timeout) => {
                    next_frame += self.interval;
                    self.tick();
                }
            }
        }
        debug!(frames = self.sensor_frame, "Simulated camera worker exiting");
    }

    fn tick(&mut self) {
        let Some(request) = self.repeating.clone() else {
            return;
        };
        self.stream_frame();
        let metadata = self.metadata(&request);
        self.events.capture_completed(request.tag, metadata);
    }

    fn one_shot(&mut self, request: &CaptureRequest) {
        match request.template {
            RequestTemplate::StillCapture => self.still(request),
            RequestTemplate::Preview => {
                let metadata = self.metadata(request);
                self.events.capture_completed(request.tag, metadata);
            }
        }
    }

    /// Advances the AF and AE models by one result.
    fn metadata(&mut self, request: &CaptureRequest) -> CaptureMetadata {
        match request.af_trigger {
            AfTrigger::Start if self.settings.focus_locks => self.af = AfState::FocusedLocked,
            AfTrigger::Start => self.af = AfState::NotFocusedLocked,
            AfTrigger::Cancel => self.af = AfState::Inactive,
            AfTrigger::Idle => {
                if !matches!(self.af, AfState::FocusedLocked | AfState::NotFocusedLocked) {
                    self.af = AfState::PassiveFocused;
                }
            }
        }

        if request.precapture_trigger == PrecaptureTrigger::Start {
            self.precapture_left = self.settings.precapture_frames;
            self.precaptured = true;
        }
        let ae = if self.precapture_left > 0 {
            self.precapture_left -= 1;
            AeState::Precapture
        } else if self.settings.needs_precapture && !self.precaptured {
            AeState::FlashRequired
        } else {
            AeState::Converged
        };

        CaptureMetadata {
            af_state: self.settings.report_af_state.then_some(self.af),
            ae_state: self.settings.report_ae_state.then_some(ae),
        }
    }

    fn still(&mut self, request: &CaptureRequest) {
        if self.settings.fail_still_capture {
            self.events
                .capture_failed(request.tag, "still capture failed on sensor");
            return;
        }

        let metadata = self.metadata(request);
        self.events.capture_progressed(request.tag, metadata);

        self.render();
        let orientation = request.jpeg_orientation.unwrap_or_default();
        match self.encode_still(orientation) {
            Ok(jpeg) => self.events.still_image(jpeg),
            Err(err) => {
                self.events.capture_failed(request.tag, err.to_string());
                return;
            }
        }

        // The next still has to meter again.
        self.precaptured = false;
        self.events.capture_completed(request.tag, metadata);
    }

    fn encode_still(&self, orientation: Rotation) -> image::ImageResult<Bytes> {
        let luma = GrayImage::from_raw(self.width as u32, self.height as u32, self.y.clone())
            .ok_or_else(|| {
                image::ImageError::Parameter(image::error::ParameterError::from_kind(
                    image::error::ParameterErrorKind::DimensionMismatch,
                ))
            })?;
        let upright = match orientation {
            Rotation::Deg0 => luma,
            Rotation::Deg90 => imageops::rotate90(&luma),
            Rotation::Deg180 => imageops::rotate180(&luma),
            Rotation::Deg270 => imageops::rotate270(&luma),
        };

        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, self.settings.jpeg_quality).encode(
            upright.as_raw(),
            upright.width(),
            upright.height(),
            ExtendedColorType::L8,
        )?;
        Ok(Bytes::from(out))
    }

    fn stream_frame(&mut self) {
        self.sensor_frame += 1;
        self.render();
        match self.settings.kind {
            BackendKind::BufferRecycling => self.deliver_pooled(),
            BackendKind::OpaqueImage => self.deliver_image(),
        }
    }

    fn planes(&self) -> Yuv420Planes<'_> {
        Yuv420Planes {
            y: &self.y,
            u: &self.u,
            v: &self.v,
            width: self.width,
            height: self.height,
        }
    }

    fn deliver_pooled(&mut self) {
        let Some(mut buffer) = self.events.acquire_buffer() else {
            trace!(frame = self.sensor_frame, "No free preview buffer, skipping sensor frame");
            return;
        };
        match yuv420_to_nv21(&self.planes(), buffer.as_mut_slice()) {
            Some(len) => buffer.set_len(len),
            None => warn!(
                capacity = buffer.capacity(),
                "Preview buffer too small for frame"
            ),
        }
        // Refused buffers are recycled by the pipeline.
        let _ = self.events.frame_available(buffer);
    }

    fn deliver_image(&mut self) {
        if self.outstanding.load(Ordering::Acquire) >= self.settings.max_images {
            trace!(frame = self.sensor_frame, "Image reader full, skipping sensor frame");
            return;
        }

        let mut nv21 = vec![0; nv21_frame_len(self.width, self.height)];
        if yuv420_to_nv21(&self.planes(), &mut nv21).is_none() {
            return;
        }
        let data = if (self.events.layout().width as usize) < self.width {
            let mut small = vec![0; quarter_len(self.width, self.height)];
            quarter_nv21(&nv21, self.width, self.height, &mut small);
            small
        } else {
            nv21
        };

        self.outstanding.fetch_add(1, Ordering::AcqRel);
        let image = SimulatedImage {
            data: Bytes::from(data),
            outstanding: self.outstanding.clone(),
        };
        let _ = self.events.image_available(Box::new(image));
    }

    /// Scrolling rows of dark blocks on a light page, roughly the shape of
    /// printed text.
    fn render(&mut self) {
        let shift = (self.sensor_frame * 2) as usize;
        for (row, line) in self.y.chunks_exact_mut(self.width).enumerate() {
            let text_row = (row + shift) % 24 < 12;
            for (col, px) in line.iter_mut().enumerate() {
                let glyph = text_row && (col / 6) % 3 != 2 && (col + row) % 7 != 0;
                *px = if glyph { 40 } else { 220 };
            }
        }
    }
}
