use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use textcam::capture::convert::quarter_len;
use textcam::capture::device::{
    AeState, AfState, CameraCharacteristics, CaptureMetadata, CaptureRequest, RequestTag,
};
use textcam::capture::{CameraDevice, FocusRegion, FrameLayout};
use textcam::control::{CameraEvents, CaptureEvent, CaptureState};
use textcam::pipeline::BackendKind;
use textcam::{
    CameraError, CameraSession, Config, DetectorError, DetectorSink, Frame, SessionError,
    SimulatedCamera, SimulatedSettings,
};

const TIMEOUT: Duration = Duration::from_secs(10);

fn small_config() -> Config {
    let mut config = Config::default();
    config.camera.width = 64;
    config.camera.height = 48;
    config.camera.fps = 200;
    config.pipeline.buffer_count = 3;
    config
}

fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + TIMEOUT;
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(2));
    }
}

fn next_matching(
    events: &flume::Receiver<CaptureEvent>,
    mut wanted: impl FnMut(&CaptureEvent) -> bool,
) -> CaptureEvent {
    let deadline = Instant::now() + TIMEOUT;
    loop {
        let event = events
            .recv_deadline(deadline)
            .expect("capture event before timeout");
        if wanted(&event) {
            return event;
        }
    }
}

/// Counts frames and records the last layout and payload size it saw.
#[derive(Clone, Default)]
struct FrameCounter {
    frames: Arc<AtomicU64>,
    last: Arc<Mutex<Option<(FrameLayout, usize)>>>,
    released: Arc<AtomicUsize>,
}

impl DetectorSink for FrameCounter {
    fn process(&mut self, frame: &Frame) -> Result<(), DetectorError> {
        self.frames.fetch_add(1, Ordering::SeqCst);
        *self.last.lock().unwrap() = Some((*frame.layout(), frame.data().len()));
        Ok(())
    }

    fn release(self) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

fn simulated(settings: SimulatedSettings) -> SimulatedCamera {
    SimulatedCamera::new(settings)
}

#[test]
fn take_picture_delivers_a_jpeg_and_returns_to_preview() {
    let counter = FrameCounter::default();
    let session =
        CameraSession::start(&small_config(), simulated(SimulatedSettings::default()), counter.clone())
            .unwrap();
    let events = session.events();

    wait_until("first frame", || counter.frames.load(Ordering::SeqCst) > 0);
    assert!(session.take_picture());

    next_matching(&events, |e| matches!(e, CaptureEvent::Shutter));
    let CaptureEvent::Picture(still) =
        next_matching(&events, |e| matches!(e, CaptureEvent::Picture(_)))
    else {
        unreachable!()
    };
    assert_eq!(still.sequence, 1);
    assert_eq!(&still.jpeg[..2], &[0xFF, 0xD8]);
    assert_eq!(still.orientation, session.jpeg_orientation());

    wait_until("preview", || session.capture_state() == CaptureState::Preview);
    let before = counter.frames.load(Ordering::SeqCst);
    wait_until("preview frames after capture", || {
        counter.frames.load(Ordering::SeqCst) > before
    });

    let (stats, camera) = session.stop().unwrap().release();
    assert!(!camera.is_open());
    assert_eq!(counter.released.load(Ordering::SeqCst), 1);
    assert_eq!(stats.submitted, stats.processed + stats.dropped);
}

#[test]
fn flash_exposure_runs_precapture_first() {
    let counter = FrameCounter::default();
    let settings = SimulatedSettings {
        needs_precapture: true,
        precapture_frames: 3,
        ..SimulatedSettings::default()
    };
    let session = CameraSession::start(&small_config(), simulated(settings), counter).unwrap();
    let events = session.events();

    assert!(session.take_picture());
    next_matching(&events, |e| matches!(e, CaptureEvent::Picture(_)));
    wait_until("preview", || session.capture_state() == CaptureState::Preview);

    session.stop().unwrap().release();
}

#[test]
fn failed_still_aborts_to_preview() {
    let settings = SimulatedSettings {
        fail_still_capture: true,
        ..SimulatedSettings::default()
    };
    let session =
        CameraSession::start(&small_config(), simulated(settings), FrameCounter::default()).unwrap();
    let events = session.events();

    assert!(session.take_picture());
    next_matching(&events, |e| matches!(e, CaptureEvent::CaptureAborted { .. }));
    wait_until("preview", || session.capture_state() == CaptureState::Preview);

    // A new capture can start after the abort.
    assert!(session.take_picture());
    next_matching(&events, |e| matches!(e, CaptureEvent::CaptureAborted { .. }));

    session.stop().unwrap().release();
}

#[test]
fn tap_to_focus_reports_outcome() {
    for locks in [true, false] {
        let settings = SimulatedSettings {
            focus_locks: locks,
            ..SimulatedSettings::default()
        };
        let session =
            CameraSession::start(&small_config(), simulated(settings), FrameCounter::default()).unwrap();
        let events = session.events();

        assert!(session.focus_at(FocusRegion::around(0.5, 0.5, 64, 48)));
        let event = next_matching(&events, |e| matches!(e, CaptureEvent::FocusFinished { .. }));
        assert!(matches!(event, CaptureEvent::FocusFinished { success } if success == locks));

        session.stop().unwrap().release();
    }
}

#[test]
fn opaque_backend_delivers_quarter_frames_and_closes_images() {
    let mut config = small_config();
    config.camera.backend = BackendKind::OpaqueImage;
    config.pipeline.downscale_quarter = true;
    let settings = SimulatedSettings {
        kind: BackendKind::OpaqueImage,
        sensor_orientation: 270,
        ..SimulatedSettings::default()
    };

    let counter = FrameCounter::default();
    let session = CameraSession::start(&config, simulated(settings), counter.clone()).unwrap();
    let layout = session.frame_layout();
    assert_eq!((layout.width, layout.height), (16, 12));

    wait_until("a few frames", || counter.frames.load(Ordering::SeqCst) >= 3);
    let (seen_layout, len) = counter.last.lock().unwrap().expect("a frame");
    assert_eq!(seen_layout, layout);
    assert_eq!(seen_layout.rotation.degrees(), 270);
    assert_eq!(len, quarter_len(64, 48));

    let (_, camera) = session.stop().unwrap().release();
    assert_eq!(camera.outstanding_images(), 0);
}

/// Scripted camera that fails chosen one-shot requests and records every
/// request it receives.
#[derive(Default)]
struct ScriptedCamera {
    fail_tag: Option<RequestTag>,
    fail_characteristics: bool,
    events: Option<CameraEvents>,
    log: Arc<Mutex<Vec<(&'static str, RequestTag)>>>,
    closed: Arc<AtomicUsize>,
    max_zoom: u32,
    /// Zoom step of every repeating request.
    zooms: Arc<Mutex<Vec<u32>>>,
}

impl CameraDevice for ScriptedCamera {
    fn kind(&self) -> BackendKind {
        BackendKind::BufferRecycling
    }

    fn characteristics(
        &mut self,
        config: &textcam::CameraConfig,
    ) -> Result<CameraCharacteristics, CameraError> {
        if self.fail_characteristics {
            return Err(CameraError::AccessRevoked("test".into()));
        }
        Ok(CameraCharacteristics {
            facing: config.facing,
            sensor_orientation: 90,
            flash_supported: false,
            preview_width: config.width,
            preview_height: config.height,
            max_zoom: self.max_zoom,
        })
    }

    fn open(&mut self, events: CameraEvents) -> Result<(), CameraError> {
        self.events = Some(events);
        Ok(())
    }

    fn set_repeating_request(&mut self, request: &CaptureRequest) -> Result<(), CameraError> {
        self.log.lock().unwrap().push(("repeating", request.tag));
        self.zooms.lock().unwrap().push(request.zoom);
        Ok(())
    }

    fn stop_repeating(&mut self) -> Result<(), CameraError> {
        Ok(())
    }

    fn capture(&mut self, request: &CaptureRequest) -> Result<(), CameraError> {
        self.log.lock().unwrap().push(("capture", request.tag));
        if self.fail_tag == Some(request.tag) {
            return Err(CameraError::RequestFailed {
                tag: request.tag,
                reason: "scripted".into(),
            });
        }
        if let Some(events) = &self.events {
            events.capture_completed(
                request.tag,
                CaptureMetadata {
                    af_state: Some(AfState::FocusedLocked),
                    ae_state: Some(AeState::Converged),
                },
            );
        }
        Ok(())
    }

    fn close(&mut self) {
        self.events = None;
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn rejected_request_aborts_and_restores_preview() {
    let camera = ScriptedCamera {
        fail_tag: Some(RequestTag::FocusLock),
        ..ScriptedCamera::default()
    };
    let log = camera.log.clone();
    let session = CameraSession::start(&small_config(), camera, FrameCounter::default()).unwrap();
    let events = session.events();

    assert!(session.take_picture());
    let event = next_matching(&events, |e| matches!(e, CaptureEvent::CaptureAborted { .. }));
    assert!(matches!(event, CaptureEvent::CaptureAborted { reason } if reason.contains("scripted")));
    wait_until("preview", || session.capture_state() == CaptureState::Preview);

    let (_, camera) = session.stop().unwrap().release();
    assert_eq!(camera.closed.load(Ordering::SeqCst), 1);
    let log = log.lock().unwrap();
    let repeating = log.iter().filter(|(kind, _)| *kind == "repeating").count();
    assert_eq!(repeating, 2, "initial preview plus the restore: {log:?}");
}

#[test]
fn scripted_still_capture_runs_full_sequence() {
    let camera = ScriptedCamera::default();
    let log = camera.log.clone();
    let session = CameraSession::start(&small_config(), camera, FrameCounter::default()).unwrap();
    let events = session.events();

    assert!(session.take_picture());
    next_matching(&events, |e| matches!(e, CaptureEvent::Shutter));
    wait_until("unlock", || {
        log.lock()
            .unwrap()
            .contains(&("capture", RequestTag::FocusUnlock))
    });
    wait_until("preview", || session.capture_state() == CaptureState::Preview);
    session.stop().unwrap().release();

    let tags: Vec<_> = log
        .lock()
        .unwrap()
        .iter()
        .filter(|(kind, _)| *kind == "capture")
        .map(|&(_, tag)| tag)
        .collect();
    assert_eq!(
        tags,
        vec![
            RequestTag::FocusLock,
            RequestTag::StillCapture,
            RequestTag::FocusUnlock
        ]
    );
}

#[test]
fn failed_start_releases_detector() {
    let counter = FrameCounter::default();
    let camera = ScriptedCamera {
        fail_characteristics: true,
        ..ScriptedCamera::default()
    };
    let err = CameraSession::start(&small_config(), camera, counter.clone())
        .err()
        .expect("start fails");
    assert!(matches!(err, SessionError::Camera(CameraError::AccessRevoked(_))));
    assert_eq!(counter.released.load(Ordering::SeqCst), 1);
}

#[test]
fn zoom_reissues_preview_at_new_level() {
    let camera = ScriptedCamera {
        max_zoom: 30,
        ..ScriptedCamera::default()
    };
    let zooms = camera.zooms.clone();
    let session = CameraSession::start(&small_config(), camera, FrameCounter::default()).unwrap();

    assert!(session.zoom(2.0));
    wait_until("zoom in", || session.zoom_level() == 6);
    assert!(session.zoom(0.5));
    wait_until("zoom out", || session.zoom_level() == 3);
    // A still capture keeps the zoom of the preview it restores.
    assert!(session.take_picture());
    wait_until("preview", || zooms.lock().unwrap().len() == 4);
    session.stop().unwrap().release();

    assert_eq!(*zooms.lock().unwrap(), vec![0, 6, 3, 3]);
}

#[test]
fn zoom_is_ignored_without_zoom_support() {
    let camera = ScriptedCamera::default();
    let zooms = camera.zooms.clone();
    let session = CameraSession::start(&small_config(), camera, FrameCounter::default()).unwrap();
    let events = session.events();

    assert!(session.zoom(3.0));
    // Control events are handled in order, so the shutter follows the zoom.
    assert!(session.take_picture());
    next_matching(&events, |e| matches!(e, CaptureEvent::Shutter));
    assert_eq!(session.zoom_level(), 0);
    session.stop().unwrap().release();

    assert!(zooms.lock().unwrap().iter().all(|&zoom| zoom == 0));
}

/// Camera that delivers preview results only while a repeating request is
/// active, and answers tap-to-focus long after the trigger.
#[derive(Default)]
struct LateFocusCamera {
    repeating: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
    events: Option<CameraEvents>,
    ticker: Option<JoinHandle<()>>,
}

impl LateFocusCamera {
    const TAP_FOCUS_DELAY: Duration = Duration::from_millis(150);
}

impl CameraDevice for LateFocusCamera {
    fn kind(&self) -> BackendKind {
        BackendKind::BufferRecycling
    }

    fn characteristics(
        &mut self,
        config: &textcam::CameraConfig,
    ) -> Result<CameraCharacteristics, CameraError> {
        Ok(CameraCharacteristics {
            facing: config.facing,
            sensor_orientation: 90,
            flash_supported: false,
            preview_width: config.width,
            preview_height: config.height,
            max_zoom: 0,
        })
    }

    fn open(&mut self, events: CameraEvents) -> Result<(), CameraError> {
        let (repeating, closed, ticks) =
            (self.repeating.clone(), self.closed.clone(), events.clone());
        self.ticker = Some(thread::spawn(move || {
            while !closed.load(Ordering::SeqCst) {
                if repeating.load(Ordering::SeqCst) {
                    ticks.capture_completed(
                        RequestTag::Preview,
                        CaptureMetadata {
                            af_state: Some(AfState::FocusedLocked),
                            ae_state: Some(AeState::Converged),
                        },
                    );
                }
                thread::sleep(Duration::from_millis(5));
            }
        }));
        self.events = Some(events);
        Ok(())
    }

    fn set_repeating_request(&mut self, _: &CaptureRequest) -> Result<(), CameraError> {
        self.repeating.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop_repeating(&mut self) -> Result<(), CameraError> {
        self.repeating.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn capture(&mut self, request: &CaptureRequest) -> Result<(), CameraError> {
        let Some(events) = self.events.clone() else {
            return Err(CameraError::Closed);
        };
        let af_state = match request.tag {
            RequestTag::FocusLock => AfState::ActiveScan,
            RequestTag::TapFocus => {
                let closed = self.closed.clone();
                thread::spawn(move || {
                    thread::sleep(Self::TAP_FOCUS_DELAY);
                    if !closed.load(Ordering::SeqCst) {
                        events.capture_completed(
                            RequestTag::TapFocus,
                            CaptureMetadata {
                                af_state: Some(AfState::FocusedLocked),
                                ae_state: None,
                            },
                        );
                    }
                });
                return Ok(());
            }
            _ => AfState::FocusedLocked,
        };
        events.capture_completed(
            request.tag,
            CaptureMetadata {
                af_state: Some(af_state),
                ae_state: Some(AeState::Converged),
            },
        );
        Ok(())
    }

    fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
        self.repeating.store(false, Ordering::SeqCst);
        if let Some(ticker) = self.ticker.take() {
            let _ = ticker.join();
        }
        self.events = None;
    }
}

#[test]
fn picture_during_tap_focus_restores_preview_and_completes() {
    let camera = LateFocusCamera::default();
    let repeating = camera.repeating.clone();
    let session = CameraSession::start(&small_config(), camera, FrameCounter::default()).unwrap();
    let events = session.events();

    assert!(session.focus_at(FocusRegion::around(0.5, 0.5, 64, 48)));
    thread::sleep(Duration::from_millis(20));
    assert!(session.take_picture());

    // Focus lock only settles on preview results, which need the repeating
    // request that tap-to-focus stopped.
    let (mut shutter, mut focused) = (false, None);
    while !shutter || focused.is_none() {
        match next_matching(&events, |e| {
            matches!(e, CaptureEvent::Shutter | CaptureEvent::FocusFinished { .. })
        }) {
            CaptureEvent::Shutter => shutter = true,
            CaptureEvent::FocusFinished { success } => focused = Some(success),
            _ => unreachable!(),
        }
    }
    assert_eq!(focused, Some(true));
    wait_until("preview", || session.capture_state() == CaptureState::Preview);
    assert!(repeating.load(Ordering::SeqCst));

    session.stop().unwrap().release();
}
