//! What the session needs from a camera backend
//!
//! A backend produces preview frames and capture results on its own threads
//! and reports them through [`CameraEvents`]. Requests go the other way,
//! from the capture control thread, through [`CameraDevice`].

use serde::{Deserialize, Serialize};

use super::frame::Rotation;
use crate::control::events::CameraEvents;
use crate::error::CameraError;
use crate::pipeline::pool::BackendKind;
use crate::CameraConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Facing {
    #[default]
    Back,
    Front,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FocusMode {
    Off,
    Auto,
    Macro,
    #[default]
    ContinuousPicture,
    ContinuousVideo,
    Edof,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlashMode {
    #[default]
    Off,
    On,
    Auto,
    Always,
    RedEye,
}

/// Autofocus state reported in capture metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfState {
    Inactive,
    PassiveScan,
    PassiveFocused,
    PassiveUnfocused,
    ActiveScan,
    FocusedLocked,
    NotFocusedLocked,
}

impl AfState {
    /// States in which autofocus will not move any further on its own.
    pub fn is_settled(self) -> bool {
        matches!(
            self,
            AfState::FocusedLocked
                | AfState::NotFocusedLocked
                | AfState::PassiveUnfocused
                | AfState::PassiveFocused
                | AfState::Inactive
        )
    }
}

/// Auto-exposure state reported in capture metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AeState {
    Inactive,
    Searching,
    Converged,
    Locked,
    FlashRequired,
    Precapture,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AfTrigger {
    #[default]
    Idle,
    Start,
    Cancel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrecaptureTrigger {
    #[default]
    Idle,
    Start,
}

/// Identifies which request a capture result belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestTag {
    /// The repeating preview request.
    Preview,
    /// One-shot autofocus lock at the start of a still capture.
    FocusLock,
    /// One-shot auto-exposure precapture trigger.
    Precapture,
    /// The still image itself.
    StillCapture,
    /// One-shot autofocus cancel after a still capture.
    FocusUnlock,
    /// One-shot autofocus on a user-selected region.
    TapFocus,
    /// One-shot autofocus cancel ahead of a tap-to-focus trigger.
    FocusCancel,
}

impl RequestTag {
    /// Whether results for this request advance the still-capture sequence.
    pub fn drives_capture_sequence(self) -> bool {
        !matches!(
            self,
            RequestTag::StillCapture | RequestTag::TapFocus | RequestTag::FocusCancel
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestTemplate {
    Preview,
    StillCapture,
}

/// Metering rectangle in sensor coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FocusRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub weight: u32,
}

impl FocusRegion {
    pub const HALF_SIZE: u32 = 150;
    pub const MAX_WEIGHT: u32 = 1000;

    /// A square around a normalized touch point (`0.0..=1.0` on both axes).
    pub fn around(touch_x: f32, touch_y: f32, sensor_width: u32, sensor_height: u32) -> Self {
        let x = (touch_x.clamp(0.0, 1.0) * sensor_width as f32) as u32;
        let y = (touch_y.clamp(0.0, 1.0) * sensor_height as f32) as u32;
        Self {
            x: x.saturating_sub(Self::HALF_SIZE),
            y: y.saturating_sub(Self::HALF_SIZE),
            width: Self::HALF_SIZE * 2,
            height: Self::HALF_SIZE * 2,
            weight: Self::MAX_WEIGHT - 1,
        }
    }
}

/// Settings for one capture request.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureRequest {
    pub tag: RequestTag,
    pub template: RequestTemplate,
    pub focus_mode: FocusMode,
    /// `None` when the camera has no flash unit.
    pub flash_mode: Option<FlashMode>,
    pub af_trigger: AfTrigger,
    pub precapture_trigger: PrecaptureTrigger,
    pub af_region: Option<FocusRegion>,
    /// Only set on still captures.
    pub jpeg_orientation: Option<Rotation>,
    /// Zoom step, `0..=max_zoom`.
    pub zoom: u32,
}

impl CaptureRequest {
    pub fn preview(focus_mode: FocusMode, flash_mode: Option<FlashMode>) -> Self {
        Self {
            tag: RequestTag::Preview,
            template: RequestTemplate::Preview,
            focus_mode,
            flash_mode,
            af_trigger: AfTrigger::Idle,
            precapture_trigger: PrecaptureTrigger::Idle,
            af_region: None,
            jpeg_orientation: None,
            zoom: 0,
        }
    }

    pub fn tagged(&self, tag: RequestTag) -> Self {
        Self { tag, ..self.clone() }
    }

    pub fn with_af_trigger(mut self, trigger: AfTrigger) -> Self {
        self.af_trigger = trigger;
        self
    }

    pub fn with_precapture_trigger(mut self, trigger: PrecaptureTrigger) -> Self {
        self.precapture_trigger = trigger;
        self
    }

    pub fn with_focus_region(mut self, region: FocusRegion) -> Self {
        self.focus_mode = FocusMode::Auto;
        self.af_region = Some(region);
        self
    }

    /// A still capture reusing this request's focus and flash settings.
    pub fn still(&self, orientation: Rotation) -> Self {
        Self {
            tag: RequestTag::StillCapture,
            template: RequestTemplate::StillCapture,
            af_trigger: AfTrigger::Idle,
            precapture_trigger: PrecaptureTrigger::Idle,
            jpeg_orientation: Some(orientation),
            ..self.clone()
        }
    }
}

/// Per-result metadata. Either field may be missing on some devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CaptureMetadata {
    pub af_state: Option<AfState>,
    pub ae_state: Option<AeState>,
}

/// Static properties of an opened camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CameraCharacteristics {
    pub facing: Facing,
    /// Clockwise mounting angle of the sensor.
    pub sensor_orientation: u32,
    pub flash_supported: bool,
    /// Negotiated preview size.
    pub preview_width: u32,
    pub preview_height: u32,
    /// Highest zoom step, `0` when the camera cannot zoom.
    pub max_zoom: u32,
}

/// Next zoom step after a pinch of `scale`.
///
/// Steps are counted from 1 while scaling: above 1 the level grows by
/// `scale` tenths of the maximum, otherwise it shrinks proportionally. The
/// result is clamped to `0..=max`.
pub fn zoom_level(current: u32, max: u32, scale: f32) -> u32 {
    let current = current.min(max) as f32 + 1.0;
    let next = if scale > 1.0 {
        current + scale * (max / 10) as f32
    } else {
        current * scale
    };
    // NaN casts to 0.
    (next.round() as i64 - 1).clamp(0, i64::from(max)) as u32
}

/// A camera backend.
///
/// Request methods return immediately; their results arrive later through
/// the [`CameraEvents`] handle passed to [`open`](CameraDevice::open), each
/// carrying the [`RequestTag`] of the request it belongs to.
pub trait CameraDevice: Send + 'static {
    /// How this backend hands out frame memory.
    fn kind(&self) -> BackendKind;

    /// Looks up the camera matching `config` and negotiates the preview size.
    fn characteristics(&mut self, config: &CameraConfig) -> Result<CameraCharacteristics, CameraError>;

    /// Starts delivering frames and results to `events`.
    fn open(&mut self, events: CameraEvents) -> Result<(), CameraError>;

    fn set_repeating_request(&mut self, request: &CaptureRequest) -> Result<(), CameraError>;

    fn stop_repeating(&mut self) -> Result<(), CameraError>;

    /// Issues a one-shot request.
    fn capture(&mut self, request: &CaptureRequest) -> Result<(), CameraError>;

    /// Stops all callbacks. No event is delivered after this returns.
    fn close(&mut self);
}
