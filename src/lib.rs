pub mod capture;
pub mod control;
pub mod detector;
pub mod error;
pub mod pipeline;

use std::path::{Path, PathBuf};

use capture::frame::Rotation;
use capture::{Facing, FlashMode, FocusMode};
use color_eyre::Result;
use pipeline::BackendKind;
use serde::{Deserialize, Serialize};

pub use capture::{CameraDevice, Frame, FrameLayout, SimulatedCamera, SimulatedSettings};
pub use control::{CameraSession, CaptureEvent, CaptureState, StillImage, StoppedSession};
pub use detector::DetectorSink;
pub use error::{CameraError, DetectorError, PipelineError, SessionError};
pub use pipeline::{FrameBufferPool, FramePipeline, PipelineStats};

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub camera: CameraConfig,
    pub pipeline: PipelineConfig,
    pub capture: CaptureConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub facing: Facing,
    pub focus_mode: FocusMode,
    /// Ignored on cameras without a flash unit.
    pub flash_mode: FlashMode,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub backend: BackendKind,
    /// Current rotation of the display, one of 0, 90, 180, 270.
    pub display_rotation: Rotation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Preview buffers allocated for buffer-recycling backends.
    pub buffer_count: usize,
    /// Deliver frames at a quarter of the preview width and height
    /// (opaque-image backends only).
    pub downscale_quarter: bool,
    /// Pin the frame consumer to this CPU core.
    pub consumer_core: Option<usize>,
    pub thread_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub jpeg_quality: u8,
    /// Where the demo binary writes still captures.
    pub output_dir: PathBuf,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            facing: Facing::Back,
            focus_mode: FocusMode::ContinuousPicture,
            flash_mode: FlashMode::Off,
            width: 1024,
            height: 768,
            fps: 30,
            backend: BackendKind::BufferRecycling,
            display_rotation: Rotation::Deg0,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            buffer_count: 4,
            downscale_quarter: false,
            consumer_core: None,
            thread_name: "frame-consumer".into(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            jpeg_quality: 90,
            output_dir: PathBuf::from("captures"),
        }
    }
}

impl Config {
    /// Defaults, then the optional TOML file, then `TEXTCAM_*` environment
    /// variables (`TEXTCAM_CAMERA__WIDTH=640`).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Config::default())?);
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let config = builder
            .add_source(
                config::Environment::with_prefix("TEXTCAM")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_without_file() {
        let config = Config::load(None).unwrap();
        assert_eq!(config.camera.width, 1024);
        assert_eq!(config.camera.height, 768);
        assert_eq!(config.pipeline.buffer_count, 4);
        assert_eq!(config.pipeline.consumer_core, None);
    }

    #[test]
    fn toml_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[camera]
facing = "front"
backend = "opaque_image"
display_rotation = 270
width = 640

[pipeline]
buffer_count = 2
downscale_quarter = true
"#
        )
        .unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.camera.facing, Facing::Front);
        assert_eq!(config.camera.backend, BackendKind::OpaqueImage);
        assert_eq!(config.camera.display_rotation, Rotation::Deg270);
        assert_eq!(config.camera.width, 640);
        assert_eq!(config.camera.height, 768);
        assert_eq!(config.pipeline.buffer_count, 2);
        assert!(config.pipeline.downscale_quarter);
        assert_eq!(config.capture.jpeg_quality, 90);
    }

    #[test]
    fn rejects_odd_display_rotation() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[camera]\ndisplay_rotation = 45").unwrap();
        assert!(Config::load(Some(file.path())).is_err());
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Config::load(Some(&dir.path().join("absent.toml"))).is_err());
    }
}
