use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::pipeline::pool::BufferHandle;

/// A preview frame on its way to the detector.
///
/// The pixel bytes live in the [`BufferHandle`] that backs the frame; the
/// frame is never mutated after the pipeline builds it and is consumed
/// exactly once.
pub struct Frame {
    meta: FrameMetadata,
    buffer: BufferHandle,
}

/// Frame metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameMetadata {
    /// Monotonic submission sequence, starting at 1.
    pub sequence: u64,
    /// Time since the pipeline started.
    pub timestamp: Duration,
    pub layout: FrameLayout,
}

/// Geometry and orientation of the pixels in a frame buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameLayout {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub rotation: Rotation,
}

/// Pixel formats we support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    /// Y plane followed by an interleaved V/U plane.
    Nv21,
    /// Three separate planes, as handed out by image readers.
    Yuv420,
    /// Greyscale, one byte per pixel.
    Luma8,
}

impl PixelFormat {
    pub fn bits_per_pixel(self) -> u32 {
        match self {
            PixelFormat::Nv21 | PixelFormat::Yuv420 => 12,
            PixelFormat::Luma8 => 8,
        }
    }
}

/// Clockwise rotation in quarter turns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum Rotation {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl Rotation {
    pub const ALL: [Rotation; 4] = [
        Rotation::Deg0,
        Rotation::Deg90,
        Rotation::Deg180,
        Rotation::Deg270,
    ];

    pub fn degrees(self) -> u32 {
        match self {
            Rotation::Deg0 => 0,
            Rotation::Deg90 => 90,
            Rotation::Deg180 => 180,
            Rotation::Deg270 => 270,
        }
    }

    /// Builds a rotation from any multiple of 90, wrapping at 360.
    pub fn from_degrees(degrees: u32) -> Option<Self> {
        match degrees % 360 {
            0 => Some(Rotation::Deg0),
            90 => Some(Rotation::Deg90),
            180 => Some(Rotation::Deg180),
            270 => Some(Rotation::Deg270),
            _ => None,
        }
    }

    /// Index in quarter turns (0..=3), the detector's rotation encoding.
    pub fn quarter_turns(self) -> u8 {
        (self.degrees() / 90) as u8
    }
}

impl TryFrom<u32> for Rotation {
    type Error = String;

    fn try_from(degrees: u32) -> Result<Self, Self::Error> {
        Rotation::from_degrees(degrees)
            .ok_or_else(|| format!("rotation must be a multiple of 90, got {degrees}"))
    }
}

impl From<Rotation> for u32 {
    fn from(rotation: Rotation) -> Self {
        rotation.degrees()
    }
}

impl fmt::Display for Rotation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}°", self.degrees())
    }
}

impl Frame {
    pub(crate) fn new(meta: FrameMetadata, buffer: BufferHandle) -> Self {
        Self { meta, buffer }
    }

    pub fn meta(&self) -> &FrameMetadata {
        &self.meta
    }

    pub fn sequence(&self) -> u64 {
        self.meta.sequence
    }

    pub fn layout(&self) -> &FrameLayout {
        &self.meta.layout
    }

    /// Pixel bytes. Only the prefix the producer filled is exposed.
    pub fn data(&self) -> &[u8] {
        self.buffer.data()
    }

    /// Hands the backing buffer back so it can be recycled or closed.
    pub(crate) fn into_buffer(self) -> BufferHandle {
        self.buffer
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("meta", &self.meta)
            .field("buffer", &self.buffer)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotation_wraps_full_turn() {
        assert_eq!(Rotation::from_degrees(360), Some(Rotation::Deg0));
        assert_eq!(Rotation::from_degrees(450), Some(Rotation::Deg90));
        assert_eq!(Rotation::from_degrees(45), None);
        assert_eq!(Rotation::Deg270.quarter_turns(), 3);
    }

    #[test]
    fn rotation_rejects_odd_angles_on_deserialize() {
        assert!(Rotation::try_from(100).is_err());
        assert_eq!(Rotation::try_from(180), Ok(Rotation::Deg180));
    }
}
