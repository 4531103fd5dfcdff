//! Rotation bookkeeping between display, sensor, JPEG output and detector frames
//!
//! Still captures and streamed frames use different mappings. The JPEG
//! encoder physically rotates still images, so its orientation carries an
//! extra 270° term relative to the display compensation table; streamed
//! frames are only tagged and the detector interprets the tag.

use super::device::Facing;
use super::frame::Rotation;

/// Snaps a sensor mounting angle to the nearest quarter turn in `0..360`.
pub fn normalize_sensor_orientation(degrees: u32) -> u32 {
    ((degrees % 360 + 45) / 90 * 90) % 360
}

/// Per-display-rotation compensation used for still images.
pub fn display_compensation(display: Rotation) -> u32 {
    match display {
        Rotation::Deg0 => 90,
        Rotation::Deg90 => 0,
        Rotation::Deg180 => 270,
        Rotation::Deg270 => 180,
    }
}

/// Orientation written into still-capture JPEGs.
///
/// Sensors are mounted at 90° on most devices and 270° on some; the 270°
/// term turns the latter around so both produce upright images.
pub fn jpeg_orientation(display: Rotation, sensor_orientation: u32) -> Rotation {
    let degrees =
        (display_compensation(display) + normalize_sensor_orientation(sensor_orientation) + 270)
            % 360;
    Rotation::from_degrees(degrees).unwrap_or_default()
}

/// Rotation tag for frames streamed to the detector by image-reader
/// backends. Unknown mounting angles fall back to 90°.
pub fn detector_rotation(sensor_orientation: u32) -> Rotation {
    match sensor_orientation {
        0 | 360 => Rotation::Deg0,
        90 => Rotation::Deg90,
        180 => Rotation::Deg180,
        270 => Rotation::Deg270,
        _ => Rotation::Deg90,
    }
}

/// Rotations for buffer-recycling backends, which know the lens facing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LegacyRotation {
    /// Tag for streamed frames and the still-image rotation parameter.
    pub frame: Rotation,
    /// Rotation applied to the on-screen preview.
    pub display: Rotation,
}

pub fn legacy_rotation(facing: Facing, sensor_orientation: u32, display: Rotation) -> LegacyRotation {
    let sensor = normalize_sensor_orientation(sensor_orientation);
    let degrees = display.degrees();

    let (angle, display_angle) = match facing {
        Facing::Front => {
            let angle = (sensor + degrees) % 360;
            // Front previews are mirrored.
            (angle, (360 - angle) % 360)
        }
        Facing::Back => {
            let angle = (sensor + 360 - degrees) % 360;
            (angle, angle)
        }
    };

    LegacyRotation {
        frame: Rotation::from_degrees(angle).unwrap_or_default(),
        display: Rotation::from_degrees(display_angle).unwrap_or_default(),
    }
}
