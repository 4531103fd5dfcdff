pub mod convert;
pub mod device;
pub mod frame;
pub mod orientation;
pub mod simulated;

pub use device::{CameraCharacteristics, CameraDevice, Facing, FlashMode, FocusMode, FocusRegion};
pub use frame::{Frame, FrameLayout, FrameMetadata, PixelFormat, Rotation};
pub use simulated::{SimulatedCamera, SimulatedSettings};
