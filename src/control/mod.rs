pub mod events;
pub mod session;
pub mod state;

pub use events::{CameraEvents, CaptureEvent, StillImage};
pub use session::{CameraSession, StoppedSession};
pub use state::{CaptureAction, CaptureState, CaptureStateMachine};
