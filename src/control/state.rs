//! Still-capture sequencing: focus lock, exposure precapture, still trigger
//!
//! The machine is pure. It is fed capture-result metadata and answers with
//! the next request to issue; the session's control thread issues it. Any
//! metadata field may be absent, and an absent field always lets the
//! sequence move forward.

use tracing::debug;

use crate::capture::device::{AeState, CaptureMetadata, RequestTag};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum CaptureState {
    #[default]
    Preview = 0,
    WaitingFocusLock = 1,
    WaitingPrecapture = 2,
    WaitingNonPrecapture = 3,
    PictureTaken = 4,
}

impl CaptureState {
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => CaptureState::WaitingFocusLock,
            2 => CaptureState::WaitingPrecapture,
            3 => CaptureState::WaitingNonPrecapture,
            4 => CaptureState::PictureTaken,
            _ => CaptureState::Preview,
        }
    }

    pub fn is_idle(self) -> bool {
        self == CaptureState::Preview
    }
}

/// Request the control thread must issue after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureAction {
    /// One-shot request with the AF trigger started.
    LockFocus,
    /// One-shot request with the AE precapture trigger started.
    RunPrecapture,
    /// Stop the preview and issue the still-capture request.
    CaptureStill,
    /// Cancel the AF trigger and restore the repeating preview.
    UnlockFocus,
}

#[derive(Debug, Default)]
pub struct CaptureStateMachine {
    state: CaptureState,
}

impl CaptureStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    /// Starts a capture. Ignored while one is already in progress.
    pub fn take_picture(&mut self) -> Option<CaptureAction> {
        if !self.state.is_idle() {
            debug!(state = ?self.state, "Capture already in progress");
            return None;
        }
        self.transition(CaptureState::WaitingFocusLock);
        Some(CaptureAction::LockFocus)
    }

    /// Feeds one capture result (partial or complete).
    pub fn on_capture_result(
        &mut self,
        tag: RequestTag,
        metadata: &CaptureMetadata,
    ) -> Option<CaptureAction> {
        if !tag.drives_capture_sequence() {
            return None;
        }

        match self.state {
            CaptureState::Preview | CaptureState::PictureTaken => None,
            CaptureState::WaitingFocusLock => match metadata.af_state {
                // No autofocus on this device.
                None => self.capture_still(),
                Some(af) if af.is_settled() => {
                    if matches!(metadata.ae_state, None | Some(AeState::Converged)) {
                        self.capture_still()
                    } else {
                        self.transition(CaptureState::WaitingPrecapture);
                        Some(CaptureAction::RunPrecapture)
                    }
                }
                Some(_) => None,
            },
            CaptureState::WaitingPrecapture => {
                if matches!(
                    metadata.ae_state,
                    None | Some(AeState::Precapture) | Some(AeState::FlashRequired)
                ) {
                    self.transition(CaptureState::WaitingNonPrecapture);
                }
                None
            }
            CaptureState::WaitingNonPrecapture => {
                if metadata.ae_state != Some(AeState::Precapture) {
                    self.capture_still()
                } else {
                    None
                }
            }
        }
    }

    /// The still-capture request completed.
    pub fn on_still_captured(&mut self) -> Option<CaptureAction> {
        if self.state != CaptureState::PictureTaken {
            debug!(state = ?self.state, "Ignoring still completion outside a capture");
            return None;
        }
        self.transition(CaptureState::Preview);
        Some(CaptureAction::UnlockFocus)
    }

    /// Drops back to preview after a failed request.
    pub fn abort(&mut self) -> CaptureState {
        let previous = self.state;
        self.transition(CaptureState::Preview);
        previous
    }

    fn capture_still(&mut self) -> Option<CaptureAction> {
        self.transition(CaptureState::PictureTaken);
        Some(CaptureAction::CaptureStill)
    }

    fn transition(&mut self, next: CaptureState) {
        if self.state != next {
            debug!(from = ?self.state, to = ?next, "Capture state");
            self.state = next;
        }
    }
}
