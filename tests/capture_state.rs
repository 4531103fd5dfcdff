use textcam::capture::device::{AeState, AfState, CaptureMetadata, Facing, RequestTag};
use textcam::capture::orientation::{detector_rotation, jpeg_orientation, legacy_rotation};
use textcam::capture::Rotation;
use textcam::control::{CaptureAction, CaptureState, CaptureStateMachine};

const AF: [Option<AfState>; 8] = [
    None,
    Some(AfState::Inactive),
    Some(AfState::PassiveScan),
    Some(AfState::PassiveFocused),
    Some(AfState::PassiveUnfocused),
    Some(AfState::ActiveScan),
    Some(AfState::FocusedLocked),
    Some(AfState::NotFocusedLocked),
];

const AE: [Option<AeState>; 7] = [
    None,
    Some(AeState::Inactive),
    Some(AeState::Searching),
    Some(AeState::Converged),
    Some(AeState::Locked),
    Some(AeState::FlashRequired),
    Some(AeState::Precapture),
];

const STATES: [CaptureState; 5] = [
    CaptureState::Preview,
    CaptureState::WaitingFocusLock,
    CaptureState::WaitingPrecapture,
    CaptureState::WaitingNonPrecapture,
    CaptureState::PictureTaken,
];

fn meta(af_state: Option<AfState>, ae_state: Option<AeState>) -> CaptureMetadata {
    CaptureMetadata { af_state, ae_state }
}

/// Drives a fresh machine into `state` through its public operations.
fn machine_in(state: CaptureState) -> CaptureStateMachine {
    let mut machine = CaptureStateMachine::new();
    let locked = Some(AfState::FocusedLocked);
    match state {
        CaptureState::Preview => {}
        CaptureState::WaitingFocusLock => {
            machine.take_picture();
        }
        CaptureState::PictureTaken => {
            machine.take_picture();
            machine.on_capture_result(RequestTag::FocusLock, &meta(locked, Some(AeState::Converged)));
        }
        CaptureState::WaitingPrecapture => {
            machine.take_picture();
            machine.on_capture_result(
                RequestTag::FocusLock,
                &meta(locked, Some(AeState::FlashRequired)),
            );
        }
        CaptureState::WaitingNonPrecapture => {
            machine.take_picture();
            machine.on_capture_result(
                RequestTag::FocusLock,
                &meta(locked, Some(AeState::FlashRequired)),
            );
            machine.on_capture_result(RequestTag::Precapture, &meta(None, Some(AeState::Precapture)));
        }
    }
    assert_eq!(machine.state(), state);
    machine
}

#[test]
fn every_state_handles_every_metadata_combination() {
    for state in STATES {
        for af in AF {
            for ae in AE {
                let mut machine = machine_in(state);
                let action = machine.on_capture_result(RequestTag::Preview, &meta(af, ae));
                let next = machine.state();

                match action {
                    Some(CaptureAction::CaptureStill) => {
                        assert_eq!(next, CaptureState::PictureTaken, "{state:?} {af:?} {ae:?}")
                    }
                    Some(CaptureAction::RunPrecapture) => {
                        assert_eq!(next, CaptureState::WaitingPrecapture, "{state:?} {af:?} {ae:?}")
                    }
                    Some(other) => panic!("{other:?} from a capture result in {state:?}"),
                    None => {}
                }

                if matches!(state, CaptureState::Preview | CaptureState::PictureTaken) {
                    assert_eq!(next, state);
                    assert_eq!(action, None);
                }
            }
        }
    }
}

#[test]
fn absent_metadata_never_stalls_the_sequence() {
    let expected = [
        (CaptureState::WaitingFocusLock, CaptureState::PictureTaken),
        (CaptureState::WaitingPrecapture, CaptureState::WaitingNonPrecapture),
        (CaptureState::WaitingNonPrecapture, CaptureState::PictureTaken),
    ];
    for (from, to) in expected {
        let mut machine = machine_in(from);
        machine.on_capture_result(RequestTag::Preview, &meta(None, None));
        assert_eq!(machine.state(), to, "from {from:?}");
    }
}

#[test]
fn precapture_sequence_waits_for_exposure() {
    let mut machine = machine_in(CaptureState::WaitingNonPrecapture);
    let action =
        machine.on_capture_result(RequestTag::Preview, &meta(None, Some(AeState::Precapture)));
    assert_eq!(action, None);
    assert_eq!(machine.state(), CaptureState::WaitingNonPrecapture);

    let action =
        machine.on_capture_result(RequestTag::Preview, &meta(None, Some(AeState::Converged)));
    assert_eq!(action, Some(CaptureAction::CaptureStill));
    assert_eq!(machine.on_still_captured(), Some(CaptureAction::UnlockFocus));
    assert_eq!(machine.state(), CaptureState::Preview);
}

#[test]
fn still_and_tap_focus_results_never_move_the_machine() {
    for state in STATES {
        for tag in [
            RequestTag::StillCapture,
            RequestTag::TapFocus,
            RequestTag::FocusCancel,
        ] {
            let mut machine = machine_in(state);
            let action = machine.on_capture_result(tag, &meta(None, None));
            assert_eq!(action, None);
            assert_eq!(machine.state(), state);
        }
    }
}

#[test]
fn abort_from_any_state_returns_to_preview() {
    for state in STATES {
        let mut machine = machine_in(state);
        assert_eq!(machine.abort(), state);
        assert_eq!(machine.state(), CaptureState::Preview);
        assert_eq!(machine.take_picture(), Some(CaptureAction::LockFocus));
    }
}

#[test]
fn jpeg_orientation_is_a_quarter_turn_for_every_input() {
    for sensor in [0, 90, 180, 270, 360] {
        for display in Rotation::ALL {
            let rotation = jpeg_orientation(display, sensor);
            let compensation = match display {
                Rotation::Deg0 => 90,
                Rotation::Deg90 => 0,
                Rotation::Deg180 => 270,
                Rotation::Deg270 => 180,
            };
            assert_eq!(
                rotation.degrees(),
                (compensation + sensor % 360 + 270) % 360,
                "sensor {sensor} display {display}"
            );
        }
    }
}

#[test]
fn detector_rotation_matches_sensor_mount() {
    assert_eq!(detector_rotation(0), Rotation::Deg0);
    assert_eq!(detector_rotation(90), Rotation::Deg90);
    assert_eq!(detector_rotation(180), Rotation::Deg180);
    assert_eq!(detector_rotation(270), Rotation::Deg270);
    assert_eq!(detector_rotation(360), Rotation::Deg0);
    assert_eq!(detector_rotation(17), Rotation::Deg90);
}

#[test]
fn legacy_rotation_round_trips_display_for_back_camera() {
    for sensor in [0, 90, 180, 270] {
        for display in Rotation::ALL {
            let back = legacy_rotation(Facing::Back, sensor, display);
            assert_eq!(back.frame, back.display);
            assert_eq!((back.frame.degrees() + display.degrees()) % 360, sensor);

            let front = legacy_rotation(Facing::Front, sensor, display);
            assert_eq!((front.frame.degrees() + front.display.degrees()) % 360, 0);
        }
    }
}
