//! Externally visible cover state and the mapping from device reports.

use serde::Serialize;

use crate::device::Status;

/// Snapshot of everything the platform side publishes about the cover.
///
/// Values are compared structurally: a fresh snapshot that equals the
/// previous one produces no notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CoverState {
    /// Percent open, 0 closed and 100 open. `None` only before the first
    /// successful device read.
    pub position: Option<u8>,
    pub opening: bool,
    pub closing: bool,
    pub closed: bool,
    /// The position is a time-based estimate rather than device-confirmed.
    pub assumed: bool,
    pub available: bool,
}

impl CoverState {
    /// State before anything is known about the device.
    pub fn unknown() -> Self {
        Self {
            position: None,
            opening: false,
            closing: false,
            closed: false,
            assumed: true,
            available: false,
        }
    }
}

/// Map one device report onto the previous snapshot.
///
/// Pure and idempotent. A locked report always presents as closed at
/// position 0 no matter what the estimate says; the latch transitions pin
/// the position to 0 while signalling their direction; a disconnected
/// report freezes everything except availability, so a flapping link never
/// makes the cover jump around.
pub fn reconcile(prev: &CoverState, status: Status, raw: Option<u8>) -> CoverState {
    match status {
        Status::Locked => CoverState {
            position: Some(0),
            opening: false,
            closing: false,
            closed: true,
            assumed: false,
            available: true,
        },
        Status::Locking => CoverState {
            position: Some(0),
            opening: false,
            closing: true,
            closed: false,
            assumed: true,
            available: true,
        },
        Status::Unlocking => CoverState {
            position: Some(0),
            opening: true,
            closing: false,
            closed: false,
            assumed: true,
            available: true,
        },
        Status::Opening => CoverState {
            position: raw,
            opening: true,
            closing: false,
            closed: false,
            assumed: true,
            available: true,
        },
        Status::Closing => CoverState {
            position: raw,
            opening: false,
            closing: true,
            closed: false,
            assumed: true,
            available: true,
        },
        Status::Open | Status::Stopped => CoverState {
            position: raw,
            opening: false,
            closing: false,
            closed: false,
            assumed: true,
            available: true,
        },
        Status::Disconnected => CoverState {
            available: false,
            ..prev.clone()
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_STATUSES: [Status; 8] = [
        Status::Open,
        Status::Opening,
        Status::Closing,
        Status::Locked,
        Status::Locking,
        Status::Unlocking,
        Status::Stopped,
        Status::Disconnected,
    ];

    #[test]
    fn test_locked_presents_closed_regardless_of_raw_position() {
        let prev = CoverState::unknown();
        for raw in [None, Some(0), Some(87), Some(100)] {
            let state = reconcile(&prev, Status::Locked, raw);
            assert_eq!(state.position, Some(0));
            assert!(state.closed);
            assert!(!state.opening);
            assert!(!state.closing);
            assert!(!state.assumed);
            assert!(state.available);
        }
    }

    #[test]
    fn test_latch_transitions_pin_position_to_zero() {
        let prev = CoverState::unknown();

        let locking = reconcile(&prev, Status::Locking, Some(42));
        assert_eq!(locking.position, Some(0));
        assert!(locking.closing && !locking.opening && !locking.closed);
        assert!(locking.assumed);

        let unlocking = reconcile(&prev, Status::Unlocking, Some(42));
        assert_eq!(unlocking.position, Some(0));
        assert!(unlocking.opening && !unlocking.closing && !unlocking.closed);
        assert!(unlocking.assumed);
    }

    #[test]
    fn test_travel_statuses_pass_raw_position_through() {
        let prev = CoverState::unknown();

        let opening = reconcile(&prev, Status::Opening, Some(30));
        assert_eq!(opening.position, Some(30));
        assert!(opening.opening && !opening.closed);

        let closing = reconcile(&prev, Status::Closing, Some(60));
        assert_eq!(closing.position, Some(60));
        assert!(closing.closing && !closing.closed);

        let stopped = reconcile(&prev, Status::Stopped, Some(45));
        assert_eq!(stopped.position, Some(45));
        assert!(!stopped.opening && !stopped.closing && !stopped.closed);

        let open = reconcile(&prev, Status::Open, Some(100));
        assert_eq!(open.position, Some(100));
        assert!(!open.closed);
    }

    #[test]
    fn test_disconnected_freezes_motion_and_position() {
        let moving = reconcile(&CoverState::unknown(), Status::Opening, Some(57));
        let frozen = reconcile(&moving, Status::Disconnected, Some(99));

        assert!(!frozen.available);
        assert_eq!(frozen.position, Some(57));
        assert!(frozen.opening);
        assert!(!frozen.closed);

        // Coming back online resumes normal mapping.
        let back = reconcile(&frozen, Status::Opening, Some(61));
        assert!(back.available);
        assert_eq!(back.position, Some(61));
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        let prev = reconcile(&CoverState::unknown(), Status::Closing, Some(12));
        for status in ALL_STATUSES {
            for raw in [None, Some(0), Some(50), Some(100)] {
                let once = reconcile(&prev, status, raw);
                let twice = reconcile(&once, status, raw);
                assert_eq!(once, twice, "{status} with {raw:?} was not idempotent");
            }
        }
    }

    #[test]
    fn test_closed_implies_position_zero() {
        let mut prev = CoverState::unknown();
        for status in ALL_STATUSES {
            for raw in [None, Some(0), Some(50), Some(100)] {
                let state = reconcile(&prev, status, raw);
                if state.closed {
                    assert_eq!(state.position, Some(0), "{status} with {raw:?}");
                }
                prev = state;
            }
        }
    }

    #[test]
    fn test_availability_follows_connection() {
        let prev = CoverState::unknown();
        for status in ALL_STATUSES {
            let state = reconcile(&prev, status, Some(10));
            assert_eq!(state.available, status != Status::Disconnected);
        }
    }
}
