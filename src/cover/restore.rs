//! Cold-start reconciliation of a persisted position with the live device.

use log::{debug, warn};

use crate::cover::state::{CoverState, reconcile};
use crate::device::Status;

/// What a restore decided: the snapshot to present, the estimate to seed
/// into the device session, and whether polling should run afterwards.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RestorePlan {
    pub state: CoverState,
    pub seed: Option<u8>,
    pub start_polling: bool,
}

/// Plan a restore from the live status and an optional persisted position.
///
/// The live status always outranks persistence: a locked window is closed
/// at position 0 no matter what was persisted, and needs no polling until
/// the next command. Anything else takes the persisted position as the
/// best available estimate and starts polling to converge on reality.
pub(crate) fn plan_restore(
    prev: &CoverState,
    live_status: Status,
    live_raw: Option<u8>,
    persisted: Option<u8>,
) -> RestorePlan {
    let persisted = persisted.filter(|p| {
        if *p > 100 {
            warn!("ignoring persisted position {p}, out of range");
            return false;
        }
        true
    });
    match live_status {
        Status::Locked => {
            if persisted.is_some() {
                debug!("drive is locked, persisted position discarded");
            }
            RestorePlan {
                state: reconcile(prev, Status::Locked, Some(0)),
                seed: None,
                start_polling: false,
            }
        }
        Status::Disconnected => {
            let mut state = reconcile(prev, Status::Disconnected, live_raw);
            state.position = persisted.or(state.position);
            // Seed anyway so a later reconnect starts from the persisted
            // estimate instead of the fully-open assumption.
            RestorePlan {
                state,
                seed: persisted,
                start_polling: true,
            }
        }
        status => RestorePlan {
            state: reconcile(prev, status, persisted.or(live_raw)),
            seed: persisted,
            start_polling: true,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_live_locked_discards_persisted_position() {
        let plan = plan_restore(&CoverState::unknown(), Status::Locked, Some(0), Some(63));
        assert_eq!(plan.state.position, Some(0));
        assert!(plan.state.closed);
        assert!(!plan.state.assumed);
        assert_eq!(plan.seed, None);
        assert!(!plan.start_polling);
    }

    #[test]
    fn test_live_open_takes_persisted_position() {
        let plan = plan_restore(&CoverState::unknown(), Status::Open, Some(100), Some(63));
        assert_eq!(plan.state.position, Some(63));
        assert!(!plan.state.closed);
        assert!(plan.state.assumed);
        assert!(plan.state.available);
        assert_eq!(plan.seed, Some(63));
        assert!(plan.start_polling);
    }

    #[test]
    fn test_no_persisted_position_keeps_live_estimate() {
        let plan = plan_restore(&CoverState::unknown(), Status::Stopped, Some(100), None);
        assert_eq!(plan.state.position, Some(100));
        assert_eq!(plan.seed, None);
        assert!(plan.start_polling);
    }

    #[test]
    fn test_out_of_range_persisted_position_is_ignored() {
        let plan = plan_restore(&CoverState::unknown(), Status::Open, Some(100), Some(130));
        assert_eq!(plan.state.position, Some(100));
        assert_eq!(plan.seed, None);
    }

    #[test]
    fn test_disconnected_restore_stays_unavailable_but_seeds() {
        let plan = plan_restore(&CoverState::unknown(), Status::Disconnected, None, Some(40));
        assert!(!plan.state.available);
        assert_eq!(plan.state.position, Some(40));
        assert_eq!(plan.seed, Some(40));
        assert!(plan.start_polling);
    }
}
