//! Reset kinds, diagnostic reasons and the coalescing request mask.
//!
//! Requests from any context set one bit per reset kind. A single worker
//! executes the most severe pending kind and then clears that bit and every
//! less severe one, so a burst of requests collapses into one reset.

use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};

/// Reset scopes, ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ResetKind {
    /// Reset the data path without disturbing the link.
    Invisible = 0,
    /// Reset the whole controller.
    Full = 1,
    /// Reset the controller and everything attached to it.
    World = 2,
    /// Take the device out of service.
    Disable = 3,
}

impl ResetKind {
    pub const ALL: [ResetKind; 4] = [
        ResetKind::Invisible,
        ResetKind::Full,
        ResetKind::World,
        ResetKind::Disable,
    ];

    fn from_index(i: u32) -> Option<Self> {
        Self::ALL.get(i as usize).copied()
    }

    #[inline]
    fn bit(self) -> u32 {
        1 << self as u32
    }

    /// The next more severe recovery scope, used when a reset step itself
    /// fails. `World` is the most severe scope that still recovers.
    pub fn escalate(self) -> ResetKind {
        match self {
            ResetKind::Invisible => ResetKind::Full,
            ResetKind::Full | ResetKind::World => ResetKind::World,
            ResetKind::Disable => ResetKind::Disable,
        }
    }
}

impl fmt::Display for ResetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ResetKind::Invisible => "INVISIBLE",
            ResetKind::Full => "ALL",
            ResetKind::World => "WORLD",
            ResetKind::Disable => "DISABLE",
        })
    }
}

/// Why a reset is requested. Diagnostic reasons are mapped to a
/// [`ResetKind`] by the hardware family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResetReason {
    /// An explicit reset scope.
    Kind(ResetKind),
    /// A stopped transmit queue made no progress within the timeout.
    TxWatchdog,
    /// The device raised an interrupt-level error.
    IntError,
    /// Receive completions were lost or arrived out of order.
    RxRecovery,
    RxDescFetch,
    TxDescFetch,
    /// A transmit completion referenced descriptors that were never posted.
    TxSkip,
}

impl From<ResetKind> for ResetReason {
    fn from(kind: ResetKind) -> Self {
        ResetReason::Kind(kind)
    }
}

/// Policy used by families that do not override
/// [`NicFamily::map_reset_reason`](crate::family::NicFamily::map_reset_reason):
/// ring-level faults that hardware recovers from without a link bounce map
/// to an invisible reset, everything else to a full reset.
pub fn default_reset_policy(reason: ResetReason) -> ResetKind {
    match reason {
        ResetReason::Kind(kind) => kind,
        ResetReason::RxRecovery
        | ResetReason::RxDescFetch
        | ResetReason::TxDescFetch
        | ResetReason::TxSkip => ResetKind::Invisible,
        ResetReason::TxWatchdog | ResetReason::IntError => ResetKind::Full,
    }
}

/// Device life-cycle state as seen by the reset machinery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DeviceState {
    Running = 0,
    Resetting = 1,
    /// Terminal until the device is probed again.
    Disabled = 2,
}

impl DeviceState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => DeviceState::Running,
            1 => DeviceState::Resetting,
            _ => DeviceState::Disabled,
        }
    }
}

/// Pending-request mask plus device state.
pub(crate) struct ResetController {
    pending: AtomicU32,
    state: AtomicU8,
}

impl ResetController {
    pub(crate) fn new() -> Self {
        ResetController {
            pending: AtomicU32::new(0),
            state: AtomicU8::new(DeviceState::Running as u8),
        }
    }

    /// Record a request. Returns true if the kind was not already pending.
    pub(crate) fn request(&self, kind: ResetKind) -> bool {
        self.pending.fetch_or(kind.bit(), Ordering::AcqRel) & kind.bit() == 0
    }

    #[inline]
    pub(crate) fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire) != 0
    }

    /// The most severe pending kind.
    pub(crate) fn most_severe(&self) -> Option<ResetKind> {
        let p = self.pending.load(Ordering::Acquire);
        if p == 0 {
            return None;
        }
        ResetKind::from_index(31 - p.leading_zeros())
    }

    /// Clear `kind` and every less severe pending kind. More severe requests
    /// that arrived meanwhile stay pending.
    pub(crate) fn clear_through(&self, kind: ResetKind) {
        let covered = (kind.bit() << 1) - 1;
        self.pending.fetch_and(!covered, Ordering::AcqRel);
    }

    pub(crate) fn state(&self) -> DeviceState {
        DeviceState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: DeviceState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_order() {
        assert!(ResetKind::Invisible < ResetKind::Full);
        assert!(ResetKind::Full < ResetKind::World);
        assert!(ResetKind::World < ResetKind::Disable);
    }

    #[test]
    fn coalesces_to_most_severe() {
        let rc = ResetController::new();
        assert!(rc.request(ResetKind::Invisible));
        assert!(rc.request(ResetKind::Full));
        assert!(!rc.request(ResetKind::Invisible));
        assert_eq!(rc.most_severe(), Some(ResetKind::Full));
        rc.clear_through(ResetKind::Full);
        assert!(!rc.is_pending());
        assert_eq!(rc.most_severe(), None);
    }

    #[test]
    fn more_severe_survives_clear() {
        let rc = ResetController::new();
        rc.request(ResetKind::Invisible);
        rc.request(ResetKind::World);
        rc.clear_through(ResetKind::Full);
        assert_eq!(rc.most_severe(), Some(ResetKind::World));
    }

    #[test]
    fn default_policy() {
        assert_eq!(default_reset_policy(ResetReason::TxWatchdog), ResetKind::Full);
        assert_eq!(default_reset_policy(ResetReason::TxSkip), ResetKind::Invisible);
        assert_eq!(default_reset_policy(ResetReason::RxRecovery), ResetKind::Invisible);
        assert_eq!(
            default_reset_policy(ResetKind::World.into()),
            ResetKind::World
        );
    }

    #[test]
    fn escalation_chain() {
        assert_eq!(ResetKind::Invisible.escalate(), ResetKind::Full);
        assert_eq!(ResetKind::Full.escalate(), ResetKind::World);
        assert_eq!(ResetKind::World.escalate(), ResetKind::World);
    }

    #[test]
    fn state_round_trip() {
        let rc = ResetController::new();
        assert_eq!(rc.state(), DeviceState::Running);
        rc.set_state(DeviceState::Disabled);
        assert_eq!(rc.state(), DeviceState::Disabled);
    }
}
