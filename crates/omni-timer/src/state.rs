//! Per-sub-timer atomic state machine.
//!
//! Each sub-timer carries one word of state shared by three parties that may
//! race: the control API, the expiry callback, and the hotplug observer. All
//! coordination is compare-and-swap on this word; the only lock in the crate
//! serializes whole-set operations on all-CPU timers and is never held
//! across a callback or a blocking cancel.

use std::sync::atomic::{AtomicU32, Ordering};

/// State of one sub-timer.
///
/// `Stopped`, `Active` and `Callback` are the resting and running states;
/// the rest are short-lived transitions. The three `Cb*` states are markers
/// left for a callback in flight: its epilogue consumes the marker and
/// performs the stop, restart or destroy on the callback's own context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SubTimerState {
    /// Not armed, no callback running.
    Stopped = 0,
    /// A start operation is arming the native timer.
    Starting,
    /// A hotplug online event is arming the native timer.
    MpStarting,
    /// Armed and waiting to expire.
    Active,
    /// The callback is executing.
    Callback,
    /// Stop requested while the callback runs; the epilogue stops.
    CbStopping,
    /// Restart requested while the callback runs; the epilogue re-arms.
    CbRestarting,
    /// Destroy requested while the callback runs; the epilogue frees.
    CbDestroying,
    /// A stop operation is cancelling the native timer.
    Stopping,
    /// A hotplug offline event is cancelling the native timer.
    MpStopping,
}

impl SubTimerState {
    fn from_u32(raw: u32) -> SubTimerState {
        match raw {
            0 => SubTimerState::Stopped,
            1 => SubTimerState::Starting,
            2 => SubTimerState::MpStarting,
            3 => SubTimerState::Active,
            4 => SubTimerState::Callback,
            5 => SubTimerState::CbStopping,
            6 => SubTimerState::CbRestarting,
            7 => SubTimerState::CbDestroying,
            8 => SubTimerState::Stopping,
            9 => SubTimerState::MpStopping,
            _ => unreachable!("corrupt sub-timer state {raw}"),
        }
    }
}

/// Atomic cell holding a [`SubTimerState`].
pub(crate) struct StateCell(AtomicU32);

impl StateCell {
    pub fn new(state: SubTimerState) -> Self {
        StateCell(AtomicU32::new(state as u32))
    }

    pub fn get(&self) -> SubTimerState {
        SubTimerState::from_u32(self.0.load(Ordering::Acquire))
    }

    /// Unconditional store, for contexts that already own the transition.
    pub fn set(&self, state: SubTimerState) {
        self.0.store(state as u32, Ordering::Release)
    }

    /// CAS `expected` -> `new`; true on success.
    pub fn try_change(&self, expected: SubTimerState, new: SubTimerState) -> bool {
        self.0
            .compare_exchange(
                expected as u32,
                new as u32,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

impl std::fmt::Debug for StateCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.get().fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cas_succeeds_only_from_expected_state() {
        let cell = StateCell::new(SubTimerState::Stopped);
        assert!(!cell.try_change(SubTimerState::Active, SubTimerState::Callback));
        assert_eq!(cell.get(), SubTimerState::Stopped);

        assert!(cell.try_change(SubTimerState::Stopped, SubTimerState::Starting));
        assert_eq!(cell.get(), SubTimerState::Starting);
    }

    #[test]
    fn set_overwrites_any_state() {
        let cell = StateCell::new(SubTimerState::Callback);
        cell.set(SubTimerState::Stopped);
        assert_eq!(cell.get(), SubTimerState::Stopped);
    }

    #[test]
    fn roundtrips_every_state() {
        for state in [
            SubTimerState::Stopped,
            SubTimerState::Starting,
            SubTimerState::MpStarting,
            SubTimerState::Active,
            SubTimerState::Callback,
            SubTimerState::CbStopping,
            SubTimerState::CbRestarting,
            SubTimerState::CbDestroying,
            SubTimerState::Stopping,
            SubTimerState::MpStopping,
        ] {
            let cell = StateCell::new(state);
            assert_eq!(cell.get(), state);
        }
    }
}
