//! Start/stop ladders for timers with a single sub-timer.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::error::{Result, TimerError};
use crate::state::SubTimerState;
use crate::{sub, CpuBinding, TimerCore};

/// Starts a single-sub-timer timer, `first_ns` from now.
///
/// Restarting from inside the callback is legal: the sub-timer is then in a
/// callback state and gets a `CbRestarting` marker instead of being armed
/// here; the callback epilogue re-arms at the recorded restart time.
pub(crate) fn start_single(core: &Arc<TimerCore>, first_ns: u64) -> Result<()> {
    let sub = &core.subs[0];
    let restart_at = core.host.now_ns() + first_ns;
    sub.restart_at_ns.store(restart_at, Ordering::SeqCst);

    loop {
        let state = sub.state.get();
        match state {
            SubTimerState::Stopped => {
                if sub
                    .state
                    .try_change(SubTimerState::Stopped, SubTimerState::Starting)
                {
                    core.suspended.store(false, Ordering::SeqCst);
                    match core.binding {
                        CpuBinding::Specific(cpu) => {
                            let started = core.clone();
                            let res = core.host.run_on_cpu(
                                cpu,
                                Box::new(move |_| {
                                    let now = started.host.now_ns();
                                    sub::start_sub_timer(&started, 0, now, first_ns);
                                }),
                            );
                            if res.is_err() {
                                core.suspended.store(true, Ordering::SeqCst);
                                sub.state.set(SubTimerState::Stopped);
                                return Err(TimerError::CpuNotFound);
                            }
                        }
                        _ => {
                            let now = core.host.now_ns();
                            sub::start_sub_timer(core, 0, now, first_ns);
                        }
                    }
                    return Ok(());
                }
            }
            SubTimerState::Callback | SubTimerState::CbStopping => {
                if sub.state.try_change(state, SubTimerState::CbRestarting) {
                    core.suspended.store(false, Ordering::SeqCst);
                    return Ok(());
                }
            }
            _ => {
                debug_assert!(false, "start in state {state:?}");
                return Err(TimerError::InternalState);
            }
        }
        std::hint::spin_loop();
    }
}

/// Stops a single-sub-timer timer. Returns true when a callback was in
/// flight and was left a marker to wind itself down.
pub(crate) fn stop_single(core: &Arc<TimerCore>, for_destroy: bool) -> bool {
    let sub = &core.subs[0];
    core.suspended.store(true, Ordering::SeqCst);
    loop {
        let state = sub.state.get();
        match state {
            SubTimerState::Active => {
                if sub
                    .state
                    .try_change(SubTimerState::Active, SubTimerState::MpStopping)
                {
                    sub::stop_sub_timer(core, 0);
                    return false;
                }
            }
            SubTimerState::Callback
            | SubTimerState::CbRestarting
            | SubTimerState::CbStopping => {
                debug_assert!(state != SubTimerState::CbStopping || for_destroy);
                let target = if for_destroy {
                    SubTimerState::CbDestroying
                } else {
                    SubTimerState::CbStopping
                };
                if sub.state.try_change(state, target) {
                    return true;
                }
            }
            SubTimerState::Stopped => return false,
            SubTimerState::CbDestroying => {
                debug_assert!(false, "stop raced a destroy");
                return true;
            }
            _ => {
                debug_assert!(false, "stop in state {state:?}");
                return false;
            }
        }
        std::hint::spin_loop();
    }
}
