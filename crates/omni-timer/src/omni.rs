//! Whole-set operations for all-CPU timers.
//!
//! These hold the set lock only while flipping states. Arming happens on
//! each target CPU via the host's cross-call, and blocking cancels run
//! after the lock is released.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use omni_timer_host::CpuId;
use tracing::debug;

use crate::error::{Result, TimerError};
use crate::state::SubTimerState;
use crate::{sub, TimerCore};

/// Starts every sub-timer whose CPU is online, `first_ns` from now.
pub(crate) fn omni_start(core: &Arc<TimerCore>, first_ns: u64) -> Result<()> {
    let guard = core.lock.lock().unwrap();

    // Sub-timers still winding down from a previous stop keep their Cb*
    // state until the callback epilogue runs; the caller must retry.
    for sub in core.subs.iter() {
        if sub.state.get() != SubTimerState::Stopped {
            return Err(TimerError::TimerBusy);
        }
    }

    // Mark the online set starting. CPUs may come and go underneath us, so
    // re-snapshot until the picture holds still.
    let mut online = core.host.online_cpus();
    loop {
        for (idx, sub) in core.subs.iter().enumerate() {
            sub.state.set(if online.contains(idx as CpuId) {
                SubTimerState::Starting
            } else {
                SubTimerState::Stopped
            });
        }
        let next = core.host.online_cpus();
        if next == online {
            break;
        }
        online = next;
    }
    core.suspended.store(false, Ordering::SeqCst);
    drop(guard);

    let now = core.host.now_ns();
    let this = core.clone();
    core.host.run_on_all_cpus(Arc::new(move |cpu| {
        let idx = cpu as usize;
        if idx < this.subs.len() && this.subs[idx].state.get() == SubTimerState::Starting {
            sub::start_sub_timer(&this, idx, now, first_ns);
        }
    }));

    // CPUs that went offline between the snapshot and the cross-call never
    // ran their start; put them back.
    let _guard = core.lock.lock().unwrap();
    for sub in core.subs.iter() {
        let _ = sub
            .state
            .try_change(SubTimerState::Starting, SubTimerState::Stopped);
    }
    Ok(())
}

/// Stops every sub-timer. Returns true when at least one callback was in
/// flight and was left a marker.
pub(crate) fn omni_stop(core: &Arc<TimerCore>, for_destroy: bool) -> bool {
    let guard = core.lock.lock().unwrap();
    core.suspended.store(true, Ordering::SeqCst);

    let mut had_callbacks = false;
    for sub in core.subs.iter() {
        loop {
            let state = sub.state.get();
            match state {
                SubTimerState::Stopped | SubTimerState::MpStopping => break,
                SubTimerState::Callback
                | SubTimerState::CbStopping
                | SubTimerState::CbRestarting => {
                    let target = if for_destroy {
                        SubTimerState::CbDestroying
                    } else {
                        SubTimerState::CbStopping
                    };
                    if sub.state.try_change(state, target) {
                        had_callbacks = true;
                        break;
                    }
                }
                SubTimerState::Active => {
                    if sub
                        .state
                        .try_change(SubTimerState::Active, SubTimerState::Stopping)
                    {
                        break;
                    }
                }
                SubTimerState::CbDestroying => {
                    debug_assert!(false, "stop raced a destroy");
                    had_callbacks = true;
                    break;
                }
                _ => {
                    debug_assert!(false, "omni stop in state {state:?}");
                    break;
                }
            }
            std::hint::spin_loop();
        }
    }
    drop(guard);

    // Blocking cancels happen outside the lock.
    for (idx, sub) in core.subs.iter().enumerate() {
        if sub.state.get() == SubTimerState::Stopping {
            sub::stop_sub_timer(core, idx);
        }
    }
    had_callbacks
}

/// Final destroy step run from a callback epilogue that found the
/// `CbDestroying` marker. For all-CPU timers every callback winds its own
/// sub-timer down; the last one out releases the timer's host resources.
pub(crate) fn callback_destroy(core: &Arc<TimerCore>, idx: usize) {
    let sub = &core.subs[idx];
    if core.subs.len() > 1 {
        let guard = core.lock.lock().unwrap();
        sub.state.set(SubTimerState::Stopped);
        for other in core.subs.iter() {
            if other.state.get() != SubTimerState::Stopped {
                return;
            }
        }
        drop(guard);
    } else {
        sub.state.set(SubTimerState::Stopped);
    }
    debug!("timer released from callback");
    crate::destroy_it(core);
}
