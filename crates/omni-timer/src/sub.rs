//! Sub-timer bookkeeping and the expiry path.
//!
//! Every timer owns one sub-timer per bound CPU (exactly one unless the
//! timer fans out to all CPUs). The expiry path runs on the host's timer
//! context; whatever the control API or hotplug observer decided while the
//! callback was running is handed over as a `Cb*` state marker and carried
//! out by [`callback_epilogue`] on the callback's own context.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use omni_timer_host::{CpuId, NativeTimer};
use tracing::trace;

use crate::state::{StateCell, SubTimerState};
use crate::{CpuBinding, TimerCore, TimerRef};

pub(crate) struct SubTimer {
    /// CPU this sub-timer is bound to; `INVALID_CPU_ID` when unbound.
    pub cpu: CpuId,
    pub native: Box<dyn NativeTimer>,
    pub state: StateCell,
    /// Ticks delivered since the last (re)start.
    pub tick: AtomicU64,
    /// Absolute time a restart-from-callback should first fire at.
    pub restart_at_ns: AtomicU64,
    pub start_ns: AtomicU64,
    /// Next scheduled expiry in exact nanoseconds.
    pub next_ns: AtomicU64,
    /// Next scheduled expiry in whole host ticks (low-resolution mode).
    pub next_ticks: AtomicU64,
}

impl SubTimer {
    pub fn new(cpu: CpuId, native: Box<dyn NativeTimer>) -> Self {
        SubTimer {
            cpu,
            native,
            state: StateCell::new(SubTimerState::Stopped),
            tick: AtomicU64::new(0),
            restart_at_ns: AtomicU64::new(0),
            start_ns: AtomicU64::new(0),
            next_ns: AtomicU64::new(0),
            next_ticks: AtomicU64::new(0),
        }
    }
}

/// Round a nanosecond count up to whole host ticks.
pub(crate) fn nano_to_ticks(ns: u64, granularity_ns: u64) -> u64 {
    (ns + granularity_ns - 1) / granularity_ns
}

fn arm(core: &TimerCore, sub: &SubTimer, expires_ns: u64) {
    match core.binding {
        CpuBinding::Any => sub.native.arm_absolute(expires_ns),
        _ => sub.native.arm_absolute_pinned(expires_ns, sub.cpu),
    }
}

/// Programs the native timer for its first expiry and moves the sub-timer
/// to `Active`. The caller has already claimed the sub-timer by putting it
/// in `Starting` or `MpStarting`.
pub(crate) fn start_sub_timer(core: &TimerCore, idx: usize, now_ns: u64, first_ns: u64) {
    let sub = &core.subs[idx];
    let next = now_ns + first_ns;
    sub.tick.store(0, Ordering::Relaxed);
    sub.start_ns.store(now_ns, Ordering::Relaxed);
    sub.next_ns.store(next, Ordering::Relaxed);

    if core.high_res {
        arm(core, sub, next);
    } else {
        let g = u64::from(core.host.tick_granularity_ns());
        let ticks_now = now_ns / g;
        let next_ticks = if first_ns == 0 {
            ticks_now
        } else {
            ticks_now + nano_to_ticks(first_ns, g)
        };
        sub.next_ticks.store(next_ticks, Ordering::Relaxed);
        arm(core, sub, next_ticks * g);
    }

    // The callback may already have claimed the sub-timer between arming
    // and here; its slow path accepts Starting and MpStarting. A stop or
    // destroy racing that callback can have moved it further into one of
    // the Cb* marker states by the time we look.
    if !sub.state.try_change(SubTimerState::Starting, SubTimerState::Active) {
        let claimed = sub
            .state
            .try_change(SubTimerState::MpStarting, SubTimerState::Active);
        debug_assert!(
            claimed
                || matches!(
                    sub.state.get(),
                    SubTimerState::Callback
                        | SubTimerState::CbStopping
                        | SubTimerState::CbRestarting
                        | SubTimerState::CbDestroying
                )
        );
    }
}

/// Cancels the native timer, waiting out an expiry running elsewhere, and
/// marks the sub-timer stopped. Never called with the set lock held.
pub(crate) fn stop_sub_timer(core: &TimerCore, idx: usize) {
    let sub = &core.subs[idx];
    if core.high_res || sub.native.is_pending() {
        sub.native.cancel_sync();
    }
    sub.state.set(SubTimerState::Stopped);
}

/// Claims the sub-timer for the callback. Fails when a stop or migration
/// got there first, in which case the firing is abandoned.
fn change_to_callback_state(sub: &SubTimer) -> bool {
    if sub
        .state
        .try_change(SubTimerState::Active, SubTimerState::Callback)
    {
        return true;
    }
    loop {
        let state = sub.state.get();
        match state {
            SubTimerState::Active | SubTimerState::Starting | SubTimerState::MpStarting => {
                if sub.state.try_change(state, SubTimerState::Callback) {
                    return true;
                }
            }
            SubTimerState::Callback
            | SubTimerState::CbStopping
            | SubTimerState::CbRestarting
            | SubTimerState::CbDestroying => {
                debug_assert!(false, "reentered callback in state {state:?}");
                return false;
            }
            _ => return false,
        }
        std::hint::spin_loop();
    }
}

fn run_callback(core: &Arc<TimerCore>, tick: u64) {
    (core.callback)(TimerRef { core }, tick);
}

/// Native timer expiry entry point for sub-timer `idx`.
pub(crate) fn expiry(core: &Arc<TimerCore>, idx: usize) {
    let sub = &core.subs[idx];
    if !change_to_callback_state(sub) {
        return;
    }

    // An all-CPU sub-timer firing on the wrong CPU means its CPU went
    // offline and the host migrated the pending expiry. Never run the
    // callback there; wind the sub-timer down instead.
    if core.subs.len() > 1 && core.host.current_cpu() != sub.cpu {
        trace!(cpu = sub.cpu, "sub-timer expiry migrated off its cpu");
        crate::hotplug::handle_migration(core, idx);
        return;
    }

    let interval = core.interval_ns.load(Ordering::SeqCst);
    if interval == 0 {
        // One-shot: the timer suspends before the callback runs so the
        // callback can legally restart it.
        core.suspended.store(true, Ordering::SeqCst);
        let tick = sub.tick.fetch_add(1, Ordering::Relaxed) + 1;
        run_callback(core, tick);
        if !sub
            .state
            .try_change(SubTimerState::Callback, SubTimerState::Stopped)
        {
            callback_epilogue(core, idx);
        }
    } else if core.high_res {
        let tick = sub.tick.fetch_add(1, Ordering::Relaxed) + 1;
        run_callback(core, tick);
        // Re-read: the callback may have changed the interval.
        let interval = core.interval_ns.load(Ordering::SeqCst);
        let next = sub.next_ns.load(Ordering::Relaxed) + interval;
        sub.next_ns.store(next, Ordering::Relaxed);
        if sub
            .state
            .try_change(SubTimerState::Callback, SubTimerState::Active)
        {
            arm(core, sub, next);
        } else {
            callback_epilogue(core, idx);
        }
    } else {
        let g = u64::from(core.host.tick_granularity_ns());
        let now = core.host.now_ns();
        let tick = sub.tick.fetch_add(1, Ordering::Relaxed) + 1;
        if tick == 1 {
            // First expiry after a start resynchronizes the schedule to
            // the actual delivery time.
            sub.start_ns.store(now, Ordering::Relaxed);
            sub.next_ns.store(now, Ordering::Relaxed);
            sub.next_ticks.store(now / g, Ordering::Relaxed);
        }

        let mut next_ns = sub.next_ns.load(Ordering::Relaxed) + interval;
        let interval_ticks = core.interval_ticks.load(Ordering::SeqCst);
        let next_ticks = if interval_ticks != 0 {
            // Whole-tick interval: step in ticks, skipping any we missed.
            let mut next_ticks = sub.next_ticks.load(Ordering::Relaxed) + interval_ticks;
            let ticks_now = now / g;
            while next_ticks < ticks_now {
                next_ticks += interval_ticks;
                next_ns += interval;
            }
            next_ticks
        } else {
            // Fractional interval: keep the exact schedule in nanoseconds
            // and round the delay up to whole ticks each time, so delivery
            // drifts within one tick but never accumulates error.
            while next_ns < now {
                next_ns += interval;
            }
            now / g + nano_to_ticks(next_ns - now, g)
        };
        sub.next_ns.store(next_ns, Ordering::Relaxed);
        sub.next_ticks.store(next_ticks, Ordering::Relaxed);

        // Low-resolution timers re-arm before the callback runs.
        arm(core, sub, next_ticks * g);
        run_callback(core, tick);
        if !sub
            .state
            .try_change(SubTimerState::Callback, SubTimerState::Active)
        {
            sub.native.cancel_sync();
            callback_epilogue(core, idx);
        }
    }
}

/// Consumes the state marker a racing stop/restart/destroy left while the
/// callback was running.
pub(crate) fn callback_epilogue(core: &Arc<TimerCore>, idx: usize) {
    let sub = &core.subs[idx];
    loop {
        let state = sub.state.get();
        match state {
            SubTimerState::CbDestroying => {
                crate::omni::callback_destroy(core, idx);
                return;
            }
            SubTimerState::CbStopping => {
                if sub
                    .state
                    .try_change(SubTimerState::CbStopping, SubTimerState::Stopped)
                {
                    return;
                }
            }
            SubTimerState::CbRestarting => {
                if sub
                    .state
                    .try_change(SubTimerState::CbRestarting, SubTimerState::Active)
                {
                    let restart_at = sub.restart_at_ns.load(Ordering::Relaxed);
                    sub.tick.store(0, Ordering::Relaxed);
                    sub.start_ns.store(restart_at, Ordering::Relaxed);
                    sub.next_ns.store(restart_at, Ordering::Relaxed);
                    if core.high_res {
                        arm(core, sub, restart_at);
                    } else {
                        let g = u64::from(core.host.tick_granularity_ns());
                        let now = core.host.now_ns();
                        let ticks = if restart_at > now {
                            now / g + nano_to_ticks(restart_at - now, g)
                        } else {
                            now / g
                        };
                        sub.next_ticks.store(ticks, Ordering::Relaxed);
                        arm(core, sub, ticks * g);
                    }
                    return;
                }
            }
            _ => {
                debug_assert!(false, "callback epilogue in state {state:?}");
                return;
            }
        }
        std::hint::spin_loop();
    }
}
