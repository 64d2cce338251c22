//! CPU hotplug bridge for all-CPU timers.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use omni_timer_host::{CpuId, HotplugEvent, HotplugObserver};
use tracing::debug;

use crate::state::SubTimerState;
use crate::{sub, TimerCore};

impl HotplugObserver for TimerCore {
    fn cpu_event(&self, event: HotplugEvent, cpu: CpuId) {
        // The observer registration is weak; an upgrade failing here would
        // mean the timer is mid-teardown and the event can be dropped.
        if let Some(core) = self.weak_self.upgrade() {
            mp_event(&core, event, cpu);
        }
    }
}

fn mp_event(core: &Arc<TimerCore>, event: HotplugEvent, cpu: CpuId) {
    let idx = cpu as usize;
    if idx >= core.subs.len() {
        return;
    }
    let sub = &core.subs[idx];
    let guard = core.lock.lock().unwrap();
    if core.suspended.load(Ordering::SeqCst) {
        return;
    }
    debug!(?event, cpu, "hotplug event for running timer");

    match event {
        HotplugEvent::Online => {
            if sub
                .state
                .try_change(SubTimerState::Stopped, SubTimerState::MpStarting)
            {
                if core.host.current_cpu() == cpu {
                    let now = core.host.now_ns();
                    sub::start_sub_timer(core, idx, now, 0);
                } else {
                    // Arming must happen on the new CPU; give the claim
                    // back and re-take it over there.
                    sub.state.set(SubTimerState::Stopped);
                    drop(guard);
                    let this = core.clone();
                    let _ = core
                        .host
                        .run_on_cpu(cpu, Box::new(move |cpu| mp_start_on_cpu(&this, cpu)));
                }
            }
        }
        HotplugEvent::Offline => loop {
            let state = sub.state.get();
            match state {
                SubTimerState::Active => {
                    if sub
                        .state
                        .try_change(SubTimerState::Active, SubTimerState::MpStopping)
                    {
                        drop(guard);
                        sub::stop_sub_timer(core, idx);
                        return;
                    }
                }
                SubTimerState::Callback | SubTimerState::CbRestarting => {
                    if sub.state.try_change(state, SubTimerState::CbStopping) {
                        return;
                    }
                }
                _ => return,
            }
            std::hint::spin_loop();
        },
    }
}

fn mp_start_on_cpu(core: &Arc<TimerCore>, cpu: CpuId) {
    let idx = cpu as usize;
    let sub = &core.subs[idx];
    let _guard = core.lock.lock().unwrap();
    // The timer may have been stopped, or the CPU serviced, since the
    // event was dispatched.
    if core.suspended.load(Ordering::SeqCst) {
        return;
    }
    if sub
        .state
        .try_change(SubTimerState::Stopped, SubTimerState::MpStarting)
    {
        let now = core.host.now_ns();
        sub::start_sub_timer(core, idx, now, 0);
    }
}

/// Winds down a sub-timer whose expiry was delivered on the wrong CPU
/// (its CPU went offline and the host migrated the pending firing). The
/// callback has not run and will not; the sub-timer is already claimed in
/// `Callback` state.
pub(crate) fn handle_migration(core: &Arc<TimerCore>, idx: usize) {
    let sub = &core.subs[idx];
    let guard = if core.subs.len() > 1 {
        Some(core.lock.lock().unwrap())
    } else {
        None
    };
    loop {
        let state = sub.state.get();
        match state {
            SubTimerState::Stopped => return,
            SubTimerState::CbDestroying => {
                drop(guard);
                crate::omni::callback_destroy(core, idx);
                return;
            }
            _ => {
                // Stopping, MpStopping, Callback or a marker someone put
                // on it meanwhile; all collapse to Stopped.
                if sub.state.try_change(state, SubTimerState::Stopped) {
                    return;
                }
            }
        }
        std::hint::spin_loop();
    }
}
