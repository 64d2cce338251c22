//! Cross-CPU software timers.
//!
//! A [`Timer`] delivers periodic or one-shot callbacks on top of a
//! [`TimerHost`]. It can run unbound, pinned to one CPU, or fan out with an
//! independent sub-timer per CPU (an "omni" timer) that follows CPU hotplug.
//!
//! Control operations, the expiry callback and the hotplug observer may all
//! race; they coordinate through one atomic state word per sub-timer (see
//! [`SubTimerState`]). The callback may call back into [`TimerRef::stop`],
//! [`TimerRef::start`] and [`TimerRef::change_interval`], and may even drop
//! the owning [`Timer`]; requests that land while the callback runs are
//! recorded as state markers and honored when it returns.

mod error;
mod hotplug;
mod omni;
mod single;
mod state;
mod sub;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use omni_timer_host::{CpuId, TimerHost};
use tracing::debug;

pub use error::{Result, TimerError};
pub use state::SubTimerState;

use sub::SubTimer;

/// Which CPU(s) a timer fires on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuBinding {
    /// Fire wherever the host finds convenient.
    Any,
    /// Fire on one CPU. The CPU must exist; firing stops while it is
    /// offline.
    Specific(CpuId),
    /// Fire on every online CPU, each with its own tick sequence.
    All,
}

#[derive(Debug, Clone, Copy)]
pub struct TimerConfig {
    /// Interval between ticks in nanoseconds; 0 makes the timer one-shot.
    pub interval_ns: u64,
    pub binding: CpuBinding,
    /// Request high-resolution scheduling. Falls back to tick-granular
    /// scheduling when the host cannot do better.
    pub high_res: bool,
}

/// Borrow of a timer handed to its callback, allowing re-entrant control.
pub struct TimerRef<'a> {
    pub(crate) core: &'a Arc<TimerCore>,
}

impl TimerRef<'_> {
    pub fn start(&self, first_ns: u64) -> Result<()> {
        start_core(self.core, first_ns)
    }

    pub fn stop(&self) -> Result<()> {
        stop_core(self.core)
    }

    pub fn change_interval(&self, interval_ns: u64) -> Result<()> {
        change_interval_core(self.core, interval_ns)
    }
}

pub type TimerCallback = Box<dyn Fn(TimerRef<'_>, u64) + Send + Sync>;

pub(crate) struct TimerCore {
    pub host: Arc<dyn TimerHost>,
    pub binding: CpuBinding,
    pub high_res: bool,
    pub suspended: AtomicBool,
    pub interval_ns: AtomicU64,
    /// Interval in whole host ticks, 0 when it does not divide evenly.
    pub interval_ticks: AtomicU64,
    pub callback: TimerCallback,
    /// Serializes whole-set state flips; meaningful only with more than
    /// one sub-timer. Never held across a callback or a blocking cancel.
    pub lock: Mutex<()>,
    pub subs: Box<[SubTimer]>,
    pub hotplug_token: AtomicU64,
    pub weak_self: Weak<TimerCore>,
}

/// Owning timer handle. Dropping it destroys the timer: an active timer is
/// stopped first, and a callback in flight finishes before the timer's
/// host resources are released.
pub struct Timer {
    core: Arc<TimerCore>,
}

impl Timer {
    /// Explicit destroy; identical to dropping the handle.
    pub fn destroy(self) {}

    /// Snapshot of each sub-timer's state, in CPU order.
    pub fn sub_timer_states(&self) -> Vec<SubTimerState> {
        self.core.subs.iter().map(|s| s.state.get()).collect()
    }

    /// Current interval in nanoseconds; 0 for a one-shot timer.
    pub fn interval_ns(&self) -> u64 {
        self.core.interval_ns.load(Ordering::SeqCst)
    }

    pub fn start(&self, first_ns: u64) -> Result<()> {
        start_core(&self.core, first_ns)
    }

    pub fn stop(&self) -> Result<()> {
        stop_core(&self.core)
    }

    pub fn change_interval(&self, interval_ns: u64) -> Result<()> {
        change_interval_core(&self.core, interval_ns)
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        destroy_core(&self.core);
    }
}

/// Creates a timer in the suspended state.
pub fn create(
    host: Arc<dyn TimerHost>,
    config: TimerConfig,
    callback: TimerCallback,
) -> Result<Timer> {
    if let CpuBinding::Specific(cpu) = config.binding {
        if !host.is_cpu_possible(cpu) {
            return Err(TimerError::CpuNotFound);
        }
    }
    if config.binding == CpuBinding::All && config.interval_ns == 0 {
        return Err(TimerError::NotImplemented);
    }

    let high_res = config.high_res && host.supports_high_res();
    let count = match config.binding {
        CpuBinding::All => host.max_cpu_id() as usize + 1,
        _ => 1,
    };
    let g = u64::from(host.tick_granularity_ns());

    let core = Arc::new_cyclic(|weak: &Weak<TimerCore>| {
        let subs = (0..count)
            .map(|idx| {
                let cpu = match config.binding {
                    CpuBinding::All => idx as CpuId,
                    CpuBinding::Specific(cpu) => cpu,
                    CpuBinding::Any => omni_timer_host::INVALID_CPU_ID,
                };
                let expiry_weak = weak.clone();
                let native = host.new_timer(
                    high_res,
                    Arc::new(move || {
                        if let Some(core) = expiry_weak.upgrade() {
                            sub::expiry(&core, idx);
                        }
                    }),
                );
                SubTimer::new(cpu, native)
            })
            .collect();
        TimerCore {
            host: host.clone(),
            binding: config.binding,
            high_res,
            suspended: AtomicBool::new(true),
            interval_ns: AtomicU64::new(config.interval_ns),
            interval_ticks: AtomicU64::new(whole_ticks(config.interval_ns, g)),
            callback,
            lock: Mutex::new(()),
            subs,
            hotplug_token: AtomicU64::new(0),
            weak_self: weak.clone(),
        }
    });

    if count > 1 {
        let observer = Arc::downgrade(&core) as Weak<dyn omni_timer_host::HotplugObserver>;
        let token = core.host.register_hotplug(observer);
        core.hotplug_token.store(token, Ordering::SeqCst);
    }
    debug!(
        binding = ?config.binding,
        interval_ns = config.interval_ns,
        high_res,
        "timer created"
    );
    Ok(Timer { core })
}

/// Base scheduling granularity of low-resolution timers on this host.
pub fn system_granularity_ns(host: &dyn TimerHost) -> u32 {
    host.tick_granularity_ns()
}

/// Whether [`TimerConfig::high_res`] buys anything on this host.
pub fn can_do_high_resolution(host: &dyn TimerHost) -> bool {
    host.supports_high_res()
}

fn whole_ticks(interval_ns: u64, granularity_ns: u64) -> u64 {
    if interval_ns % granularity_ns == 0 {
        interval_ns / granularity_ns
    } else {
        0
    }
}

fn start_core(core: &Arc<TimerCore>, first_ns: u64) -> Result<()> {
    if !core.suspended.load(Ordering::SeqCst) {
        return Err(TimerError::TimerActive);
    }
    match core.binding {
        CpuBinding::All => omni::omni_start(core, first_ns),
        _ => single::start_single(core, first_ns),
    }
}

fn stop_core(core: &Arc<TimerCore>) -> Result<()> {
    if core.suspended.load(Ordering::SeqCst) {
        return Err(TimerError::TimerSuspended);
    }
    match core.binding {
        CpuBinding::All => {
            omni::omni_stop(core, false);
        }
        _ => {
            single::stop_single(core, false);
        }
    }
    Ok(())
}

fn change_interval_core(core: &Arc<TimerCore>, interval_ns: u64) -> Result<()> {
    if interval_ns == 0 {
        return Err(TimerError::InvalidParameter);
    }
    if core.high_res {
        // The expiry path re-reads the interval after every callback; the
        // new spacing takes effect from the next tick.
        core.interval_ns.store(interval_ns, Ordering::SeqCst);
        return Ok(());
    }
    if core.subs.len() > 1 {
        return Err(TimerError::NotSupported);
    }

    // Low-resolution timers keep their schedule in tick arithmetic, so a
    // running timer is restarted with the new spacing.
    let was_running = !core.suspended.load(Ordering::SeqCst);
    if was_running {
        let _ = stop_core(core);
    }
    let g = u64::from(core.host.tick_granularity_ns());
    core.interval_ns.store(interval_ns, Ordering::SeqCst);
    core.interval_ticks.store(whole_ticks(interval_ns, g), Ordering::SeqCst);
    if was_running {
        start_core(core, interval_ns)?;
    }
    Ok(())
}

fn destroy_core(core: &Arc<TimerCore>) {
    let can_release = if !core.suspended.load(Ordering::SeqCst) {
        let had_callbacks = match core.binding {
            CpuBinding::All => omni::omni_stop(core, true),
            _ => single::stop_single(core, true),
        };
        !had_callbacks
    } else {
        // Suspended, but callbacks may still be winding down from an
        // earlier stop; hand any of them the destroy instead.
        let guard = if core.subs.len() > 1 {
            Some(core.lock.lock().unwrap())
        } else {
            None
        };
        let mut can_release = true;
        for sub in core.subs.iter() {
            loop {
                let state = sub.state.get();
                match state {
                    SubTimerState::Callback
                    | SubTimerState::CbRestarting
                    | SubTimerState::CbStopping => {
                        if sub.state.try_change(state, SubTimerState::CbDestroying) {
                            can_release = false;
                            break;
                        }
                    }
                    SubTimerState::CbDestroying => {
                        can_release = false;
                        break;
                    }
                    _ => break,
                }
                std::hint::spin_loop();
            }
        }
        drop(guard);
        can_release
    };

    if can_release {
        destroy_it(core);
    }
}

/// Releases host-side resources. Memory is released when the last clone of
/// the core (handle or in-flight expiry) goes away.
pub(crate) fn destroy_it(core: &TimerCore) {
    let token = core.hotplug_token.swap(0, Ordering::SeqCst);
    if token != 0 {
        core.host.deregister_hotplug(token);
    }
    debug!("timer destroyed");
}
