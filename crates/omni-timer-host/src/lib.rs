//! Host capability layer consumed by the `omni-timer` subsystem.
//!
//! The timer subsystem does not own a clock, a timer wheel, or CPU topology;
//! it is built on whatever native facilities the surrounding host provides.
//! This crate expresses those facilities as traits ([`TimerHost`],
//! [`NativeTimer`], [`HotplugObserver`]) and ships [`SimHost`], a
//! deterministic simulated SMP host driven by an explicitly advanced virtual
//! clock, so the subsystem can be exercised without real hardware timers.

mod cpu;
mod sim;

pub use cpu::{CpuId, CpuSet, INVALID_CPU_ID};
pub use sim::{SimHost, SimHostConfig};

use std::sync::{Arc, Weak};

use thiserror::Error;

pub type HostResult<T> = std::result::Result<T, HostError>;

#[derive(Debug, Error)]
pub enum HostError {
    #[error("cpu {0} does not exist on this host")]
    NoSuchCpu(CpuId),

    #[error("cpu {0} is offline")]
    CpuOffline(CpuId),
}

/// CPU hotplug notification payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HotplugEvent {
    Online,
    Offline,
}

/// Receiver for CPU online/offline notifications.
///
/// Observers are registered weakly; a dropped observer is unregistered
/// implicitly. Events may be delivered from an arbitrary thread context and
/// the observer must tolerate events racing its own control operations.
pub trait HotplugObserver: Send + Sync {
    fn cpu_event(&self, event: HotplugEvent, cpu: CpuId);
}

/// Expiry handler attached to a native timer at construction time.
pub type ExpiryFn = Arc<dyn Fn() + Send + Sync>;

/// One native host timer: arm-at-absolute-time, cancel-synchronously,
/// fire-callback-once semantics.
///
/// Re-arming while armed replaces the previous deadline. `cancel_sync` blocks
/// until no expiry handler is in flight on any *other* execution context; it
/// never waits for the calling context itself, so a handler may cancel its
/// own timer.
pub trait NativeTimer: Send + Sync {
    fn arm_absolute(&self, expires_ns: u64);

    /// Arms the timer so the expiry handler runs on `cpu`.
    fn arm_absolute_pinned(&self, expires_ns: u64, cpu: CpuId);

    fn cancel_sync(&self);

    fn is_pending(&self) -> bool;
}

/// The full set of host facilities the timer subsystem consumes.
pub trait TimerHost: Send + Sync + 'static {
    /// Monotonic nanosecond timestamp.
    fn now_ns(&self) -> u64;

    /// Granularity of the base (non-high-resolution) periodic tick, in
    /// nanoseconds. The jiffy length, on a Linux-like host.
    fn tick_granularity_ns(&self) -> u32;

    /// Whether the host offers timers finer than the base tick.
    fn supports_high_res(&self) -> bool;

    fn max_cpu_id(&self) -> CpuId;

    /// The CPU the calling context executes on, or [`INVALID_CPU_ID`] when
    /// the context is not CPU-bound.
    fn current_cpu(&self) -> CpuId;

    fn online_cpus(&self) -> CpuSet;

    fn is_cpu_possible(&self, cpu: CpuId) -> bool;

    /// Runs `f` on `cpu` and waits for it to complete. Fails if the CPU does
    /// not exist or is offline.
    fn run_on_cpu(&self, cpu: CpuId, f: Box<dyn FnOnce(CpuId) + Send>) -> HostResult<()>;

    /// Runs `f` on every online CPU and waits for completion on all of them.
    fn run_on_all_cpus(&self, f: Arc<dyn Fn(CpuId) + Send + Sync>);

    /// Creates a native timer that invokes `expiry` when it fires.
    /// `high_res` requests sub-tick precision where available.
    fn new_timer(&self, high_res: bool, expiry: ExpiryFn) -> Box<dyn NativeTimer>;

    /// Registers a hotplug observer; returns a token for deregistration.
    fn register_hotplug(&self, observer: Weak<dyn HotplugObserver>) -> u64;

    fn deregister_hotplug(&self, token: u64);
}
