//! Deterministic simulated SMP host.
//!
//! `SimHost` models a small multiprocessor machine: one worker thread per
//! possible CPU, a virtual monotonic clock that only moves when a test calls
//! [`SimHost::advance_ns`], and native timers that fire in deadline order
//! while the clock advances. Expiries are dispatched one at a time and each
//! one is waited for before the clock moves again, so a test observes a
//! single, reproducible interleaving.
//!
//! Two behaviors intentionally mirror real hosts rather than an idealized
//! one: a timer pinned to an offline CPU has its firing migrated to another
//! online CPU (what a Linux-like host does with pending pinned timers), and
//! hotplug notifications can be delivered after the online-set change they
//! describe (`set_cpu_online_no_notify` + `notify_hotplug`).

use std::cell::Cell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::{self, JoinHandle, ThreadId};

use tracing::trace;

use crate::{
    CpuId, CpuSet, ExpiryFn, HostError, HostResult, HotplugEvent, HotplugObserver, NativeTimer,
    TimerHost, INVALID_CPU_ID,
};

thread_local! {
    static CURRENT_CPU: Cell<CpuId> = const { Cell::new(INVALID_CPU_ID) };
}

#[derive(Debug, Clone, Copy)]
pub struct SimHostConfig {
    /// Number of possible CPUs (ids `0..cpus`), all online initially.
    pub cpus: u32,
    /// Base tick granularity in nanoseconds (the jiffy length).
    pub tick_granularity_ns: u32,
    /// Whether the host advertises high-resolution timer support.
    pub high_res: bool,
}

impl Default for SimHostConfig {
    fn default() -> Self {
        Self {
            cpus: 4,
            tick_granularity_ns: 1_000_000,
            high_res: true,
        }
    }
}

type Job = Box<dyn FnOnce() + Send>;

struct JobState {
    queue: VecDeque<Job>,
    shutdown: bool,
}

struct JobQueue {
    state: Mutex<JobState>,
    cv: Condvar,
}

impl JobQueue {
    fn new() -> Self {
        Self {
            state: Mutex::new(JobState {
                queue: VecDeque::new(),
                shutdown: false,
            }),
            cv: Condvar::new(),
        }
    }

    fn push(&self, job: Job) {
        self.state.lock().unwrap().queue.push_back(job);
        self.cv.notify_one();
    }
}

fn worker_main(cpu: CpuId, queue: Arc<JobQueue>) {
    CURRENT_CPU.with(|c| c.set(cpu));
    loop {
        let job = {
            let mut state = queue.state.lock().unwrap();
            loop {
                if let Some(job) = state.queue.pop_front() {
                    break job;
                }
                if state.shutdown {
                    return;
                }
                state = queue.cv.wait(state).unwrap();
            }
        };
        job();
    }
}

struct Worker {
    queue: Arc<JobQueue>,
    handle: Option<JoinHandle<()>>,
}

struct Armed {
    deadline_ns: u64,
    pinned: Option<CpuId>,
}

struct TimerSt {
    armed: Option<Armed>,
    /// Bumped on every arm/cancel; a dispatched firing whose generation no
    /// longer matches is dropped instead of run.
    generation: u64,
    running: u32,
    running_thread: Option<ThreadId>,
}

struct SimTimerShared {
    seq: u64,
    expiry: ExpiryFn,
    st: Mutex<TimerSt>,
    idle: Condvar,
}

struct SimTimer {
    shared: Arc<SimTimerShared>,
}

impl NativeTimer for SimTimer {
    fn arm_absolute(&self, expires_ns: u64) {
        let mut st = self.shared.st.lock().unwrap();
        st.armed = Some(Armed {
            deadline_ns: expires_ns,
            pinned: None,
        });
        st.generation = st.generation.wrapping_add(1);
    }

    fn arm_absolute_pinned(&self, expires_ns: u64, cpu: CpuId) {
        let mut st = self.shared.st.lock().unwrap();
        st.armed = Some(Armed {
            deadline_ns: expires_ns,
            pinned: Some(cpu),
        });
        st.generation = st.generation.wrapping_add(1);
    }

    fn cancel_sync(&self) {
        let mut st = self.shared.st.lock().unwrap();
        // Wait out an expiry in flight on another thread; a handler
        // cancelling its own timer must not wait for itself.
        while st.running > 0 && st.running_thread != Some(thread::current().id()) {
            st = self.shared.idle.wait(st).unwrap();
        }
        st.armed = None;
        st.generation = st.generation.wrapping_add(1);
    }

    fn is_pending(&self) -> bool {
        self.shared.st.lock().unwrap().armed.is_some()
    }
}

struct SimInner {
    cfg: SimHostConfig,
    clock_ns: AtomicU64,
    online: Mutex<CpuSet>,
    workers: Vec<Worker>,
    timers: Mutex<Vec<Weak<SimTimerShared>>>,
    next_timer_seq: AtomicU64,
    hotplug: Mutex<Vec<(u64, Weak<dyn HotplugObserver>)>>,
    next_token: AtomicU64,
}

impl SimInner {
    fn dispatch_and_wait(&self, cpu: CpuId, job: impl FnOnce() + Send + 'static) {
        if CURRENT_CPU.with(|c| c.get()) == cpu {
            job();
            return;
        }
        let done = Arc::new((Mutex::new(false), Condvar::new()));
        let signal = done.clone();
        self.workers[cpu as usize].queue.push(Box::new(move || {
            job();
            *signal.0.lock().unwrap() = true;
            signal.1.notify_all();
        }));
        let mut finished = done.0.lock().unwrap();
        while !*finished {
            finished = done.1.wait(finished).unwrap();
        }
    }

    /// Earliest armed deadline at or before `target_ns`, ties broken by
    /// timer creation order.
    fn next_due(&self, target_ns: u64) -> Option<(u64, Arc<SimTimerShared>)> {
        let mut timers = self.timers.lock().unwrap();
        timers.retain(|w| w.strong_count() > 0);
        let mut best: Option<(u64, u64, Arc<SimTimerShared>)> = None;
        for weak in timers.iter() {
            let Some(timer) = weak.upgrade() else { continue };
            let st = timer.st.lock().unwrap();
            let Some(armed) = &st.armed else { continue };
            if armed.deadline_ns > target_ns {
                continue;
            }
            let key = (armed.deadline_ns, timer.seq);
            if best
                .as_ref()
                .map_or(true, |(d, s, _)| key < (*d, *s))
            {
                let deadline = armed.deadline_ns;
                let seq = timer.seq;
                drop(st);
                best = Some((deadline, seq, timer));
            }
        }
        best.map(|(deadline, _, timer)| (deadline, timer))
    }

    fn fire(&self, timer: &Arc<SimTimerShared>) {
        let (generation, pinned) = {
            let mut st = timer.st.lock().unwrap();
            let Some(armed) = st.armed.take() else { return };
            (st.generation, armed.pinned)
        };
        let online = *self.online.lock().unwrap();
        let cpu = match pinned {
            // The host migrates a pinned firing when its CPU went offline.
            Some(cpu) if online.contains(cpu) => cpu,
            _ => match online.iter().next() {
                Some(cpu) => cpu,
                None => return,
            },
        };
        trace!(cpu, seq = timer.seq, "dispatching timer expiry");
        let shared = timer.clone();
        self.dispatch_and_wait(cpu, move || {
            {
                let mut st = shared.st.lock().unwrap();
                if st.generation != generation {
                    return;
                }
                st.running += 1;
                st.running_thread = Some(thread::current().id());
            }
            (shared.expiry)();
            let mut st = shared.st.lock().unwrap();
            st.running -= 1;
            st.running_thread = None;
            drop(st);
            shared.idle.notify_all();
        });
    }

    fn advance_to(&self, target_ns: u64) {
        while let Some((deadline, timer)) = self.next_due(target_ns) {
            self.clock_ns.fetch_max(deadline, Ordering::SeqCst);
            self.fire(&timer);
        }
        self.clock_ns.fetch_max(target_ns, Ordering::SeqCst);
    }
}

impl Drop for SimInner {
    fn drop(&mut self) {
        for worker in &self.workers {
            let mut state = worker.queue.state.lock().unwrap();
            state.shutdown = true;
            drop(state);
            worker.queue.cv.notify_all();
        }
        for worker in &mut self.workers {
            if let Some(handle) = worker.handle.take() {
                let _ = handle.join();
            }
        }
    }
}

/// Handle to a simulated host. Cheap to clone; all clones share the machine.
#[derive(Clone)]
pub struct SimHost {
    inner: Arc<SimInner>,
}

impl SimHost {
    pub fn new(cfg: SimHostConfig) -> Self {
        assert!(cfg.cpus >= 1 && cfg.cpus <= CpuSet::MAX_CPUS);
        assert!(cfg.tick_granularity_ns > 0);

        let workers = (0..cfg.cpus)
            .map(|cpu| {
                let queue = Arc::new(JobQueue::new());
                let thread_queue = queue.clone();
                let handle = thread::Builder::new()
                    .name(format!("sim-cpu{cpu}"))
                    .spawn(move || worker_main(cpu, thread_queue))
                    .expect("spawn sim cpu worker");
                Worker {
                    queue,
                    handle: Some(handle),
                }
            })
            .collect();

        let online = (0..cfg.cpus).collect();
        SimHost {
            inner: Arc::new(SimInner {
                cfg,
                clock_ns: AtomicU64::new(0),
                online: Mutex::new(online),
                workers,
                timers: Mutex::new(Vec::new()),
                next_timer_seq: AtomicU64::new(0),
                hotplug: Mutex::new(Vec::new()),
                next_token: AtomicU64::new(1),
            }),
        }
    }

    /// Moves the virtual clock forward, firing every armed timer whose
    /// deadline falls inside the window, in deadline order. Returns once all
    /// resulting expiry handlers have completed.
    pub fn advance_ns(&self, delta_ns: u64) {
        let target = self.inner.clock_ns.load(Ordering::SeqCst) + delta_ns;
        self.inner.advance_to(target);
    }

    /// Changes a CPU's online state and delivers the matching hotplug
    /// notification to registered observers.
    pub fn set_cpu_online(&self, cpu: CpuId, online: bool) -> HostResult<()> {
        self.set_cpu_online_no_notify(cpu, online)?;
        let event = if online {
            HotplugEvent::Online
        } else {
            HotplugEvent::Offline
        };
        self.notify_hotplug(event, cpu);
        Ok(())
    }

    /// Changes the online set without notifying observers, modelling the
    /// latency between a CPU state change and its notifier chain running.
    /// Pair with [`SimHost::notify_hotplug`].
    pub fn set_cpu_online_no_notify(&self, cpu: CpuId, online: bool) -> HostResult<()> {
        if !self.is_cpu_possible(cpu) {
            return Err(HostError::NoSuchCpu(cpu));
        }
        let mut set = self.inner.online.lock().unwrap();
        if online {
            set.insert(cpu);
        } else {
            set.remove(cpu);
        }
        Ok(())
    }

    /// Delivers a hotplug notification to every live registered observer.
    pub fn notify_hotplug(&self, event: HotplugEvent, cpu: CpuId) {
        let observers: Vec<Arc<dyn HotplugObserver>> = {
            let mut list = self.inner.hotplug.lock().unwrap();
            list.retain(|(_, weak)| weak.strong_count() > 0);
            list.iter().filter_map(|(_, weak)| weak.upgrade()).collect()
        };
        trace!(?event, cpu, observers = observers.len(), "hotplug event");
        for observer in observers {
            observer.cpu_event(event, cpu);
        }
    }
}

impl TimerHost for SimHost {
    fn now_ns(&self) -> u64 {
        self.inner.clock_ns.load(Ordering::SeqCst)
    }

    fn tick_granularity_ns(&self) -> u32 {
        self.inner.cfg.tick_granularity_ns
    }

    fn supports_high_res(&self) -> bool {
        self.inner.cfg.high_res
    }

    fn max_cpu_id(&self) -> CpuId {
        self.inner.cfg.cpus - 1
    }

    fn current_cpu(&self) -> CpuId {
        CURRENT_CPU.with(|c| c.get())
    }

    fn online_cpus(&self) -> CpuSet {
        *self.inner.online.lock().unwrap()
    }

    fn is_cpu_possible(&self, cpu: CpuId) -> bool {
        cpu < self.inner.cfg.cpus
    }

    fn run_on_cpu(&self, cpu: CpuId, f: Box<dyn FnOnce(CpuId) + Send>) -> HostResult<()> {
        if !self.is_cpu_possible(cpu) {
            return Err(HostError::NoSuchCpu(cpu));
        }
        if !self.online_cpus().contains(cpu) {
            return Err(HostError::CpuOffline(cpu));
        }
        self.inner.dispatch_and_wait(cpu, move || f(cpu));
        Ok(())
    }

    fn run_on_all_cpus(&self, f: Arc<dyn Fn(CpuId) + Send + Sync>) {
        for cpu in self.online_cpus().iter() {
            let f = f.clone();
            self.inner.dispatch_and_wait(cpu, move || f(cpu));
        }
    }

    fn new_timer(&self, _high_res: bool, expiry: ExpiryFn) -> Box<dyn NativeTimer> {
        let shared = Arc::new(SimTimerShared {
            seq: self.inner.next_timer_seq.fetch_add(1, Ordering::Relaxed),
            expiry,
            st: Mutex::new(TimerSt {
                armed: None,
                generation: 0,
                running: 0,
                running_thread: None,
            }),
            idle: Condvar::new(),
        });
        self.inner
            .timers
            .lock()
            .unwrap()
            .push(Arc::downgrade(&shared));
        Box::new(SimTimer { shared })
    }

    fn register_hotplug(&self, observer: Weak<dyn HotplugObserver>) -> u64 {
        let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);
        self.inner.hotplug.lock().unwrap().push((token, observer));
        token
    }

    fn deregister_hotplug(&self, token: u64) {
        self.inner
            .hotplug
            .lock()
            .unwrap()
            .retain(|(t, _)| *t != token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn recording_timer(host: &SimHost, log: &Arc<Mutex<Vec<(CpuId, u64)>>>) -> Box<dyn NativeTimer> {
        let log = log.clone();
        let probe = host.clone();
        host.new_timer(
            true,
            Arc::new(move || {
                log.lock()
                    .unwrap()
                    .push((probe.current_cpu(), probe.now_ns()));
            }),
        )
    }

    #[test]
    fn fires_in_deadline_order_and_clock_tracks_fires() {
        let host = SimHost::new(SimHostConfig::default());
        let log = Arc::new(Mutex::new(Vec::new()));
        let a = recording_timer(&host, &log);
        let b = recording_timer(&host, &log);

        b.arm_absolute_pinned(2_000, 1);
        a.arm_absolute_pinned(1_000, 0);
        host.advance_ns(5_000);

        assert_eq!(*log.lock().unwrap(), vec![(0, 1_000), (1, 2_000)]);
        assert_eq!(host.now_ns(), 5_000);
        assert!(!a.is_pending());
    }

    #[test]
    fn cancel_sync_prevents_future_fires() {
        let host = SimHost::new(SimHostConfig::default());
        let fired = Arc::new(AtomicU32::new(0));
        let counter = fired.clone();
        let timer = host.new_timer(
            true,
            Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        timer.arm_absolute(1_000);
        assert!(timer.is_pending());
        timer.cancel_sync();
        host.advance_ns(10_000);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn pinned_fire_migrates_when_cpu_is_offline() {
        let host = SimHost::new(SimHostConfig::default());
        let log = Arc::new(Mutex::new(Vec::new()));
        let timer = recording_timer(&host, &log);
        timer.arm_absolute_pinned(1_000, 2);
        host.set_cpu_online_no_notify(2, false).unwrap();
        host.advance_ns(2_000);
        // CPU 2 is gone; the firing lands on the lowest online CPU.
        assert_eq!(*log.lock().unwrap(), vec![(0, 1_000)]);
    }

    #[test]
    fn run_on_cpu_reports_topology_errors() {
        let host = SimHost::new(SimHostConfig::default());
        assert!(matches!(
            host.run_on_cpu(9, Box::new(|_| {})),
            Err(HostError::NoSuchCpu(9))
        ));
        host.set_cpu_online(1, false).unwrap();
        assert!(matches!(
            host.run_on_cpu(1, Box::new(|_| {})),
            Err(HostError::CpuOffline(1))
        ));

        let seen = Arc::new(Mutex::new(INVALID_CPU_ID));
        let out = seen.clone();
        let probe = host.clone();
        host.run_on_cpu(
            2,
            Box::new(move |cpu| {
                assert_eq!(probe.current_cpu(), cpu);
                *out.lock().unwrap() = cpu;
            }),
        )
        .unwrap();
        assert_eq!(*seen.lock().unwrap(), 2);
    }

    #[test]
    fn run_on_all_cpus_covers_online_set() {
        let host = SimHost::new(SimHostConfig::default());
        host.set_cpu_online(3, false).unwrap();
        let seen = Arc::new(Mutex::new(CpuSet::empty()));
        let out = seen.clone();
        host.run_on_all_cpus(Arc::new(move |cpu| {
            out.lock().unwrap().insert(cpu);
        }));
        assert_eq!(*seen.lock().unwrap(), [0, 1, 2].into_iter().collect());
    }

    #[test]
    fn rearm_from_expiry_fires_again_within_one_advance() {
        let host = SimHost::new(SimHostConfig::default());
        let count = Arc::new(AtomicU32::new(0));

        struct Chain {
            timer: Mutex<Option<Box<dyn NativeTimer>>>,
        }
        let chain = Arc::new(Chain {
            timer: Mutex::new(None),
        });

        let counter = count.clone();
        let chain_cb = chain.clone();
        let probe = host.clone();
        let timer = host.new_timer(
            true,
            Arc::new(move || {
                let fired = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if fired < 3 {
                    if let Some(t) = chain_cb.timer.lock().unwrap().as_ref() {
                        t.arm_absolute(probe.now_ns() + 1_000);
                    }
                }
            }),
        );
        timer.arm_absolute(1_000);
        *chain.timer.lock().unwrap() = Some(timer);

        host.advance_ns(10_000);
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }
}
