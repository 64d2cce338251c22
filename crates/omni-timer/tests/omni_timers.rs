//! All-CPU timers: one sub-timer per CPU, each with its own tick sequence.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;

use omni_timer::{create, CpuBinding, SubTimerState, Timer, TimerConfig, TimerError};
use omni_timer_host::{CpuId, SimHost, SimHostConfig, TimerHost};

const MS: u64 = 1_000_000;

type Log = Arc<Mutex<Vec<(CpuId, u64, u64)>>>;

fn omni_timer(host: &SimHost, interval_ns: u64) -> (Timer, Log) {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let out = log.clone();
    let probe = host.clone();
    let timer = create(
        Arc::new(host.clone()),
        TimerConfig {
            interval_ns,
            binding: CpuBinding::All,
            high_res: true,
        },
        Box::new(move |_ctl, tick| {
            out.lock().unwrap().push((probe.current_cpu(), tick, probe.now_ns()));
        }),
    )
    .unwrap();
    (timer, log)
}

#[test]
fn every_online_cpu_gets_its_own_tick_sequence() {
    let host = SimHost::new(SimHostConfig::default());
    let (timer, log) = omni_timer(&host, MS);
    timer.start(MS).unwrap();
    host.advance_ns(3 * MS);

    let log = log.lock().unwrap();
    assert_eq!(log.len(), 12);
    for cpu in 0..4u32 {
        let ticks: Vec<(u64, u64)> = log
            .iter()
            .filter(|&&(c, _, _)| c == cpu)
            .map(|&(_, tick, t)| (tick, t))
            .collect();
        assert_eq!(ticks, vec![(1, MS), (2, 2 * MS), (3, 3 * MS)], "cpu {cpu}");
    }
    timer.destroy();
}

#[test]
fn stop_quiesces_every_sub_timer() {
    let host = SimHost::new(SimHostConfig::default());
    let (timer, log) = omni_timer(&host, MS);
    timer.start(MS).unwrap();
    host.advance_ns(2 * MS);
    timer.stop().unwrap();
    host.advance_ns(5 * MS);

    assert_eq!(log.lock().unwrap().len(), 8);
    assert_eq!(timer.sub_timer_states(), vec![SubTimerState::Stopped; 4]);
}

#[test]
fn restart_while_a_callback_is_winding_down_is_busy() {
    let host = SimHost::new(SimHostConfig::default());
    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let entered_tx = Mutex::new(entered_tx);
    let release_rx = Mutex::new(release_rx);
    let blocked_once = AtomicBool::new(false);

    let probe = host.clone();
    let timer = create(
        Arc::new(host.clone()),
        TimerConfig {
            interval_ns: MS,
            binding: CpuBinding::All,
            high_res: true,
        },
        Box::new(move |_ctl, _tick| {
            // Block the first CPU-0 callback until the test releases it.
            if probe.current_cpu() == 0 && !blocked_once.swap(true, Ordering::SeqCst) {
                entered_tx.lock().unwrap().send(()).unwrap();
                release_rx.lock().unwrap().recv().unwrap();
            }
        }),
    )
    .unwrap();
    timer.start(MS).unwrap();

    // Drive the clock from a helper thread; it will sit inside the blocked
    // CPU-0 callback until released.
    let driver_host = host.clone();
    let driver = thread::spawn(move || driver_host.advance_ns(MS));
    entered_rx.recv().unwrap();

    // Stop leaves CPU 0 a wind-down marker; starting again before the
    // callback has honored it must be refused.
    timer.stop().unwrap();
    assert_eq!(timer.start(MS), Err(TimerError::TimerBusy));

    release_tx.send(()).unwrap();
    driver.join().unwrap();

    // The marker has been consumed; the timer is restartable now.
    assert_eq!(timer.sub_timer_states(), vec![SubTimerState::Stopped; 4]);
    timer.start(MS).unwrap();
    timer.destroy();
}

#[test]
fn omni_timer_destroyed_while_running() {
    let host = SimHost::new(SimHostConfig::default());
    let (timer, log) = omni_timer(&host, MS);
    timer.start(MS).unwrap();
    host.advance_ns(MS);
    timer.destroy();
    host.advance_ns(5 * MS);
    assert_eq!(log.lock().unwrap().len(), 4);
}
