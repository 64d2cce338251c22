use std::sync::{Arc, Mutex};

use omni_timer::{create, CpuBinding, Timer, TimerConfig, TimerError};
use omni_timer_host::{SimHost, SimHostConfig, TimerHost};

const MS: u64 = 1_000_000;

type Log = Arc<Mutex<Vec<(u64, u64)>>>;

fn timer(host: &SimHost, interval_ns: u64, binding: CpuBinding, high_res: bool) -> (Timer, Log) {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let out = log.clone();
    let probe = host.clone();
    let timer = create(
        Arc::new(host.clone()),
        TimerConfig {
            interval_ns,
            binding,
            high_res,
        },
        Box::new(move |_ctl, tick| {
            out.lock().unwrap().push((tick, probe.now_ns()));
        }),
    )
    .unwrap();
    (timer, log)
}

#[test]
fn zero_interval_is_rejected() {
    let host = SimHost::new(SimHostConfig::default());
    let (timer, _log) = timer(&host, MS, CpuBinding::Any, true);
    assert_eq!(timer.change_interval(0), Err(TimerError::InvalidParameter));
}

#[test]
fn high_res_respacing_applies_from_the_next_tick() {
    let host = SimHost::new(SimHostConfig::default());
    let (timer, log) = timer(&host, MS, CpuBinding::Any, true);
    timer.start(MS).unwrap();
    host.advance_ns(2 * MS);

    // The 3ms expiry is already programmed; spacing changes after it.
    timer.change_interval(3 * MS).unwrap();
    host.advance_ns(8 * MS);

    let times: Vec<u64> = log.lock().unwrap().iter().map(|&(_, t)| t).collect();
    assert_eq!(times, vec![MS, 2 * MS, 3 * MS, 6 * MS, 9 * MS]);
    let ticks: Vec<u64> = log.lock().unwrap().iter().map(|&(tick, _)| tick).collect();
    assert_eq!(ticks, vec![1, 2, 3, 4, 5]);
}

#[test]
fn high_res_omni_respacing_is_allowed() {
    let host = SimHost::new(SimHostConfig::default());
    let (timer, log) = timer(&host, MS, CpuBinding::All, true);
    timer.start(MS).unwrap();
    host.advance_ns(MS);
    timer.change_interval(2 * MS).unwrap();
    host.advance_ns(3 * MS);

    // Per CPU: 1ms, then the pre-programmed 2ms, then 4ms.
    assert_eq!(log.lock().unwrap().len(), 12);
    timer.destroy();
}

#[test]
fn low_res_omni_respacing_is_refused() {
    let host = SimHost::new(SimHostConfig::default());
    let (timer, _log) = timer(&host, MS, CpuBinding::All, false);
    timer.start(MS).unwrap();
    assert_eq!(timer.change_interval(2 * MS), Err(TimerError::NotSupported));
    timer.destroy();
}

#[test]
fn low_res_single_respacing_restarts_the_timer() {
    let host = SimHost::new(SimHostConfig::default());
    let (timer, log) = timer(&host, 2 * MS, CpuBinding::Any, false);
    timer.start(2 * MS).unwrap();
    host.advance_ns(5 * MS);
    timer.change_interval(3 * MS).unwrap();
    host.advance_ns(10 * MS);

    let expect = vec![
        (1, 2 * MS),
        (2, 4 * MS),
        (1, 8 * MS),
        (2, 11 * MS),
        (3, 14 * MS),
    ];
    assert_eq!(*log.lock().unwrap(), expect);
}

#[test]
fn respacing_a_suspended_timer_takes_effect_on_start() {
    let host = SimHost::new(SimHostConfig::default());
    let (timer, log) = timer(&host, MS, CpuBinding::Any, false);
    timer.change_interval(4 * MS).unwrap();
    timer.start(4 * MS).unwrap();
    host.advance_ns(12 * MS);

    let times: Vec<u64> = log.lock().unwrap().iter().map(|&(_, t)| t).collect();
    assert_eq!(times, vec![4 * MS, 8 * MS, 12 * MS]);
}
