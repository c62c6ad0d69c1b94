use std::hint::black_box;
use std::sync::mpsc;
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use plop::collector::{ClockMode, Collector, State};
use plop::walker::FrameRegistry;
use plop::Error;

// Interval timers and their signals are process-wide, so tests that arm them take turns.
static SIGNALS: Mutex<()> = Mutex::new(());

fn serialize() -> MutexGuard<'static, ()> {
    match SIGNALS.lock() {
        Ok(guard) => guard,
        Err(e) => e.into_inner(),
    }
}

fn spin(length: Duration) -> u64 {
    plop::scope!("spin_for_signals");
    let start = Instant::now();
    let mut acc = 0u64;
    while start.elapsed() < length {
        acc = acc.wrapping_add(black_box(acc ^ 0x5bd1e995).rotate_left(7));
    }
    acc
}

fn sample_spin(mode: ClockMode) {
    let _guard = serialize();
    let mut collector =
        Collector::new(mode, Duration::from_millis(2), FrameRegistry::global()).unwrap();
    assert_eq!(collector.mode(), mode);

    collector.start(Duration::from_secs(60)).unwrap();
    assert_eq!(collector.state(), State::Running);
    spin(Duration::from_millis(300));
    collector.stop().unwrap();
    assert_eq!(collector.state(), State::Stopped);

    let stats = collector.stats();
    assert!(stats.samples_taken > 0, "no samples on the {} clock", mode);
    assert!(stats.samples_remaining > 0);
    assert!(stats.overhead > Duration::ZERO);

    let samples = collector.samples().unwrap();
    assert!(!samples.is_empty());
    assert!(
        samples
            .iter()
            .any(|stack| stack.leaf().map_or(false, |f| f.name == "spin_for_signals")),
        "the spinning frame was never sampled"
    );
    for stack in samples.iter() {
        assert!(!stack.is_empty());
    }
}

#[test]
fn samples_wall_clock_time() {
    sample_spin(ClockMode::Real);
}

#[test]
fn samples_process_cpu_time() {
    sample_spin(ClockMode::Prof);
}

#[test]
fn samples_user_cpu_time() {
    sample_spin(ClockMode::Virtual);
}

#[test]
fn samples_other_threads() {
    let _guard = serialize();
    let mut collector = Collector::new(
        ClockMode::Real,
        Duration::from_millis(2),
        FrameRegistry::global(),
    )
    .unwrap();
    collector.start(Duration::from_secs(60)).unwrap();
    thread::scope(|s| {
        s.spawn(|| {
            plop::scope!("background");
            spin(Duration::from_millis(300))
        });
        plop::scope!("foreground");
        spin(Duration::from_millis(300));
    });
    collector.stop().unwrap();

    let samples = collector.samples().unwrap();
    let has = |name: &str| {
        samples
            .iter()
            .any(|stack| stack.frames().iter().any(|f| f.name == name))
    };
    assert!(has("background"));
    assert!(has("foreground"));
}

#[test]
fn stops_on_its_own_when_the_duration_elapses() {
    let _guard = serialize();
    let mut collector = Collector::new(
        ClockMode::Real,
        Duration::from_millis(5),
        FrameRegistry::global(),
    )
    .unwrap();
    collector.start(Duration::from_millis(50)).unwrap();
    spin(Duration::from_millis(500));
    assert_eq!(collector.state(), State::Stopped);

    let stats = collector.stats();
    assert_eq!(stats.samples_remaining, 0);
    assert!(stats.samples_taken < 10);
    collector.stop().unwrap();
}

#[test]
fn one_collector_per_clock_mode() {
    let _guard = serialize();
    let first = Collector::new(
        ClockMode::Virtual,
        Duration::from_millis(10),
        FrameRegistry::global(),
    )
    .unwrap();
    let second = Collector::new(
        ClockMode::Virtual,
        Duration::from_millis(10),
        FrameRegistry::global(),
    );
    assert!(matches!(second, Err(Error::ModeInUse(ClockMode::Virtual))));

    // other clocks are still free
    let real = Collector::new(
        ClockMode::Real,
        Duration::from_millis(10),
        FrameRegistry::global(),
    );
    assert!(real.is_ok());

    drop(first);
    Collector::new(
        ClockMode::Virtual,
        Duration::from_millis(10),
        FrameRegistry::global(),
    )
    .unwrap();
}

#[test]
fn restart_after_reset() {
    let _guard = serialize();
    let mut collector = Collector::new(
        ClockMode::Real,
        Duration::from_millis(2),
        FrameRegistry::global(),
    )
    .unwrap();

    collector.start(Duration::from_secs(60)).unwrap();
    spin(Duration::from_millis(100));
    collector.stop().unwrap();
    assert!(collector.stats().samples_taken > 0);

    collector.reset().unwrap();
    assert_eq!(collector.state(), State::Idle);
    assert!(collector.samples().unwrap().is_empty());

    collector.start(Duration::from_secs(60)).unwrap();
    spin(Duration::from_millis(100));
    collector.stop().unwrap();
    let stats = collector.stats();
    assert!(stats.samples_taken > 0);
    assert!(collector.samples().unwrap().len() as u64 >= stats.samples_taken);
}

// The interrupt regularly lands while the worker is inside the allocator; a handler that
// allocated would deadlock on the allocator's lock sooner or later.
#[test]
fn allocating_while_sampled_at_a_high_rate() {
    let _guard = serialize();
    let mut collector = Collector::new(
        ClockMode::Prof,
        Duration::from_micros(20),
        FrameRegistry::global(),
    )
    .unwrap();
    collector.start(Duration::from_secs(600)).unwrap();

    let (done, finished) = mpsc::channel();
    thread::spawn(move || {
        plop::scope!("alloc_loop");
        let start = Instant::now();
        let mut kept = Vec::new();
        let mut i = 0usize;
        while start.elapsed() < Duration::from_secs(2) {
            let block: Box<[u64]> = vec![i as u64; 1 + i % 512].into_boxed_slice();
            kept.push(black_box(block));
            if kept.len() > 64 {
                kept.clear();
            }
            i += 1;
        }
        let _ = done.send(i);
    });

    let start = Instant::now();
    let allocations = loop {
        match finished.recv_timeout(Duration::from_millis(10)) {
            Ok(n) => break n,
            Err(mpsc::RecvTimeoutError::Timeout) => collector.drain(),
            Err(e) => panic!("allocating thread went away: {}", e),
        }
        assert!(
            start.elapsed() < Duration::from_secs(30),
            "allocating thread is stuck"
        );
    };
    collector.stop().unwrap();

    assert!(allocations > 0);
    let stats = collector.stats();
    assert!(stats.samples_taken > 0);
    let samples = collector.samples().unwrap();
    assert!(
        samples
            .iter()
            .any(|stack| stack.leaf().map_or(false, |f| f.name == "alloc_loop")),
        "the allocating frame was never sampled"
    );
}
