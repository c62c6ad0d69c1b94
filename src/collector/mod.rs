/// Sampling state shared with the interrupt handler, and the sample store.
pub mod sampler;

/// Interval timers and the routing of their signals.
pub mod timer;

use std::sync::{Arc, MutexGuard};
use std::time::Duration;

use crossbeam_utils::Backoff;

pub use sampler::{SampleStore, Stats};
pub use timer::{ClockMode, ITimer, TimerDriver};

use self::sampler::Sampler;
use self::timer::Route;
use crate::error::Error;
use crate::walker::StackWalker;

/// How many frames a collector buffers between two [drains](Collector::drain) unless told
/// otherwise with [`Collector::set_capacity`].
pub const DEFAULT_CAPACITY: usize = 1 << 16;

/// Where a [`Collector`] is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    /// Not started since creation or the last reset.
    Idle,
    /// The timer is armed and ticks are capturing stacks.
    Running,
    /// A stop was requested; the next tick disarms the timer.
    Stopping,
    /// The timer has been disarmed and the samples can be read.
    Stopped,
}

/// The start/stop/reset state machine around one interval timer.
///
/// ```text
/// Idle --start--> Running --stop--> Stopping --(next tick)--> Stopped --reset--> Idle
/// ```
///
/// A running collector also stops on its own once the tick budget computed by
/// [`start`](Collector::start) is used up. Samples can only be read while the collector is not
/// running.
///
/// Ticks write frames into a capture buffer allocated when the collector is created, since the
/// interrupt may land while the interrupted thread holds the allocator's lock. A tick whose
/// stacks do not fit is dropped and counted in [`Stats::samples_dropped`]. Long runs should
/// call [`drain`](Collector::drain) periodically from a regular thread to make room, as
/// [`Session::run`](crate::Session::run) does.
///
/// Collectors created with [`Collector::new`] are driven by the process's POSIX interval timer
/// for the chosen [`ClockMode`], and only one such collector may exist per clock mode at a
/// time. [`Collector::with_timer`] accepts any [`TimerDriver`]; whoever drives that timer calls
/// [`Collector::tick`] on every expiry.
pub struct Collector<W, T = ITimer>
where
    W: StackWalker,
    T: TimerDriver,
{
    sampler: Arc<Sampler<W, T>>,
    // dropped after the collector disarms its timer; only signal-driven collectors have one
    _route: Option<Route>,
    started: bool,
}

impl<W> Collector<W, ITimer>
where
    W: StackWalker + 'static,
{
    /// Creates a collector sampling every `interval` of `mode`'s clock, reading stacks with
    /// `walker`.
    ///
    /// Fails with [`Error::ModeInUse`] if another collector already uses `mode`.
    pub fn new(mode: ClockMode, interval: Duration, walker: W) -> Result<Self, Error> {
        check_interval(interval)?;
        let sampler = Arc::new(Sampler::new(
            walker,
            ITimer::new(mode),
            interval,
            DEFAULT_CAPACITY,
        ));;
        let route = Route::install(mode, sampler.clone())?;
        Ok(Collector {
            sampler,
            _route: Some(route),
            started: false,
        })
    }
}

impl<W, T> Collector<W, T>
where
    W: StackWalker,
    T: TimerDriver,
{
    /// Creates a collector on a custom timer. The caller delivers ticks through
    /// [`Collector::tick`].
    pub fn with_timer(interval: Duration, walker: W, timer: T) -> Result<Self, Error> {
        check_interval(interval)?;
        Ok(Collector {
            sampler: Arc::new(Sampler::new(walker, timer, interval, DEFAULT_CAPACITY)),
            _route: None,
            started: false,
        })
    }

    /// Arms the timer for `duration`, that is `floor(duration / interval)` ticks.
    ///
    /// Valid from [`State::Idle`] and [`State::Stopped`]; a stopped collector keeps appending to
    /// the samples it already holds until it is [reset](Collector::reset).
    pub fn start(&mut self, duration: Duration) -> Result<(), Error> {
        if !duration_is_positive(duration) {
            return Err(Error::Config(format!(
                "duration must be positive, got {:?}",
                duration
            )));
        }
        if !self.sampler.is_stopped() {
            return Err(Error::AlreadyRunning);
        }

        let interval = self.sampler.interval();
        let budget = (duration.as_nanos() / interval.as_nanos()).min(i64::MAX as u128) as i64;
        self.sampler.prime(budget);
        if let Err(e) = self.sampler.timer().arm(interval) {
            self.sampler.abandon();
            return Err(e.into());
        }
        self.started = true;
        debug!(
            "armed {} timer: {} ticks of {:?}",
            self.sampler.timer().clock(),
            budget,
            interval
        );
        Ok(())
    }

    /// Asks the next tick to disarm the timer, without waiting for it.
    pub fn request_stop(&self) {
        self.sampler.request_stop();
    }

    /// Waits until the timer has been disarmed.
    ///
    /// This busy-polls: a process-CPU or virtual timer only advances while the process runs,
    /// so a thread blocked in a wait could keep the final tick from ever arriving. The spin
    /// lasts at most one interval after a stop was requested.
    ///
    /// Returns [`Error::Sampling`] if a walk failure aborted the run.
    pub fn wait(&self) -> Result<(), Error> {
        let backoff = Backoff::new();
        while !self.sampler.is_stopped() {
            backoff.spin();
        }
        self.sampler.drain();
        match self.sampler.failure() {
            Some(e) => Err(Error::Sampling(e)),
            None => Ok(()),
        }
    }

    /// Requests a stop and waits for the timer to be disarmed.
    ///
    /// Calling it again, or on a collector that stopped on its own, returns immediately with
    /// the same outcome.
    pub fn stop(&self) -> Result<(), Error> {
        if !self.sampler.is_stopped() {
            self.request_stop();
        }
        self.wait()
    }

    /// Drops all samples and zeroes the counters.
    ///
    /// Fails with [`Error::Running`] unless the collector is idle or stopped.
    pub fn reset(&mut self) -> Result<(), Error> {
        if !self.sampler.is_stopped() {
            return Err(Error::Running);
        }
        self.sampler.reset();
        self.started = false;
        Ok(())
    }

    /// Runs one tick. Signal-driven collectors call this from their interrupt handler.
    pub fn tick(&self) {
        self.sampler.sample();
    }

    /// The current lifecycle state.
    pub fn state(&self) -> State {
        let stats = self.sampler.stats();
        if !self.started {
            State::Idle
        } else if stats.stopped {
            State::Stopped
        } else if stats.stopping {
            State::Stopping
        } else {
            State::Running
        }
    }

    /// A snapshot of the counters. Safe to call at any time.
    pub fn stats(&self) -> Stats {
        self.sampler.stats()
    }

    /// Moves the stacks captured so far out of the capture buffer and into the sample store.
    ///
    /// Safe to call at any time from any thread other than the one ticks are delivered on.
    pub fn drain(&self) {
        self.sampler.drain();
    }

    /// The number of frames the capture buffer holds between two drains.
    pub fn capacity(&self) -> usize {
        self.sampler.capacity()
    }

    /// Replaces the capture buffer with one holding `frames` frames.
    ///
    /// Fails with [`Error::Running`] unless the collector is idle or stopped.
    pub fn set_capacity(&mut self, frames: usize) -> Result<(), Error> {
        if frames == 0 {
            return Err(Error::Config(String::from(
                "capture buffer must hold at least one frame",
            )));
        }
        if !self.sampler.is_stopped() {
            return Err(Error::Running);
        }
        self.sampler.set_capacity(frames);
        Ok(())
    }

    /// The captured stacks.
    ///
    /// Fails with [`Error::Running`] while the timer is armed. The store stays locked, and
    /// [`drain`](Collector::drain) blocks, until the guard is dropped.
    pub fn samples(&self) -> Result<MutexGuard<'_, SampleStore>, Error> {
        if !self.sampler.is_stopped() {
            return Err(Error::Running);
        }
        self.sampler.drain();
        Ok(self.sampler.store())
    }

    /// The clock driving this collector.
    pub fn mode(&self) -> ClockMode {
        self.sampler.timer().clock()
    }

    /// The sampling interval.
    pub fn interval(&self) -> Duration {
        self.sampler.interval()
    }
}

impl<W, T> Drop for Collector<W, T>
where
    W: StackWalker,
    T: TimerDriver,
{
    fn drop(&mut self) {
        if !self.sampler.is_stopped() {
            if let Err(e) = self.sampler.timer().disarm() {
                warn!("failed to disarm {} timer: {}", self.mode(), e);
            }
            self.sampler.request_stop();
        }
    }
}

fn duration_is_positive(d: Duration) -> bool {
    !d.is_zero()
}

fn check_interval(interval: Duration) -> Result<(), Error> {
    if duration_is_positive(interval) {
        Ok(())
    } else {
        Err(Error::Config(String::from("interval must be positive")))
    }
}
