use std::fmt;
use std::io;
use std::mem;
use std::ptr;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::Error;

/// The clock whose progress drives the sampling interval.
///
/// See `man 2 setitimer`. The choice decides whether time a thread spends blocked or sleeping
/// counts towards the next tick.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum ClockMode {
    /// Wall-clock time (`ITIMER_REAL`, delivered as `SIGALRM`). Idle time counts.
    Real,
    /// CPU time spent by the process, user and system (`ITIMER_PROF`, delivered as `SIGPROF`).
    #[default]
    Prof,
    /// User-mode CPU time of the process (`ITIMER_VIRTUAL`, delivered as `SIGVTALRM`).
    Virtual,
}

impl ClockMode {
    const ALL: [ClockMode; 3] = [ClockMode::Real, ClockMode::Prof, ClockMode::Virtual];

    fn which(self) -> libc::c_int {
        match self {
            ClockMode::Real => libc::ITIMER_REAL,
            ClockMode::Prof => libc::ITIMER_PROF,
            ClockMode::Virtual => libc::ITIMER_VIRTUAL,
        }
    }

    /// The signal the kernel delivers when this clock's timer expires.
    pub fn signal(self) -> libc::c_int {
        match self {
            ClockMode::Real => libc::SIGALRM,
            ClockMode::Prof => libc::SIGPROF,
            ClockMode::Virtual => libc::SIGVTALRM,
        }
    }

    fn from_signal(signal: libc::c_int) -> Option<Self> {
        Self::ALL.into_iter().find(|mode| mode.signal() == signal)
    }

    fn index(self) -> usize {
        self as usize
    }

    /// The name this mode is parsed from.
    pub fn as_str(self) -> &'static str {
        match self {
            ClockMode::Real => "real",
            ClockMode::Prof => "prof",
            ClockMode::Virtual => "virtual",
        }
    }
}

impl FromStr for ClockMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "real" => Ok(ClockMode::Real),
            "prof" => Ok(ClockMode::Prof),
            "virtual" => Ok(ClockMode::Virtual),
            unknown => Err(Error::Config(format!("unknown clock mode: {}", unknown))),
        }
    }
}

impl fmt::Display for ClockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A source of recurring timer interrupts.
///
/// `disarm` is called from inside the interrupt handler on the terminal tick, so it must be
/// safe to call there: no locks, no allocation.
pub trait TimerDriver: Send + Sync {
    /// The clock domain this driver counts in.
    fn clock(&self) -> ClockMode;

    /// Requests an interrupt every `interval`, replacing any previous schedule.
    fn arm(&self, interval: Duration) -> io::Result<()>;

    /// Cancels all future interrupts.
    fn disarm(&self) -> io::Result<()>;
}

/// The POSIX interval timer of one [`ClockMode`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ITimer {
    mode: ClockMode,
}

impl ITimer {
    /// The interval timer for `mode`.
    pub fn new(mode: ClockMode) -> Self {
        ITimer { mode }
    }

    fn set(&self, value: libc::timeval) -> io::Result<()> {
        let spec = libc::itimerval {
            it_interval: value,
            it_value: value,
        };
        // SAFETY: `spec` is a valid itimerval and the old value is not requested.
        let ret = unsafe { libc::setitimer(self.mode.which(), &spec, ptr::null_mut()) };
        if ret == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

fn timeval(interval: Duration) -> libc::timeval {
    // a zero timeval disarms the timer, so round sub-microsecond intervals up
    let interval = interval.max(Duration::from_micros(1));
    libc::timeval {
        tv_sec: interval.as_secs() as libc::time_t,
        tv_usec: interval.subsec_micros() as libc::suseconds_t,
    }
}

impl TimerDriver for ITimer {
    fn clock(&self) -> ClockMode {
        self.mode
    }

    fn arm(&self, interval: Duration) -> io::Result<()> {
        self.set(timeval(interval))
    }

    fn disarm(&self) -> io::Result<()> {
        self.set(libc::timeval {
            tv_sec: 0,
            tv_usec: 0,
        })
    }
}

/// Something that wants to run on every timer interrupt.
pub(crate) trait Tick: Send + Sync {
    fn tick(&self);
}

type Target = Arc<dyn Tick>;

// Where the signal handler of one clock mode finds its target. `inflight` counts handlers that
// may still hold the target pointer, so the route can wait for them before freeing it.
struct RouteSlot {
    claimed: AtomicBool,
    target: AtomicPtr<Target>,
    inflight: AtomicUsize,
}

impl RouteSlot {
    const fn new() -> Self {
        RouteSlot {
            claimed: AtomicBool::new(false),
            target: AtomicPtr::new(ptr::null_mut()),
            inflight: AtomicUsize::new(0),
        }
    }
}

static ROUTES: [RouteSlot; 3] = [RouteSlot::new(), RouteSlot::new(), RouteSlot::new()];

extern "C" fn on_signal(signal: libc::c_int, _: *mut libc::siginfo_t, _: *mut libc::c_void) {
    let Some(mode) = ClockMode::from_signal(signal) else {
        return;
    };
    let slot = &ROUTES[mode.index()];
    slot.inflight.fetch_add(1, Ordering::SeqCst);
    let target = slot.target.load(Ordering::SeqCst);
    // SAFETY: the route does not free the target while `inflight` is non-zero.
    if let Some(target) = unsafe { target.as_ref() } {
        target.tick();
    }
    slot.inflight.fetch_sub(1, Ordering::SeqCst);
}

/// Process-wide routing of one clock mode's signal to a tick target.
///
/// At most one route exists per clock mode. Dropping the route restores the signal action that
/// was installed before it.
pub(crate) struct Route {
    mode: ClockMode,
    previous: libc::sigaction,
}

impl Route {
    pub(crate) fn install(mode: ClockMode, target: Target) -> Result<Self, Error> {
        let slot = &ROUTES[mode.index()];
        if slot
            .claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::ModeInUse(mode));
        }
        let target = Box::into_raw(Box::new(target));
        slot.target.store(target, Ordering::SeqCst);

        // SAFETY: zeroed is a valid bit pattern for sigaction, and every pointer handed to
        // libc below points at a live local.
        let installed = unsafe {
            let mut action: libc::sigaction = mem::zeroed();
            action.sa_sigaction = on_signal as *const () as usize;
            action.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART;
            libc::sigemptyset(&mut action.sa_mask);
            libc::sigaddset(&mut action.sa_mask, mode.signal());

            let mut previous: libc::sigaction = mem::zeroed();
            if libc::sigaction(mode.signal(), &action, &mut previous) == 0 {
                Ok(previous)
            } else {
                Err(io::Error::last_os_error())
            }
        };

        match installed {
            Ok(previous) => {
                debug!("installed {} signal handler", mode);
                Ok(Route { mode, previous })
            }
            Err(e) => {
                release(slot);
                Err(e.into())
            }
        }
    }
}

// Clears the slot's target, waits out any handler still using it, then frees it.
fn release(slot: &RouteSlot) {
    let target = slot.target.swap(ptr::null_mut(), Ordering::SeqCst);
    while slot.inflight.load(Ordering::SeqCst) != 0 {
        std::hint::spin_loop();
    }
    if !target.is_null() {
        // SAFETY: the pointer came from Box::into_raw in `install` and no handler holds it.
        drop(unsafe { Box::from_raw(target) });
    }
    slot.claimed.store(false, Ordering::Release);
}

impl Drop for Route {
    fn drop(&mut self) {
        // SAFETY: `previous` was filled in by sigaction when the route was installed.
        let ret = unsafe { libc::sigaction(self.mode.signal(), &self.previous, ptr::null_mut()) };
        if ret != 0 {
            warn!(
                "failed to restore {} signal handler: {}",
                self.mode,
                io::Error::last_os_error()
            );
        }
        release(&ROUTES[self.mode.index()]);
        debug!("removed {} signal handler", self.mode);
    }
}
