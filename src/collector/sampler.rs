use std::cell::UnsafeCell;
use std::mem;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crossbeam_utils::Backoff;

use super::timer::{ClockMode, Tick, TimerDriver};
use crate::error::WalkError;
use crate::stack::{Frame, Stack};
use crate::walker::{FrameSink, StackWalker};

/// Every stack captured by a collector, in capture order.
///
/// Stacks from the same tick are adjacent; their relative order is unspecified.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SampleStore {
    stacks: Vec<Stack>,
}

impl SampleStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// The captured stacks.
    pub fn stacks(&self) -> &[Stack] {
        &self.stacks
    }

    fn push(&mut self, stack: Stack) {
        self.stacks.push(stack);
    }

    pub(crate) fn clear(&mut self) {
        self.stacks.clear();
    }
}

impl Deref for SampleStore {
    type Target = [Stack];

    fn deref(&self) -> &Self::Target {
        &self.stacks
    }
}

impl<'a> IntoIterator for &'a SampleStore {
    type Item = &'a Stack;
    type IntoIter = std::slice::Iter<'a, Stack>;

    fn into_iter(self) -> Self::IntoIter {
        self.stacks.iter()
    }
}

impl From<Vec<Stack>> for SampleStore {
    fn from(stacks: Vec<Stack>) -> Self {
        SampleStore { stacks }
    }
}

impl FromIterator<Stack> for SampleStore {
    fn from_iter<I: IntoIterator<Item = Stack>>(iter: I) -> Self {
        SampleStore {
            stacks: iter.into_iter().collect(),
        }
    }
}

/// A snapshot of a collector's counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Stats {
    /// The clock driving the sampling interval.
    pub mode: ClockMode,
    /// Time between ticks, measured on `mode`'s clock.
    pub interval: Duration,
    /// Ticks left before the collector stops on its own. Frozen once the collector stops.
    pub samples_remaining: i64,
    /// Ticks that captured stacks.
    pub samples_taken: u64,
    /// Ticks whose stacks did not fit in the capture buffer and were thrown away.
    pub samples_dropped: u64,
    /// Whether a stop has been requested.
    pub stopping: bool,
    /// Whether the timer has been disarmed for good.
    pub stopped: bool,
    /// Wall-clock time spent capturing stacks.
    pub overhead: Duration,
}

impl Stats {
    /// The average time one sampling tick took, if any were taken.
    pub fn overhead_per_sample(&self) -> Option<Duration> {
        let taken = u32::try_from(self.samples_taken).ok()?;
        if taken == 0 {
            return None;
        }
        Some(self.overhead / taken)
    }

    /// The average tick cost as a fraction of the interval.
    pub fn overhead_ratio(&self) -> Option<f64> {
        let per_sample = self.overhead_per_sample()?;
        Some(per_sample.as_secs_f64() / self.interval.as_secs_f64())
    }
}

// Frames captured by the interrupt handler and not yet moved into the store. Both vectors are
// allocated up front and never grow: the handler only writes within their capacity.
#[derive(Debug)]
pub(crate) struct CaptureBuffer {
    frames: Vec<Frame>,
    // end offset in `frames` of every captured stack
    ends: Vec<usize>,
}

impl CaptureBuffer {
    pub(crate) fn with_capacity(frames: usize) -> Self {
        CaptureBuffer {
            frames: Vec::with_capacity(frames),
            // every stack has at least one frame
            ends: Vec::with_capacity(frames),
        }
    }

    fn mark(&self) -> (usize, usize) {
        (self.frames.len(), self.ends.len())
    }

    fn rewind(&mut self, (frames, ends): (usize, usize)) {
        self.frames.truncate(frames);
        self.ends.truncate(ends);
    }

    fn clear(&mut self) {
        self.rewind((0, 0));
    }

    // Moves every captured stack into `store`, keeping the allocations for reuse.
    fn drain_into(&mut self, store: &mut SampleStore) {
        let mut frames = self.frames.drain(..);
        let mut start = 0;
        for &end in &self.ends {
            store.push(frames.by_ref().take(end - start).collect());
            start = end;
        }
        drop(frames);
        self.ends.clear();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The state the interrupt handler shares with the collector.
///
/// The counters are atomics. The capture buffer and the failure slot are only touched by
/// whoever holds `busy`: the handler while a tick runs, or the collector while it swaps the
/// buffer out or knows no tick can run (before arming, after `stopped`). The handler never
/// allocates and never locks; turning captured frames into [`Stack`]s happens in
/// [`drain`](Sampler::drain), outside the handler.
pub(crate) struct Sampler<W, T> {
    walker: W,
    timer: T,
    interval: Duration,
    samples_remaining: AtomicI64,
    samples_taken: AtomicU64,
    samples_dropped: AtomicU64,
    overhead_nanos: AtomicU64,
    stopping: AtomicBool,
    stopped: AtomicBool,
    busy: AtomicBool,
    buffer: UnsafeCell<CaptureBuffer>,
    failure: UnsafeCell<Option<WalkError>>,
    // an empty buffer of the same capacity, swapped in by `drain`; its lock serializes drains
    spare: Mutex<CaptureBuffer>,
    store: Mutex<SampleStore>,
}

// SAFETY: the cells are only accessed under the `busy` protocol described above.
unsafe impl<W: Sync, T: Sync> Sync for Sampler<W, T> {}

impl<W, T> Sampler<W, T>
where
    W: StackWalker,
    T: TimerDriver,
{
    pub(crate) fn new(walker: W, timer: T, interval: Duration, capacity: usize) -> Self {
        Sampler {
            walker,
            timer,
            interval,
            samples_remaining: AtomicI64::new(0),
            samples_taken: AtomicU64::new(0),
            samples_dropped: AtomicU64::new(0),
            overhead_nanos: AtomicU64::new(0),
            stopping: AtomicBool::new(false),
            // nothing is armed yet
            stopped: AtomicBool::new(true),
            busy: AtomicBool::new(false),
            buffer: UnsafeCell::new(CaptureBuffer::with_capacity(capacity)),
            failure: UnsafeCell::new(None),
            spare: Mutex::new(CaptureBuffer::with_capacity(capacity)),
            store: Mutex::new(SampleStore::new()),
        }
    }

    pub(crate) fn timer(&self) -> &T {
        &self.timer
    }

    pub(crate) fn interval(&self) -> Duration {
        self.interval
    }

    /// The number of frames the capture buffer holds between two drains.
    pub(crate) fn capacity(&self) -> usize {
        lock(&self.spare).frames.capacity()
    }

    /// Replaces both capture buffers. Must only be called while stopped.
    pub(crate) fn set_capacity(&self, capacity: usize) {
        self.drain();
        let mut spare = lock(&self.spare);
        *spare = CaptureBuffer::with_capacity(capacity);
        // SAFETY: stopped, so no tick touches the buffer.
        unsafe { *self.buffer.get() = CaptureBuffer::with_capacity(capacity) };
    }

    /// Prepares a new run of `budget` ticks. Must only be called while stopped.
    pub(crate) fn prime(&self, budget: i64) {
        // SAFETY: stopped, so no tick touches the failure slot.
        unsafe { *self.failure.get() = None };
        self.samples_remaining.store(budget, Ordering::Release);
        self.stopping.store(false, Ordering::Release);
        self.stopped.store(false, Ordering::Release);
    }

    /// Clears the store and every counter. Must only be called while stopped.
    pub(crate) fn reset(&self) {
        let _spare = lock(&self.spare);
        // SAFETY: stopped, so no tick touches the cells.
        unsafe {
            (*self.buffer.get()).clear();
            *self.failure.get() = None;
        }
        lock(&self.store).clear();
        self.samples_remaining.store(0, Ordering::Release);
        self.samples_taken.store(0, Ordering::Release);
        self.samples_dropped.store(0, Ordering::Release);
        self.overhead_nanos.store(0, Ordering::Release);
        self.stopping.store(false, Ordering::Release);
    }

    pub(crate) fn request_stop(&self) {
        self.stopping.store(true, Ordering::Release);
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Marks the run as over without a terminal tick, e.g. when arming failed.
    pub(crate) fn abandon(&self) {
        self.samples_remaining.store(0, Ordering::Release);
        self.stopped.store(true, Ordering::Release);
    }

    /// Moves the stacks captured so far into the store. Safe to call at any time.
    ///
    /// The filled capture buffer is swapped for the empty spare while holding `busy`, which
    /// only takes a pointer swap; a tick arriving in that window is dropped like any other
    /// reentrant tick.
    pub(crate) fn drain(&self) {
        let mut spare = lock(&self.spare);
        let backoff = Backoff::new();
        while self
            .busy
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            backoff.snooze();
        }
        // SAFETY: we hold `busy`.
        unsafe { mem::swap(&mut *self.buffer.get(), &mut *spare) };
        self.busy.store(false, Ordering::Release);

        spare.drain_into(&mut lock(&self.store));
    }

    /// The captured stacks that have been drained so far.
    pub(crate) fn store(&self) -> MutexGuard<'_, SampleStore> {
        lock(&self.store)
    }

    /// The walk failure that ended the last run, if any. Must only be called while stopped.
    pub(crate) fn failure(&self) -> Option<WalkError> {
        // SAFETY: stopped, so the handler no longer writes the slot.
        unsafe { *self.failure.get() }
    }

    pub(crate) fn stats(&self) -> Stats {
        Stats {
            mode: self.timer.clock(),
            interval: self.interval,
            samples_remaining: self.samples_remaining.load(Ordering::Acquire),
            samples_taken: self.samples_taken.load(Ordering::Acquire),
            samples_dropped: self.samples_dropped.load(Ordering::Acquire),
            stopping: self.stopping.load(Ordering::Acquire),
            stopped: self.stopped.load(Ordering::Acquire),
            overhead: Duration::from_nanos(self.overhead_nanos.load(Ordering::Acquire)),
        }
    }

    /// One timer interrupt.
    ///
    /// Decrements the budget; on the tick that exhausts it, or the first tick after a stop was
    /// requested, disarms the timer and marks the run stopped without capturing anything.
    /// Otherwise captures one stack per live thread into the capture buffer. A tick that does
    /// not fit is dropped whole.
    pub(crate) fn sample(&self) {
        if self
            .busy
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            // another thread is inside a tick, or the buffer is being swapped out
            return;
        }

        if !self.stopped.load(Ordering::Acquire) {
            let remaining = self.samples_remaining.fetch_sub(1, Ordering::AcqRel) - 1;
            if remaining <= 0 || self.stopping.load(Ordering::Acquire) {
                self.finish();
            } else {
                let start = Instant::now();
                // SAFETY: we hold `busy`.
                let buffer = unsafe { &mut *self.buffer.get() };
                match self.capture(buffer) {
                    Ok(true) => {
                        let spent = start.elapsed().as_nanos() as u64;
                        self.overhead_nanos.fetch_add(spent, Ordering::AcqRel);
                        self.samples_taken.fetch_add(1, Ordering::AcqRel);
                    }
                    Ok(false) => {
                        self.samples_dropped.fetch_add(1, Ordering::AcqRel);
                    }
                    Err(e) => {
                        // SAFETY: we hold `busy`.
                        unsafe { *self.failure.get() = Some(e) };
                        self.finish();
                    }
                }
            }
        }

        self.busy.store(false, Ordering::Release);
    }

    fn finish(&self) {
        // Nothing useful can be done with a failed disarm from inside the handler; the flag
        // below still keeps later ticks from sampling.
        let _ = self.timer.disarm();
        self.stopped.store(true, Ordering::Release);
    }

    // Captures one tick into `buffer`. Returns false if it did not fit, in which case the
    // buffer is left as it was, as it is after a failed walk.
    fn capture(&self, buffer: &mut CaptureBuffer) -> Result<bool, WalkError> {
        let mark = buffer.mark();
        let current = self.walker.current_thread();
        let mut outcome = Ok(true);
        self.walker.for_each_thread(&mut |thread| {
            if outcome != Ok(true) {
                return;
            }
            let start = buffer.frames.len();
            let mut sink = FrameSink::new(&mut buffer.frames);
            let walked = self.walker.walk(thread, Some(thread) == current, &mut sink);
            let overflowed = sink.overflowed();
            match walked {
                Err(e) => outcome = Err(e),
                Ok(()) if overflowed => outcome = Ok(false),
                // threads without frames contribute no stack
                Ok(()) if buffer.frames.len() == start => {}
                Ok(()) if buffer.ends.len() == buffer.ends.capacity() => outcome = Ok(false),
                Ok(()) => buffer.ends.push(buffer.frames.len()),
            }
        });
        if outcome != Ok(true) {
            buffer.rewind(mark);
        }
        outcome
    }
}

impl<W, T> Tick for Sampler<W, T>
where
    W: StackWalker,
    T: TimerDriver,
{
    fn tick(&self) {
        self.sample();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overhead_is_averaged_over_samples() {
        let stats = Stats {
            mode: ClockMode::Prof,
            interval: Duration::from_millis(10),
            samples_remaining: 0,
            samples_taken: 4,
            samples_dropped: 0,
            stopping: false,
            stopped: true,
            overhead: Duration::from_millis(2),
        };
        assert_eq!(
            stats.overhead_per_sample(),
            Some(Duration::from_micros(500))
        );
        let ratio = stats.overhead_ratio().unwrap();
        assert!((ratio - 0.05).abs() < 1e-9, "ratio was {}", ratio);
    }

    #[test]
    fn no_overhead_without_samples() {
        let stats = Stats {
            mode: ClockMode::Real,
            interval: Duration::from_millis(10),
            samples_remaining: 10,
            samples_taken: 0,
            samples_dropped: 0,
            stopping: false,
            stopped: true,
            overhead: Duration::ZERO,
        };
        assert_eq!(stats.overhead_per_sample(), None);
        assert_eq!(stats.overhead_ratio(), None);
    }

    #[test]
    fn store_iterates_in_capture_order() {
        let a: Stack = vec![Frame::new("a.rs", 1, "a")].into();
        let b: Stack = vec![Frame::new("b.rs", 2, "b")].into();
        let store: SampleStore = vec![a.clone(), b.clone(), a.clone()].into();
        let seen: Vec<_> = store.into_iter().collect();
        assert_eq!(seen, vec![&a, &b, &a]);
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn drained_buffer_splits_stacks_at_their_ends() {
        let mut buffer = CaptureBuffer::with_capacity(8);
        buffer.frames.extend([
            Frame::new("a.rs", 1, "leaf"),
            Frame::new("a.rs", 2, "main"),
            Frame::new("b.rs", 3, "main"),
        ]);
        buffer.ends.extend([2, 3]);

        let mut store = SampleStore::new();
        buffer.drain_into(&mut store);
        assert_eq!(
            store.stacks(),
            &[
                Stack::from(vec![
                    Frame::new("a.rs", 1, "leaf"),
                    Frame::new("a.rs", 2, "main"),
                ]),
                Stack::from(vec![Frame::new("b.rs", 3, "main")]),
            ]
        );
        assert_eq!(buffer.mark(), (0, 0));
        assert_eq!(buffer.frames.capacity(), 8);
    }
}
