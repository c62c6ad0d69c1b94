//! Plop is a low-overhead statistical profiler. It periodically interrupts the process it runs
//! in with an interval timer, captures the call stack of every live thread at that instant, and
//! keeps the stacks for later aggregation. Given enough samples, the stacks that show up most
//! often are where the program spends its time, and no function call has to be instrumented to
//! find out.
//!
//! # How it fits together
//!
//! A [`Collector`](collector::Collector) arms a POSIX interval timer on one of three clocks
//! ([`ClockMode`](collector::ClockMode)): wall-clock time, CPU time of the process, or
//! user-mode CPU time. Every time the timer fires, the signal handler asks a
//! [`StackWalker`](walker::StackWalker) for the frame chain of every thread and copies the
//! frames into a capture buffer reserved up front. The handler never takes a lock and never
//! allocates. A regular thread periodically drains the buffer into the collector's
//! [`SampleStore`](collector::SampleStore) as [`Stack`](stack::Stack)s.
//!
//! Once the collector has stopped, the store can be rendered by one of the
//! [`Format`](format::Format)s:
//!
//! - a table of the most frequent stacks and their counts (extension `plop`), or
//! - folded stack lines (extension `flame`) that flame graph tools such as
//!   [inferno](https://github.com/jonhoo/inferno) turn into an SVG.
//!
//! # Where the stacks come from
//!
//! Rust has no runtime that keeps a table of every thread's frames, so the walker is pluggable.
//! The built-in one is the [`FrameRegistry`](walker::FrameRegistry): runtimes that maintain
//! their own call stacks (interpreters, schedulers) publish frames into it, and ordinary code
//! can do the same with the [`scope!`] macro:
//!
//! ```no_run
//! fn crunch() -> u64 {
//!     plop::scope!("crunch");
//!     (0..1_000_000u64).sum()
//! }
//!
//! let options = plop::session::Options::default();
//! let outcome = plop::session::profile(&options, "crunch", || {
//!     crunch();
//!     0
//! })?;
//! println!("saved to {:?}", outcome.saved);
//! # Ok::<(), plop::Error>(())
//! ```
//!
//! # Command-line use
//!
//! The `plop` binary profiles a few built-in demo workloads and saves the result:
//!
//! ```console
//! $ plop --mode real --interval 0.005 -f flamegraph spin 500
//! $ cat profiles/spin-*.flame | inferno-flamegraph > spin.svg
//! ```

#![deny(missing_docs)]

#[macro_use]
extern crate log;

/// Grouping captured stacks and ranking them by frequency.
pub mod aggregate;

/// The sampling state machine, its interrupt handler, and the interval timers driving it.
pub mod collector;

/// Rendering captured stacks.
pub mod format;

/// Configuration, file naming, and the run-and-save flow around a collector.
pub mod session;

/// Frames and stacks.
pub mod stack;

/// Reading call stacks from inside the interrupt handler.
pub mod walker;

mod error;

pub use error::{Error, WalkError};

/// Publishes a frame named `$name` on the calling thread for the rest of the enclosing block.
///
/// The frame's source location is the macro's call site. Frames go to the
/// [global](walker::FrameRegistry::global) registry, which is what
/// [`Session`](session::Session) samples.
///
/// ```
/// fn parse(input: &str) -> usize {
///     plop::scope!("parse");
///     input.split_whitespace().count()
/// }
/// # assert_eq!(parse("a b"), 2);
/// ```
#[macro_export]
macro_rules! scope {
    ($name:expr) => {
        let _plop_scope = {
            static FRAME: $crate::walker::FrameInfo =
                $crate::walker::FrameInfo::new($name, file!(), line!());
            $crate::walker::enter(&FRAME)
        };
    };
}
