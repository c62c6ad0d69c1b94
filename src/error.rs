use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::collector::timer::ClockMode;

/// Errors surfaced by the collector and the session glue around it.
#[derive(Debug, Error)]
pub enum Error {
    /// The configuration was rejected before any sampling began.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// `start` was called on a collector that is still sampling.
    #[error("collector is already running")]
    AlreadyRunning,

    /// The operation requires a collector that is not sampling.
    #[error("collector is running")]
    Running,

    /// Another collector already drives the timer of this clock mode.
    #[error("the {0} clock is already driven by another collector")]
    ModeInUse(ClockMode),

    /// Walking a thread's frames failed inside the interrupt handler, which aborted the session.
    #[error("sampling aborted: {0}")]
    Sampling(#[from] WalkError),

    /// Writing the rendered profile failed. The collected samples are still in memory.
    #[error("failed to write profile to {}: {source}", path.display())]
    Write {
        /// Where the profile was being written.
        path: PathBuf,
        /// The underlying failure.
        source: io::Error,
    },

    /// Any other I/O failure (timer syscalls, signal installation, folder creation).
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A frame chain could not be read.
///
/// Created inside the interrupt handler, so it carries only static data.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WalkError {
    reason: &'static str,
    depth: usize,
}

impl WalkError {
    /// Creates an error for the frame at `depth` (0 is the outermost frame).
    pub const fn new(reason: &'static str, depth: usize) -> Self {
        WalkError { reason, depth }
    }

    /// Why the walk failed.
    pub fn reason(&self) -> &'static str {
        self.reason
    }

    /// The frame depth at which the walk failed.
    pub fn depth(&self) -> usize {
        self.depth
    }
}

impl fmt::Display for WalkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at frame depth {}", self.reason, self.depth)
    }
}

impl std::error::Error for WalkError {}
