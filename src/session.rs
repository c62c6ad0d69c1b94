use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::MutexGuard;
use std::thread;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Local};

use crate::collector::{ClockMode, Collector, SampleStore, Stats};
use crate::error::Error;
use crate::format::Format;
use crate::walker::FrameRegistry;

/// Everything a profiling session is configured with.
#[derive(Clone, Debug, PartialEq)]
pub struct Options {
    /// The clock driving the sampling interval. Default is [`ClockMode::Prof`].
    pub mode: ClockMode,

    /// Time between samples on `mode`'s clock. Default is 10ms.
    pub interval: Duration,

    /// How long to keep sampling before stopping on its own. Default is one hour.
    pub duration: Duration,

    /// The output encoding. Default is a 50-stack table.
    pub format: Format,

    /// Folder the profile is saved in. Default is `profiles`.
    pub output_folder: PathBuf,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            mode: ClockMode::default(),
            interval: Duration::from_millis(10),
            duration: Duration::from_secs(3600),
            format: Format::default(),
            output_folder: PathBuf::from("profiles"),
        }
    }
}

impl Options {
    /// Rejects configurations that could never sample.
    pub fn validate(&self) -> Result<(), Error> {
        if self.interval.is_zero() {
            return Err(Error::Config(String::from("interval must be positive")));
        }
        if self.duration.is_zero() {
            return Err(Error::Config(String::from("duration must be positive")));
        }
        if let Format::Table { max_stacks: 0 } = self.format {
            return Err(Error::Config(String::from("max stacks must be at least 1")));
        }
        Ok(())
    }
}

/// Converts a number of seconds given on the command line into a [`Duration`].
///
/// `what` names the setting in the error message.
pub fn parse_seconds(seconds: f64, what: &str) -> Result<Duration, Error> {
    if !(seconds.is_finite() && seconds > 0.0) {
        return Err(Error::Config(format!(
            "{} must be a positive number of seconds, got {}",
            what, seconds
        )));
    }
    Duration::try_from_secs_f64(seconds)
        .map_err(|e| Error::Config(format!("{} of {} seconds: {}", what, seconds, e)))
}

/// Formats `time` in local time as `YYYYMMDD-HHMM-SS`.
pub fn timestamp(time: SystemTime) -> String {
    DateTime::<Local>::from(time)
        .format("%Y%m%d-%H%M-%S")
        .to_string()
}

/// The path a profile of `target` is saved to: `{folder}/{target basename}-{stamp}.{extension}`.
pub fn output_path<P>(folder: P, target: &str, format: Format, stamp: &str) -> PathBuf
where
    P: AsRef<Path>,
{
    let name = Path::new(target)
        .file_name()
        .map(|name| name.to_string_lossy())
        .unwrap_or_else(|| target.into());
    folder
        .as_ref()
        .join(format!("{}-{}.{}", name, stamp, format.extension()))
}

/// How often [`Session::run`] moves captured stacks out of the collector's capture buffer.
pub const DRAIN_PERIOD: Duration = Duration::from_millis(10);

/// A collector on the global [`FrameRegistry`], configured from [`Options`].
///
/// The session owns the samples after a run, so a failed [`save`](Session::save) can be retried
/// with a different path.
pub struct Session {
    options: Options,
    collector: Collector<&'static FrameRegistry>,
}

// Marks the workload as finished even if it unwinds, so the drain thread always exits.
struct Finished<'a>(&'a AtomicBool);

impl Drop for Finished<'_> {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Release);
    }
}

impl Session {
    /// Validates `options` and installs the collector's timer signal handler.
    pub fn new(options: Options) -> Result<Self, Error> {
        options.validate()?;
        let collector = Collector::new(options.mode, options.interval, FrameRegistry::global())?;
        Ok(Session { options, collector })
    }

    /// Samples while `workload` runs, returning its exit code.
    ///
    /// Sampling stops when the workload returns or the configured duration elapses, whichever
    /// comes first. A helper thread drains the collector every [`DRAIN_PERIOD`] in the
    /// meantime, so the capture buffer only has to hold one period's worth of stacks.
    pub fn run<F>(&mut self, workload: F) -> Result<i32, Error>
    where
        F: FnOnce() -> i32,
    {
        self.collector.start(self.options.duration)?;
        debug!(
            "sampling every {:?} of {} time",
            self.options.interval, self.options.mode
        );

        let collector = &self.collector;
        let finished = AtomicBool::new(false);
        let exit_code = thread::scope(|s| {
            s.spawn(|| {
                while !finished.load(Ordering::Acquire) && !collector.stats().stopped {
                    thread::sleep(DRAIN_PERIOD);
                    collector.drain();
                }
            });
            let _finished = Finished(&finished);
            workload()
        });

        if let Err(e) = self.collector.stop() {
            warn!("{}; samples taken before the failure are kept", e);
            return Err(e);
        }
        let stats = self.collector.stats();
        debug!("sampling stopped after {} samples", stats.samples_taken);
        if stats.samples_dropped > 0 {
            warn!(
                "{} samples were dropped because the capture buffer was full",
                stats.samples_dropped
            );
        }
        Ok(exit_code)
    }

    /// Renders the samples in the configured format to `path`.
    pub fn save<P>(&self, path: P) -> Result<(), Error>
    where
        P: AsRef<Path>,
    {
        let samples = self.collector.samples()?;
        self.options.format.save(&*samples, path)
    }

    /// The captured stacks.
    pub fn samples(&self) -> Result<MutexGuard<'_, SampleStore>, Error> {
        self.collector.samples()
    }

    /// The collector's counters.
    pub fn stats(&self) -> Stats {
        self.collector.stats()
    }

    /// The options this session was created with.
    pub fn options(&self) -> &Options {
        &self.options
    }
}

/// What a [`profile`] run produced.
#[derive(Debug)]
pub struct Outcome {
    /// The exit code the workload asked for.
    pub exit_code: i32,
    /// Where the profile was saved, or `None` if no samples were collected.
    pub saved: Option<PathBuf>,
    /// The collector's final counters.
    pub stats: Stats,
}

/// Profiles `workload` and saves the result under `options.output_folder`.
///
/// The file is named after `target` (see [`output_path`]) and only written when at least one
/// sample was taken. Status is reported through the `log` facade.
pub fn profile<F>(options: &Options, target: &str, workload: F) -> Result<Outcome, Error>
where
    F: FnOnce() -> i32,
{
    options.validate()?;

    let folder = &options.output_folder;
    if !folder.exists() {
        info!("Creating output folder: {}", folder.display());
        fs::create_dir_all(folder)?;
    }
    let path = output_path(folder, target, options.format, &timestamp(SystemTime::now()));

    let mut session = Session::new(options.clone())?;
    let exit_code = session.run(workload)?;
    let stats = session.stats();

    let saved = if stats.samples_taken > 0 {
        session.save(&path)?;
        info!("profile output saved to {}", path.display());
        if let (Some(per_sample), Some(ratio)) =
            (stats.overhead_per_sample(), stats.overhead_ratio())
        {
            info!(
                "overhead was {:?} per sample ({:.2}%)",
                per_sample,
                ratio * 100.0
            );
        }
        Some(path)
    } else {
        info!("no samples collected; program was too fast");
        None
    };

    Ok(Outcome {
        exit_code,
        saved,
        stats,
    })
}
