use std::hint::black_box;
use std::path::PathBuf;
use std::process;
use std::thread;
use std::time::{Duration, Instant};

use clap::{ArgAction, Parser};
use env_logger::Env;
use plop::collector::ClockMode;
use plop::format::Format;
use plop::session::{self, Options};

#[derive(Debug, Parser)]
#[command(
    name = "plop",
    about = "Plop: Low-Overhead Profiler",
    after_help = "\
TARGETS:
    spin [MILLIS]               busy-loop on the calling thread (default 1000ms)
    threads [COUNT] [MILLIS]    busy-loop on COUNT threads (default 4 threads, 1000ms)
    sleep [MILLIS]              sleep, which only the real clock sees (default 1000ms)
    exit [CODE]                 return CODE immediately (default 0)"
)]
struct Opt {
    /// Output format [possible values: plop, flamegraph]
    #[arg(short = 'f', long = "format", default_value = "plop", value_name = "FORMAT")]
    format: Format,

    /// Interval timer mode to use, see `man 2 setitimer` [possible values: prof, real, virtual]
    #[arg(long = "mode", default_value = "prof", value_name = "MODE")]
    mode: ClockMode,

    /// Timer interval in seconds
    #[arg(long = "interval", default_value = "0.01", value_name = "SECONDS")]
    interval: f64,

    /// Profiling duration in seconds
    #[arg(long = "duration", default_value = "3600", value_name = "SECONDS")]
    duration: f64,

    /// Number of most frequent stacks to store. Ignored for flamegraph output.
    #[arg(long = "max-stacks", default_value = "50", value_name = "UINT")]
    max_stacks: usize,

    /// Folder where the profiles will be saved
    #[arg(long = "output-folder", default_value = "profiles", value_name = "PATH")]
    output_folder: PathBuf,

    /// Silence all log output
    #[arg(short = 'q', long = "quiet")]
    quiet: bool,

    /// Verbose logging mode (-v, -vv)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    verbose: u8,

    /// Demo target to profile
    #[arg(value_name = "TARGET")]
    target: String,

    /// Pass-through arguments for the target
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "ARGS")]
    arguments: Vec<String>,
}

impl Opt {
    fn options(&self) -> Result<Options, plop::Error> {
        Ok(Options {
            mode: self.mode,
            interval: session::parse_seconds(self.interval, "interval")?,
            duration: session::parse_seconds(self.duration, "duration")?,
            format: self.format.with_max_stacks(self.max_stacks),
            output_folder: self.output_folder.clone(),
        })
    }
}

#[derive(Debug)]
enum Target {
    Spin(Duration),
    Threads(usize, Duration),
    Sleep(Duration),
    Exit(i32),
}

fn arg<T>(args: &[String], i: usize, default: T) -> Result<T, String>
where
    T: std::str::FromStr,
{
    match args.get(i) {
        Some(arg) => arg
            .parse()
            .map_err(|_| format!("invalid target argument: {}", arg)),
        None => Ok(default),
    }
}

impl Target {
    fn parse(name: &str, args: &[String]) -> Result<Self, String> {
        match name {
            "spin" => Ok(Target::Spin(Duration::from_millis(arg(args, 0, 1000)?))),
            "threads" => Ok(Target::Threads(
                arg(args, 0, 4)?,
                Duration::from_millis(arg(args, 1, 1000)?),
            )),
            "sleep" => Ok(Target::Sleep(Duration::from_millis(arg(args, 0, 1000)?))),
            "exit" => Ok(Target::Exit(arg(args, 0, 0)?)),
            unknown => Err(format!("unknown target: {}", unknown)),
        }
    }

    fn run(self) -> i32 {
        plop::scope!("main");
        match self {
            Target::Spin(length) => {
                spin(length);
            }
            Target::Threads(count, length) => thread::scope(|s| {
                for _ in 0..count {
                    s.spawn(move || {
                        plop::scope!("worker");
                        spin(length)
                    });
                }
            }),
            Target::Sleep(length) => {
                plop::scope!("sleep");
                thread::sleep(length);
            }
            Target::Exit(code) => return code,
        }
        0
    }
}

fn spin(length: Duration) -> u64 {
    plop::scope!("spin");
    let start = Instant::now();
    let mut acc = 0u64;
    while start.elapsed() < length {
        acc = acc.wrapping_add(if acc % 3 == 0 { hash(acc) } else { sum(acc) });
    }
    acc
}

fn hash(seed: u64) -> u64 {
    plop::scope!("hash");
    (0..2_000u64).fold(seed, |h, i| black_box(h.rotate_left(5) ^ i).wrapping_mul(31))
}

fn sum(seed: u64) -> u64 {
    plop::scope!("sum");
    (0..1_000u64).fold(0u64, |acc, i| acc.wrapping_add(black_box(i ^ seed)))
}

fn main() {
    let opt = Opt::parse();

    // Initialize logger
    if !opt.quiet {
        env_logger::Builder::from_env(Env::default().default_filter_or(match opt.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }))
        .format_timestamp(None)
        .init();
    }

    let options = match opt.options() {
        Ok(options) => options,
        Err(e) => {
            eprintln!("plop: {}", e);
            process::exit(1);
        }
    };
    let target = match Target::parse(&opt.target, &opt.arguments) {
        Ok(target) => target,
        Err(e) => {
            eprintln!("plop: {}", e);
            process::exit(1);
        }
    };

    match session::profile(&options, &opt.target, || target.run()) {
        Ok(outcome) => process::exit(outcome.exit_code),
        Err(e) => {
            eprintln!("plop: {}", e);
            process::exit(1);
        }
    }
}
