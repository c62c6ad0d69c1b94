use std::fs;
use std::hint::black_box;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use log::Level;
use plop::collector::ClockMode;
use plop::format::Format;
use plop::session::{self, Options, Session};
use plop::Error;
use pretty_assertions::assert_eq;

static SIGNALS: Mutex<()> = Mutex::new(());

fn serialize() -> MutexGuard<'static, ()> {
    match SIGNALS.lock() {
        Ok(guard) => guard,
        Err(e) => e.into_inner(),
    }
}

fn temp_folder() -> PathBuf {
    let rand: u64 = rand::random();
    std::env::temp_dir().join(format!("plop-test-{}", rand))
}

fn workload(length: Duration) -> i32 {
    plop::scope!("session_workload");
    let start = Instant::now();
    let mut acc = 1u64;
    while start.elapsed() < length {
        acc = black_box(acc.wrapping_mul(6364136223846793005).wrapping_add(1));
    }
    0
}

fn folded_total(path: &PathBuf) -> u64 {
    fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(|line| {
            let (_, count) = line.rsplit_once(' ').unwrap();
            count.parse::<u64>().unwrap()
        })
        .sum()
}

#[test]
fn fast_program_collects_nothing() {
    let _guard = serialize();
    testing_logger::setup();

    let folder = temp_folder();
    let options = Options {
        interval: Duration::from_millis(100),
        duration: Duration::from_secs(1),
        output_folder: folder.clone(),
        ..Default::default()
    };
    let outcome = session::profile(&options, "quick", || 7).unwrap();

    assert_eq!(outcome.exit_code, 7);
    assert_eq!(outcome.saved, None);
    assert_eq!(outcome.stats.samples_taken, 0);
    assert!(outcome.stats.stopped);
    assert_eq!(fs::read_dir(&folder).unwrap().count(), 0);

    testing_logger::validate(|logs| {
        let info: Vec<&str> = logs
            .iter()
            .filter(|log| log.level == Level::Info)
            .map(|log| log.body.as_str())
            .collect();
        assert_eq!(
            info,
            vec![
                format!("Creating output folder: {}", folder.display()).as_str(),
                "no samples collected; program was too fast",
            ]
        );
    });

    fs::remove_dir_all(&folder).unwrap();
}

#[test]
fn saves_a_flame_file_named_after_the_target() {
    let _guard = serialize();
    testing_logger::setup();

    let folder = temp_folder();
    let options = Options {
        mode: ClockMode::Real,
        interval: Duration::from_millis(2),
        format: Format::Folded,
        output_folder: folder.clone(),
        ..Default::default()
    };
    let outcome = session::profile(&options, "bin/worker", || {
        workload(Duration::from_millis(200))
    })
    .unwrap();

    assert_eq!(outcome.exit_code, 0);
    assert!(outcome.stats.samples_taken > 0);
    let path = outcome.saved.unwrap();
    assert_eq!(path.parent(), Some(folder.as_path()));
    let name = path.file_name().unwrap().to_string_lossy().into_owned();
    assert!(name.starts_with("worker-"), "{}", name);
    assert!(name.ends_with(".flame"), "{}", name);

    // the only thread with frames is this one, so one stack per tick
    assert_eq!(folded_total(&path), outcome.stats.samples_taken);
    let contents = fs::read_to_string(&path).unwrap();
    assert!(contents.contains("session_workload (tests/session.rs:"));

    testing_logger::validate(|logs| {
        let info: Vec<&str> = logs
            .iter()
            .filter(|log| log.level == Level::Info)
            .map(|log| log.body.as_str())
            .collect();
        assert_eq!(info.len(), 3, "{:?}", info);
        assert_eq!(
            info[1],
            format!("profile output saved to {}", path.display())
        );
        assert!(info[2].starts_with("overhead was "), "{}", info[2]);
    });

    fs::remove_dir_all(&folder).unwrap();
}

#[test]
fn table_keeps_the_most_frequent_stacks() {
    let _guard = serialize();

    let folder = temp_folder();
    let options = Options {
        mode: ClockMode::Prof,
        interval: Duration::from_millis(2),
        format: Format::Table { max_stacks: 1 },
        output_folder: folder.clone(),
        ..Default::default()
    };
    let outcome = session::profile(&options, "table", || {
        workload(Duration::from_millis(200))
    })
    .unwrap();
    let path = outcome.saved.unwrap();
    assert_eq!(path.extension().unwrap(), "plop");

    let table: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
    let entries = table.as_array().unwrap();
    assert_eq!(entries.len(), 1);
    let count = entries[0]["count"].as_u64().unwrap();
    assert!(count > 0 && count <= outcome.stats.samples_taken);
    let leaf = &entries[0]["stack"][0];
    assert_eq!(leaf[0], "tests/session.rs");
    assert_eq!(leaf[2], "session_workload");

    fs::remove_dir_all(&folder).unwrap();
}

#[test]
fn session_saves_every_captured_stack() {
    let _guard = serialize();

    let folder = temp_folder();
    fs::create_dir_all(&folder).unwrap();
    let options = Options {
        mode: ClockMode::Real,
        interval: Duration::from_millis(2),
        format: Format::Folded,
        output_folder: folder.clone(),
        ..Default::default()
    };
    let mut session = Session::new(options).unwrap();
    assert_eq!(session.options().mode, ClockMode::Real);
    let exit_code = session
        .run(|| {
            workload(Duration::from_millis(100));
            3
        })
        .unwrap();
    assert_eq!(exit_code, 3);

    let path = folder.join("profile.flame");
    session.save(&path).unwrap();
    assert_eq!(
        folded_total(&path),
        session.samples().unwrap().len() as u64
    );

    // saving again overwrites
    session.save(&path).unwrap();
    assert_eq!(fs::read_dir(&folder).unwrap().count(), 1);

    let missing = folder.join("missing").join("profile.flame");
    match session.save(&missing) {
        Err(Error::Write { path, .. }) => assert_eq!(path, missing),
        other => panic!("expected a write error, got {:?}", other),
    }

    fs::remove_dir_all(&folder).unwrap();
}

#[test]
fn unknown_settings_are_config_errors() {
    assert!(matches!(
        "turbo".parse::<ClockMode>(),
        Err(Error::Config(_))
    ));
    assert!(matches!("svg".parse::<Format>(), Err(Error::Config(_))));
    assert!(matches!(
        session::parse_seconds(-0.5, "duration"),
        Err(Error::Config(_))
    ));

    let options = Options {
        interval: Duration::ZERO,
        output_folder: temp_folder(),
        ..Default::default()
    };
    assert!(matches!(
        session::profile(&options, "never", || 0),
        Err(Error::Config(_))
    ));
    // validation happens before anything touches the disk
    assert!(!options.output_folder.exists());
}
