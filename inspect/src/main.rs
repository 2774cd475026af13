use std::error::Error;
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use log::{info, warn};
use signal_hook::consts::{SIGINT, SIGTERM};

use srshm::core::layout::HeaderKind;
use srshm::core::ShmSegment;
use srshm::evpipe::EventPipe;
use srshm::reader::{EventReader, EventSnapshot};
use srshm::{SrConfig, SrError};

#[derive(Parser)]
#[clap(about = "Inspect subscription segments and event pipes")]
struct Opts {
    #[clap(short = 'c', long = "config", default_value = "srshm.toml")]
    config: String,
    #[clap(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// List subscription segments with their current event.
    List,
    /// Create an event pipe and report every wakeup until interrupted.
    Watch { evpipe_num: u32 },
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    let opts: Opts = Opts::parse();
    let cfg = SrConfig::load(&opts.config)?;
    match opts.cmd {
        Cmd::List => list(&cfg),
        Cmd::Watch { evpipe_num } => watch(&cfg, evpipe_num),
    }
}

/// Header kind of a segment from its name, `None` for other files.
fn header_kind(name: &str) -> Option<HeaderKind> {
    let rest = name.strip_prefix("sr_")?;
    let mut parts = rest.rsplit('.');
    let last = parts.next()?;
    let suffix = if last.len() == 8 && last.chars().all(|c| c.is_ascii_hexdigit()) {
        parts.next()?
    } else {
        last
    };
    match suffix {
        "running" | "startup" | "operational" => Some(HeaderKind::Multi),
        "state" | "rpc" | "notif" => Some(HeaderKind::Single),
        _ => None,
    }
}

/// One listed segment: name, mapped size and its current event.
struct SegmentRow {
    name: String,
    size: usize,
    snap: EventSnapshot,
}

/// Reads the segment `name` as it is. `None` when it no longer exists; the
/// listing never creates or removes segments.
fn read_segment(cfg: &SrConfig, name: &str, kind: HeaderKind) -> Result<Option<SegmentRow>, SrError> {
    let mut shm = match ShmSegment::open_existing(&cfg.shm_dir.join(name))? {
        Some(shm) => shm,
        None => return Ok(None),
    };
    let size = shm.size();
    let snap = EventReader::new(&mut shm, kind, cfg).read(cfg.rwlock_read_timeout())?;
    Ok(Some(SegmentRow {
        name: name.to_string(),
        size,
        snap,
    }))
}

fn list(cfg: &SrConfig) -> Result<(), Box<dyn Error>> {
    let mut names: Vec<String> = fs::read_dir(&cfg.shm_dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|name| header_kind(name).is_some())
        .collect();
    names.sort();

    println!("{:<48} {:>8} {:>12} {:>10} {:>8}", "SEGMENT", "SIZE", "EVENT", "REQUEST", "PAYLOAD");
    for name in names {
        let kind = match header_kind(&name) {
            Some(kind) => kind,
            None => continue,
        };
        match read_segment(cfg, &name, kind) {
            Ok(Some(row)) => println!(
                "{:<48} {:>8} {:>12} {:>10} {:>8}",
                row.name,
                row.size,
                row.snap.event.as_str(),
                row.snap.request_id,
                row.snap.payload.len()
            ),
            // removed since the directory was read
            Ok(None) => continue,
            Err(e) => warn!("Failed to read \"{}\" ({}).", name, e),
        }
    }
    Ok(())
}

fn watch(cfg: &SrConfig, evpipe_num: u32) -> Result<(), Box<dyn Error>> {
    let term = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(SIGINT, Arc::clone(&term))?;
    signal_hook::flag::register(SIGTERM, Arc::clone(&term))?;

    let pipe = EventPipe::create(cfg, evpipe_num)?;
    info!("Watching \"{}\".", pipe.path().display());

    let start = Instant::now();
    let mut count = 0u64;
    while !term.load(Ordering::Relaxed) {
        if pipe.wait(Duration::from_millis(500))? {
            count += 1;
            println!("{:>10.3}s wakeup #{}", start.elapsed().as_secs_f64(), count);
        }
    }
    pipe.remove()?;
    println!("{} wakeups in {:#?}", count, start.elapsed());
    Ok(())
}
