//! `racestats <chrooted-path>` or `racestats <glftpd-path> <site-path>`:
//! print one summary line for a release's racedata, or exit 1.
//!
//! Grounded on `racestats.c`'s `main`/`set_path`: one argument means the
//! process already lives inside the chroot and the argument is the release
//! path; two arguments mean chroot to the first before treating the second
//! as the release path.

use clap::{Arg, Command};
use racecore::{race, stats, RaceConfig};
use std::path::PathBuf;
use std::process::ExitCode;

fn cli() -> clap::ArgMatches {
    Command::new("racestats")
        .about("Print race statistics for a release's racedata journal")
        .arg(
            Arg::new("path")
                .help("<chrooted-path>, or <glftpd-path> <site-path>")
                .num_args(1..=2)
                .required(true),
        )
        .get_matches()
}

/// Resolve the release path to read, applying a real `chroot` for the
/// two-argument form. Requires root; callers outside a root context should
/// use the one-argument form instead.
fn set_path(args: &[&String]) -> Option<String> {
    let mut release_path = match args.len() {
        1 => args[0].clone(),
        2 => {
            chroot_to(args[0])?;
            args[1].clone()
        }
        _ => return None,
    };
    if release_path.ends_with('/') {
        release_path.pop();
    }
    std::env::set_current_dir(&release_path).ok()?;
    Some(release_path)
}

#[cfg(unix)]
fn chroot_to(path: &str) -> Option<()> {
    let c_path = std::ffi::CString::new(path).ok()?;
    // SAFETY: chroot() is called before any other thread is spawned in this
    // single-purpose binary, with a caller-controlled, non-empty path.
    let rc = unsafe { libc::chroot(c_path.as_ptr()) };
    if rc == 0 {
        Some(())
    } else {
        eprintln!("chroot failed");
        None
    }
}

#[cfg(not(unix))]
fn chroot_to(_path: &str) -> Option<()> {
    eprintln!("chroot is only supported on unix targets");
    None
}

fn main() -> ExitCode {
    env_logger::init();
    let matches = cli();
    let args: Vec<&String> = matches.get_many::<String>("path").unwrap().collect();

    let Some(release_path) = set_path(&args) else {
        return ExitCode::FAILURE;
    };

    let cfg = RaceConfig::load(PathBuf::from("/etc/racecore.toml")).unwrap_or_default();

    let entries = match race::read_race(&cfg, &release_path) {
        Ok(e) if !e.is_empty() => e,
        _ => return ExitCode::FAILURE,
    };

    let stats = stats::RaceStats::from_entries(&entries);
    match stats.summary_line() {
        Some(line) => {
            println!("{line}");
            ExitCode::SUCCESS
        }
        None => ExitCode::FAILURE,
    }
}
