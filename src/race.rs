//! The racedata journal: per-file upload state for one release.
//!
//! Grounded on `writerace`/`readrace`/`remove_from_race`/`verify_racedata`/
//! `clear_file` in the reference implementation, layered on the generic
//! [`RecordStore`] rather than hand-rolled `open`/`read`/`lseek` calls.

use crate::config::RaceConfig;
use crate::error::Result;
use crate::model::{FileStatus, RaceEntry};
use crate::record::RecordStore;
use log::{debug, warn};

fn store(cfg: &RaceConfig, release_path: &str) -> RecordStore<RaceEntry> {
    RecordStore::new(cfg.race_path(release_path))
}

/// Insert or update the entry for `fname`, matched case-sensitively unless
/// `cfg.sfv_cleanup_lowercase` is set.
pub fn write_race(cfg: &RaceConfig, release_path: &str, entry: RaceEntry) -> Result<()> {
    let store = store(cfg, release_path);
    let fold = cfg.sfv_cleanup_lowercase;
    let target = if fold { entry.fname.to_ascii_lowercase() } else { entry.fname.clone() };

    let existing = store.find_index(|e| {
        let name = if fold { e.fname.to_ascii_lowercase() } else { e.fname.clone() };
        name == target
    })?;

    match existing {
        Some(idx) => {
            debug!("race: overwriting existing entry for {}", entry.fname);
            store.overwrite_at(idx, &entry)
        }
        None => {
            debug!("race: appending new entry for {}", entry.fname);
            store.append(&entry)
        }
    }
}

/// Mark `fname`'s entry (if any) as [`FileStatus::Deleted`], leaving its
/// position in the file. Returns the number of entries updated (0 or 1;
/// more than one only if the journal already contained duplicates).
pub fn clear_file(cfg: &RaceConfig, release_path: &str, fname: &str) -> Result<usize> {
    let store = store(cfg, release_path);
    let fold = cfg.sfv_cleanup_lowercase;
    let mut entries = store.read_all()?;
    let mut n = 0;
    for e in entries.iter_mut() {
        let matches = if fold {
            e.fname.eq_ignore_ascii_case(fname)
        } else {
            e.fname == fname
        };
        if matches {
            e.status = FileStatus::Deleted;
            n += 1;
        }
    }
    if n > 0 {
        store.rewrite_all(&entries)?;
    }
    Ok(n)
}

/// Drop `fname`'s entry from the journal entirely (compaction, unlike
/// `clear_file`'s tombstone).
pub fn remove_from_race(cfg: &RaceConfig, release_path: &str, fname: &str) -> Result<()> {
    let store = store(cfg, release_path);
    let fold = cfg.sfv_cleanup_lowercase;
    let kept: Vec<RaceEntry> = store
        .read_all()?
        .into_iter()
        .filter(|e| {
            if fold {
                !e.fname.eq_ignore_ascii_case(fname)
            } else {
                e.fname != fname
            }
        })
        .collect();
    store.rewrite_all(&kept)
}

/// Drop any entry whose file is no longer present under `base_dir`, marking
/// it missing via the caller-supplied `on_missing` hook (typically creating
/// a `.missing` marker).
pub fn verify_racedata(
    cfg: &RaceConfig,
    release_path: &str,
    base_dir: &std::path::Path,
    mut on_missing: impl FnMut(&str) -> Result<()>,
) -> Result<()> {
    let store = store(cfg, release_path);
    let mut kept = Vec::new();
    for e in store.read_all()? {
        if e.fname.is_empty() {
            warn!("race: encountered an entry with an empty filename, dropping it");
            continue;
        }
        if base_dir.join(&e.fname).exists() {
            kept.push(e);
        } else {
            debug!("race: {} is missing on disk, removing from journal", e.fname);
            on_missing(&e.fname)?;
        }
    }
    store.rewrite_all(&kept)
}

/// Every entry currently on file, in journal order.
pub fn read_race(cfg: &RaceConfig, release_path: &str) -> Result<Vec<RaceEntry>> {
    store(cfg, release_path).read_all()
}

/// `true` if `fname` has a [`FileStatus::Checked`] entry in the journal.
pub fn match_file(cfg: &RaceConfig, release_path: &str, fname: &str) -> Result<bool> {
    Ok(read_race(cfg, release_path)?
        .iter()
        .any(|e| e.fname == fname && e.status == FileStatus::Checked))
}
