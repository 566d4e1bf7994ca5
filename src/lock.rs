//! Mutual exclusion and cooperative cancellation over a per-release headdata file.
//!
//! Grounded on `create_lock`/`update_lock`/`remove_lock` in the reference
//! zipscript implementation, but reworked per the "manual lock dance" design
//! note into scoped ownership: [`ReleaseLock`] is a guard whose `Drop`
//! guarantees the `.lock` hardlink and the `in_use` bit are cleared on every
//! exit path, including early returns and panics.

use crate::config::RaceConfig;
use crate::error::{RaceError, Result};
use crate::model::{HeadEntry, ReleaseType};
use crate::record::Record;
use log::{debug, warn};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Requested acquisition mode, mirroring the original `force_lock` parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Acquire if free; otherwise report busy.
    Default,
    /// Ask the current holder to release at its next heartbeat.
    Suggest,
    /// Seize the lock unconditionally, resetting the queue.
    Force,
    /// Take a FIFO ticket if the lock is held or others are ahead.
    Enqueue { ticket: u32 },
}

/// Outcome of a `create_lock` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    Acquired,
    Busy(u32),
    Queued(u32),
    VersionMismatch,
}

/// Outcome of an `update_lock` heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Heartbeat accepted; carries the new incrementor value.
    Continue(u32),
    /// A peer suggested removal; caller must clean up and exit.
    RemovalRequested,
    /// Pid mismatch: another process holds the lock. Caller must exit.
    Lost,
    /// Schema version mismatch.
    Stop,
}

const RETRY_ATTEMPTS: u32 = 10;
const RETRY_SLEEP: Duration = Duration::from_millis(100);

fn now_unix() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

fn read_head(f: &mut File) -> std::io::Result<HeadEntry> {
    f.seek(SeekFrom::Start(0))?;
    let mut buf = vec![0u8; HeadEntry::SIZE];
    f.read_exact(&mut buf)?;
    Ok(HeadEntry::decode(&buf))
}

fn write_head(f: &mut File, hd: &HeadEntry) -> std::io::Result<()> {
    f.seek(SeekFrom::Start(0))?;
    let mut buf = vec![0u8; HeadEntry::SIZE];
    hd.encode(&mut buf);
    f.write_all(&buf)
}

/// Acquire the filesystem mutex for `head_path` via the hardlink trick,
/// unlinking a stale lock first if its ctime is too old.
fn acquire_fs_mutex(head_path: &Path, lock_path: &Path, max_wait: u64) -> Result<bool> {
    if let Ok(meta) = std::fs::metadata(lock_path) {
        let age = now_unix().saturating_sub(meta.ctime() as u64);
        if age >= max_wait * 5 {
            debug!("lock: stale lockfile at {:?} (age {}s), unlinking", lock_path, age);
            let _ = std::fs::remove_file(lock_path);
        }
    }

    for attempt in 0..RETRY_ATTEMPTS {
        match std::fs::hard_link(head_path, lock_path) {
            Ok(()) => return Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                debug!("lock: link attempt {}/{} failed, sleeping", attempt + 1, RETRY_ATTEMPTS);
                std::thread::sleep(RETRY_SLEEP);
            }
            Err(e) => return Err(RaceError::io(lock_path, e)),
        }
    }
    Ok(false)
}

/// Attempt to acquire the lock for `release_path`. On success, returns a
/// [`ReleaseLock`] guard that must eventually be consumed by `release()` (or
/// will release automatically, best-effort, on drop).
pub fn create_lock(
    cfg: &RaceConfig,
    release_path: &str,
    progtype: u32,
    mode: LockMode,
) -> Result<(LockOutcome, Option<ReleaseLock>)> {
    let head_path = cfg.head_path(release_path);
    if let Some(parent) = head_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| RaceError::io(parent, e))?;
    }
    let lock_path = {
        let mut p = head_path.clone().into_os_string();
        p.push(".lock");
        PathBuf::from(p)
    };

    let mut f = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(&head_path)
        .map_err(|e| RaceError::io(&head_path, e))?;

    if !acquire_fs_mutex(&head_path, &lock_path, cfg.max_seconds_wait_for_lock)? {
        warn!("lock: failed to acquire filesystem mutex for {:?}", head_path);
        return Ok((LockOutcome::Busy(u32::MAX), None));
    }

    let meta = f.metadata().map_err(|e| RaceError::io(&head_path, e))?;

    if meta.len() == 0 {
        let hd = HeadEntry {
            data_version: cfg.data_version,
            data_type: ReleaseType::Unknown,
            data_in_use: progtype,
            data_incrementor: 1,
            data_queue: 1,
            data_qcurrent: 0,
            data_completed: false,
            data_pid: std::process::id(),
        };
        write_head(&mut f, &hd).map_err(|e| RaceError::io(&head_path, e))?;
        let _ = std::fs::remove_file(&lock_path);
        debug!("lock: created fresh headdata, acquired. pid={}", hd.data_pid);
        return Ok((
            LockOutcome::Acquired,
            Some(ReleaseLock::new(head_path, progtype, cfg.data_version, cfg.lock_optimize, false)),
        ));
    }

    let mut hd = read_head(&mut f).map_err(|e| RaceError::io(&head_path, e))?;

    if hd.data_version != cfg.data_version {
        let _ = std::fs::remove_file(&lock_path);
        return Ok((LockOutcome::VersionMismatch, None));
    }

    let age = now_unix().saturating_sub(meta.ctime() as u64);
    if age >= cfg.max_seconds_wait_for_lock * 5 {
        hd.data_in_use = progtype;
        hd.data_incrementor = 1;
        hd.data_queue = 1;
        hd.data_qcurrent = 0;
        hd.data_pid = std::process::id();
        write_head(&mut f, &hd).map_err(|e| RaceError::io(&head_path, e))?;
        let _ = std::fs::remove_file(&lock_path);
        debug!("lock: headdata exceeded max lifetime, reclaimed. pid={}", hd.data_pid);
        return Ok((
            LockOutcome::Acquired,
            Some(ReleaseLock::new(head_path, progtype, cfg.data_version, cfg.lock_optimize, hd.data_completed)),
        ));
    }

    if hd.data_in_use != 0 {
        match mode {
            LockMode::Force => {
                hd.data_queue = 1;
                hd.data_qcurrent = 0;
            }
            LockMode::Suggest => {
                hd.data_incrementor = 0;
                write_head(&mut f, &hd).map_err(|e| RaceError::io(&head_path, e))?;
                let _ = std::fs::remove_file(&lock_path);
                return Ok((LockOutcome::Busy(hd.data_in_use), None));
            }
            LockMode::Enqueue { ticket } => {
                // A ticket already in hand still just waits; the lock is
                // busy regardless of whose turn it is. Only mint a fresh
                // ticket the first time this caller enqueues.
                let ticket = if ticket != 0 {
                    ticket
                } else {
                    let minted = hd.data_queue;
                    hd.data_queue += 1;
                    write_head(&mut f, &hd).map_err(|e| RaceError::io(&head_path, e))?;
                    minted
                };
                let _ = std::fs::remove_file(&lock_path);
                return Ok((LockOutcome::Queued(ticket), None));
            }
            LockMode::Default => {
                let _ = std::fs::remove_file(&lock_path);
                return Ok((LockOutcome::Busy(hd.data_in_use), None));
            }
        }
    } else {
        match mode {
            LockMode::Force => {
                hd.data_queue = 1;
                hd.data_qcurrent = 0;
            }
            LockMode::Enqueue { ticket } if ticket != 0 && ticket <= hd.data_qcurrent => {
                // Our own ticket's turn has come; fall through and acquire.
            }
            LockMode::Enqueue { ticket } if ticket != 0 => {
                // Still waiting on a ticket we already hold.
                let _ = std::fs::remove_file(&lock_path);
                return Ok((LockOutcome::Queued(ticket), None));
            }
            LockMode::Enqueue { .. } if hd.data_queue > hd.data_qcurrent => {
                let ticket = hd.data_queue;
                hd.data_queue += 1;
                write_head(&mut f, &hd).map_err(|e| RaceError::io(&head_path, e))?;
                let _ = std::fs::remove_file(&lock_path);
                return Ok((LockOutcome::Queued(ticket), None));
            }
            // A `Default` caller with an outstanding queue still proceeds:
            // the queue only gates `Enqueue` callers re-presenting a ticket.
            _ => {}
        }
    }

    // Suggest against an unlocked head has nothing to suggest: treat it as a
    // normal acquisition, since there is no holder to cancel (see DESIGN.md).
    hd.data_incrementor = 1;
    hd.data_in_use = progtype;
    hd.data_pid = std::process::id();
    write_head(&mut f, &hd).map_err(|e| RaceError::io(&head_path, e))?;
    let _ = std::fs::remove_file(&lock_path);
    debug!("lock: acquired. pid={}", hd.data_pid);
    Ok((
        LockOutcome::Acquired,
        Some(ReleaseLock::new(head_path, progtype, cfg.data_version, cfg.lock_optimize, hd.data_completed)),
    ))
}

/// Owns the right to mutate a release's headdata. Guarantees the lock is
/// released (in_use cleared) on every exit path via `Drop`.
pub struct ReleaseLock {
    head_path: PathBuf,
    progtype: u32,
    data_version: u32,
    lock_optimize: u64,
    completed: bool,
    released: bool,
}

impl ReleaseLock {
    fn new(head_path: PathBuf, progtype: u32, data_version: u32, lock_optimize: u64, completed: bool) -> Self {
        ReleaseLock {
            head_path,
            progtype,
            data_version,
            lock_optimize,
            completed,
            released: false,
        }
    }

    pub fn set_completed(&mut self, completed: bool) {
        self.completed = completed;
    }

    /// Heartbeat: touch the lock and check whether a peer suggested removal.
    ///
    /// Writes are throttled per `lock_optimize`: a plain heartbeat with no
    /// classification change only hits disk once the headdata's ctime is at
    /// least `lock_optimize` seconds old, to bound write churn on a busy
    /// release (set `lock_optimize = 0` to write on every call).
    pub fn update(&mut self, heartbeat: bool, new_data_type: Option<ReleaseType>) -> Result<UpdateOutcome> {
        let mut f = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.head_path)
            .map_err(|e| RaceError::io(&self.head_path, e))?;
        let mut hd = read_head(&mut f).map_err(|e| RaceError::io(&self.head_path, e))?;

        if !heartbeat {
            hd.data_incrementor = 0;
            write_head(&mut f, &hd).map_err(|e| RaceError::io(&self.head_path, e))?;
            return Ok(UpdateOutcome::Continue(0));
        }

        if hd.data_version != self.data_version {
            return Ok(UpdateOutcome::Stop);
        }
        if hd.data_in_use != self.progtype {
            return Err(RaceError::FatalRace);
        }
        if hd.data_incrementor == 0 {
            return Ok(UpdateOutcome::RemovalRequested);
        }

        if hd.data_pid != std::process::id() {
            hd.data_queue = hd.data_queue.saturating_sub(1);
            write_head(&mut f, &hd).map_err(|e| RaceError::io(&self.head_path, e))?;
            return Ok(UpdateOutcome::Lost);
        }

        hd.data_incrementor += 1;
        if let Some(t) = new_data_type {
            hd.data_type = t;
        }

        let meta = f.metadata().map_err(|e| RaceError::io(&self.head_path, e))?;
        let age = now_unix().saturating_sub(meta.ctime() as u64);
        let should_write = self.lock_optimize == 0
            || new_data_type.is_some()
            || (age >= self.lock_optimize && hd.data_incrementor > 1);
        if should_write {
            write_head(&mut f, &hd).map_err(|e| RaceError::io(&self.head_path, e))?;
        }

        Ok(UpdateOutcome::Continue(hd.data_incrementor))
    }

    /// Explicitly release the lock, persisting the final `data_completed` flag.
    pub fn release(mut self) -> Result<()> {
        self.do_release()
    }

    fn do_release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        let mut f = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.head_path)
            .map_err(|e| RaceError::io(&self.head_path, e))?;
        let mut hd = read_head(&mut f).map_err(|e| RaceError::io(&self.head_path, e))?;

        hd.data_in_use = 0;
        hd.data_pid = 0;
        hd.data_incrementor = 0;
        hd.data_completed = self.completed;
        if hd.data_queue != 0 {
            hd.data_qcurrent += 1;
        }
        if hd.data_queue < hd.data_qcurrent {
            hd.data_queue = 0;
            hd.data_qcurrent = 0;
        }
        write_head(&mut f, &hd).map_err(|e| RaceError::io(&self.head_path, e))?;

        let lock_path = {
            let mut p = self.head_path.clone().into_os_string();
            p.push(".lock");
            PathBuf::from(p)
        };
        let _ = std::fs::remove_file(&lock_path);
        debug!("lock: released, queue {}/{}", hd.data_qcurrent, hd.data_queue);
        Ok(())
    }
}

impl Drop for ReleaseLock {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.do_release() {
                warn!("lock: best-effort release on drop failed: {e}");
            }
        }
    }
}
