//! Fixed-size record I/O with index-based overwrite.
//!
//! Grounded on the append/validate/read-until-EOF shape used for the
//! append-only log in this crate's lineage, generalized here to any
//! fixed-width record and to in-place overwrite by index, which the
//! racedata/headdata/sfvdata files all need.

use crate::error::{RaceError, Result};
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// A fixed-width record that can be packed into and out of a `SIZE`-byte buffer.
pub trait Record: Sized {
    const SIZE: usize;
    fn encode(&self, buf: &mut [u8]);
    fn decode(buf: &[u8]) -> Self;
}

/// Fixed-size record storage backed by a single file.
pub struct RecordStore<T: Record> {
    path: PathBuf,
    _marker: std::marker::PhantomData<T>,
}

impl<T: Record> RecordStore<T> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        RecordStore {
            path: path.into(),
            _marker: std::marker::PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open-or-create and append exactly one record at EOF.
    pub fn append(&self, entry: &T) -> Result<()> {
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| RaceError::io(&self.path, e))?;
        let mut buf = vec![0u8; T::SIZE];
        entry.encode(&mut buf);
        f.write_all(&buf).map_err(|e| RaceError::io(&self.path, e))?;
        Ok(())
    }

    /// Read every complete record from the start of the file.
    ///
    /// A partial trailing read (a torn last record, e.g. from a crash mid
    /// write) stops the scan at that point rather than erroring: the file
    /// verifier is idempotent and will reconcile state on the next pass.
    pub fn read_all(&self) -> Result<Vec<T>> {
        let mut f = match std::fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(RaceError::io(&self.path, e)),
        };
        let mut out = Vec::new();
        let mut buf = vec![0u8; T::SIZE];
        loop {
            match read_exact_or_eof(&mut f, &mut buf).map_err(|e| RaceError::io(&self.path, e))? {
                ReadOutcome::Full => out.push(T::decode(&buf)),
                ReadOutcome::Eof => break,
                ReadOutcome::Partial => break,
            }
        }
        Ok(out)
    }

    /// Overwrite the record at `index` (0-based) in place.
    pub fn overwrite_at(&self, index: usize, entry: &T) -> Result<()> {
        let mut f = OpenOptions::new()
            .write(true)
            .open(&self.path)
            .map_err(|e| RaceError::io(&self.path, e))?;
        f.seek(SeekFrom::Start((index * T::SIZE) as u64))
            .map_err(|e| RaceError::io(&self.path, e))?;
        let mut buf = vec![0u8; T::SIZE];
        entry.encode(&mut buf);
        f.write_all(&buf).map_err(|e| RaceError::io(&self.path, e))?;
        Ok(())
    }

    /// Scan from the start and return the index of the first record matching `pred`.
    pub fn find_index(&self, mut pred: impl FnMut(&T) -> bool) -> Result<Option<usize>> {
        Ok(self.read_all()?.iter().position(|e| pred(e)))
    }

    /// Truncate and replace the full record sequence. Used by the compaction
    /// paths (`remove_from_race`, `verify_racedata`).
    pub fn rewrite_all(&self, entries: &[T]) -> Result<()> {
        let mut f = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)
            .map_err(|e| RaceError::io(&self.path, e))?;
        let mut buf = vec![0u8; T::SIZE];
        for entry in entries {
            entry.encode(&mut buf);
            f.write_all(&buf).map_err(|e| RaceError::io(&self.path, e))?;
        }
        Ok(())
    }
}

enum ReadOutcome {
    Full,
    Eof,
    Partial,
}

fn read_exact_or_eof(f: &mut impl Read, buf: &mut [u8]) -> std::io::Result<ReadOutcome> {
    let mut total = 0;
    while total < buf.len() {
        let n = f.read(&mut buf[total..])?;
        if n == 0 {
            return Ok(if total == 0 {
                ReadOutcome::Eof
            } else {
                ReadOutcome::Partial
            });
        }
        total += n;
    }
    Ok(ReadOutcome::Full)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FileStatus, RaceEntry};

    fn sample(fname: &str) -> RaceEntry {
        RaceEntry {
            status: FileStatus::NotChecked,
            crc32: 1,
            fname: fname.into(),
            uname: "u".into(),
            group: "g".into(),
            size: 10,
            speed: 5,
            start_time: 100,
        }
    }

    #[test]
    fn append_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store: RecordStore<RaceEntry> = RecordStore::new(dir.path().join("racedata"));
        store.append(&sample("a")).unwrap();
        store.append(&sample("b")).unwrap();
        let all = store.read_all().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].fname, "a");
        assert_eq!(all[1].fname, "b");
    }

    #[test]
    fn overwrite_at_replaces_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let store: RecordStore<RaceEntry> = RecordStore::new(dir.path().join("racedata"));
        store.append(&sample("a")).unwrap();
        store.append(&sample("b")).unwrap();
        let mut replacement = sample("a");
        replacement.status = FileStatus::Checked;
        store.overwrite_at(0, &replacement).unwrap();
        let all = store.read_all().unwrap();
        assert_eq!(all[0].status, FileStatus::Checked);
        assert_eq!(all[1].fname, "b");
    }

    #[test]
    fn read_all_on_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store: RecordStore<RaceEntry> = RecordStore::new(dir.path().join("racedata"));
        assert!(store.read_all().unwrap().is_empty());
    }

    #[test]
    fn torn_trailing_record_stops_scan_without_erroring() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("racedata");
        let store: RecordStore<RaceEntry> = RecordStore::new(&path);
        store.append(&sample("a")).unwrap();
        // Append a short, torn "record" by hand.
        use std::io::Write;
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(&[1, 2, 3]).unwrap();
        let all = store.read_all().unwrap();
        assert_eq!(all.len(), 1);
    }

    #[test]
    fn rewrite_all_truncates_and_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let store: RecordStore<RaceEntry> = RecordStore::new(dir.path().join("racedata"));
        store.append(&sample("a")).unwrap();
        store.append(&sample("b")).unwrap();
        store.rewrite_all(&[sample("c")]).unwrap();
        let all = store.read_all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].fname, "c");
    }

    #[test]
    fn find_index_scans_from_zero() {
        let dir = tempfile::tempdir().unwrap();
        let store: RecordStore<RaceEntry> = RecordStore::new(dir.path().join("racedata"));
        store.append(&sample("a")).unwrap();
        store.append(&sample("b")).unwrap();
        let idx = store.find_index(|e| e.fname == "b").unwrap();
        assert_eq!(idx, Some(1));
    }
}
