//! Per-user/group race statistics, aggregated from a racedata journal.
//!
//! Grounded on the `updatestats`/`sortstats`/`convert` pipeline described in
//! `racestats.c`: the original's companion `stats.c`/`convert.c` weren't part
//! of the retrieved source, so the aggregation shape here follows the single
//! call site in `readrace` (`updatestats` fed `uname`, `group`, `size`,
//! `speed`, `start_time` for every `NotChecked`/`Checked` entry) and the
//! fields `racestats.c` actually reads back out (`total.users`, a formatted
//! summary line).

use crate::model::{FileStatus, RaceEntry};
use std::collections::HashMap;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserStats {
    pub name: String,
    pub files: u64,
    pub size: u64,
    pub slowest: u64,
    pub fastest: u64,
}

impl UserStats {
    fn record(&mut self, size: u64, speed: u64) {
        self.files += 1;
        self.size += size;
        if self.fastest == 0 || speed > self.fastest {
            self.fastest = speed;
        }
        if self.slowest == 0 || speed < self.slowest {
            self.slowest = speed;
        }
    }

    pub fn average_speed(&self) -> u64 {
        if self.files == 0 {
            0
        } else {
            self.size / self.files
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RaceStats {
    pub users: HashMap<String, UserStats>,
    pub groups: HashMap<String, UserStats>,
    pub files_bad: u64,
    pub bad_size: u64,
    pub nfo_present: bool,
}

impl RaceStats {
    /// Fold one racedata entry into the running totals.
    pub fn observe(&mut self, entry: &RaceEntry) {
        match entry.status {
            FileStatus::NotChecked | FileStatus::Checked => {
                self.users
                    .entry(entry.uname.clone())
                    .or_insert_with(|| UserStats { name: entry.uname.clone(), ..Default::default() })
                    .record(entry.size, entry.speed);
                self.groups
                    .entry(entry.group.clone())
                    .or_insert_with(|| UserStats { name: entry.group.clone(), ..Default::default() })
                    .record(entry.size, entry.speed);
            }
            FileStatus::Bad => {
                self.files_bad += 1;
                self.bad_size += entry.size;
            }
            FileStatus::Nfo => {
                self.nfo_present = true;
            }
            _ => {}
        }
    }

    /// Aggregate an entire journal snapshot.
    pub fn from_entries(entries: &[RaceEntry]) -> Self {
        let mut stats = RaceStats::default();
        for e in entries {
            stats.observe(e);
        }
        stats
    }

    pub fn total_files(&self) -> u64 {
        self.users.values().map(|u| u.files).sum()
    }

    pub fn total_size(&self) -> u64 {
        self.users.values().map(|u| u.size).sum()
    }

    /// Users sorted by total contributed size, descending, ties broken by name.
    pub fn users_by_size(&self) -> Vec<&UserStats> {
        let mut v: Vec<&UserStats> = self.users.values().collect();
        v.sort_by(|a, b| b.size.cmp(&a.size).then_with(|| a.name.cmp(&b.name)));
        v
    }

    /// The `racestats` one-line summary: leader, file count, and total size.
    /// Empty when no user has contributed anything yet, matching the
    /// original's `if (g.v.total.users) printf(...)` guard.
    pub fn summary_line(&self) -> Option<String> {
        let leader = self.users_by_size().into_iter().next()?;
        Some(format!(
            "{} files, {} bytes, leader {} ({} bytes)",
            self.total_files(),
            self.total_size(),
            leader.name,
            leader.size,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(uname: &str, group: &str, status: FileStatus, size: u64, speed: u64) -> RaceEntry {
        RaceEntry {
            status,
            crc32: 1,
            fname: "f".into(),
            uname: uname.into(),
            group: group.into(),
            size,
            speed,
            start_time: 0,
        }
    }

    #[test]
    fn aggregates_per_user_and_group() {
        let entries = vec![
            entry("alice", "team1", FileStatus::Checked, 100, 10),
            entry("bob", "team1", FileStatus::Checked, 50, 20),
        ];
        let stats = RaceStats::from_entries(&entries);
        assert_eq!(stats.users["alice"].size, 100);
        assert_eq!(stats.groups["team1"].size, 150);
    }

    #[test]
    fn bad_and_nfo_tracked_outside_user_totals() {
        let entries = vec![
            entry("alice", "team1", FileStatus::Bad, 30, 0),
            entry("alice", "team1", FileStatus::Nfo, 0, 0),
        ];
        let stats = RaceStats::from_entries(&entries);
        assert_eq!(stats.files_bad, 1);
        assert_eq!(stats.bad_size, 30);
        assert!(stats.nfo_present);
        assert!(stats.users.is_empty());
    }

    #[test]
    fn summary_line_is_none_without_contributors() {
        let stats = RaceStats::default();
        assert!(stats.summary_line().is_none());
    }

    #[test]
    fn summary_line_names_the_size_leader() {
        let entries = vec![
            entry("alice", "team1", FileStatus::Checked, 100, 10),
            entry("bob", "team1", FileStatus::Checked, 500, 20),
        ];
        let stats = RaceStats::from_entries(&entries);
        let line = stats.summary_line().unwrap();
        assert!(line.contains("bob"));
        assert!(line.contains("600"));
    }

    #[test]
    fn users_by_size_breaks_ties_by_name() {
        let entries = vec![
            entry("zed", "g", FileStatus::Checked, 100, 1),
            entry("amy", "g", FileStatus::Checked, 100, 1),
        ];
        let stats = RaceStats::from_entries(&entries);
        let ordered = stats.users_by_size();
        assert_eq!(ordered[0].name, "amy");
    }
}
