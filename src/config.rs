//! Runtime configuration.
//!
//! A reference FTP race daemon baked every `sfv_cleanup_*` / `create_missing_*`
//! flag in as a compile-time `#if`. Here they live in a single runtime-readable
//! struct, loadable from an optional TOML overlay and otherwise defaulting to
//! that reference implementation's values.

use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RaceConfig {
    /// Root under which per-release state (`headdata`, `racedata`, `sfv`) is kept.
    pub storage: PathBuf,

    /// Seconds a waiter is expected to wait for a lock; staleness bound is 5x this.
    pub max_seconds_wait_for_lock: u64,
    /// Minimum age (seconds) between heartbeat writes when nothing else changed.
    pub lock_optimize: u64,
    /// Current on-disk schema version. Bump on breaking layout changes.
    pub data_version: u32,

    pub sfv_cleanup: bool,
    pub sfv_cleanup_comments: bool,
    pub sfv_cleanup_crlf: bool,
    pub sfv_cleanup_lowercase: bool,
    pub sfv_dupecheck: bool,
    pub sfv_lenient: bool,
    pub allow_slash_in_sfv: bool,
    pub sfv_calc_single_fname: bool,
    pub create_missing_sfv: bool,
    pub create_missing_files: bool,

    /// Extensions (without leading dot) never tracked for CRC.
    pub ignored_types: Vec<String>,
    /// Extensions tolerated without a CRC match, unless the path is exempt.
    pub allowed_types: Vec<String>,
    /// Path globs exempting a release directory from `allowed_types` tolerance.
    pub allowed_types_exemption_dirs: Vec<String>,
    pub audio_types: Vec<String>,
    pub video_types: Vec<String>,
    pub rar_types: Vec<String>,

    /// Optional external command invoked on a dupe/bad file, `{}` substituted with the path.
    pub unduper_script: Option<String>,
}

impl Default for RaceConfig {
    fn default() -> Self {
        RaceConfig {
            storage: PathBuf::from("/glftpd/ftp-data/race"),
            max_seconds_wait_for_lock: 10,
            lock_optimize: 2,
            data_version: 3,
            sfv_cleanup: true,
            sfv_cleanup_comments: false,
            sfv_cleanup_crlf: false,
            sfv_cleanup_lowercase: false,
            sfv_dupecheck: true,
            sfv_lenient: true,
            allow_slash_in_sfv: false,
            sfv_calc_single_fname: true,
            create_missing_sfv: false,
            create_missing_files: true,
            ignored_types: vec!["missing".into(), "bad".into()],
            allowed_types: vec!["nfo".into(), "sfv".into(), "m3u".into()],
            allowed_types_exemption_dirs: Vec::new(),
            audio_types: vec!["mp3".into(), "flac".into(), "ogg".into(), "m4a".into()],
            video_types: vec!["mkv".into(), "avi".into(), "mp4".into(), "vob".into()],
            rar_types: vec!["rar".into(), "r00".into(), "r01".into()],
            unduper_script: None,
        }
    }
}

impl RaceConfig {
    /// Load configuration from a TOML file, falling back to defaults for any
    /// key the file does not set. A missing file is not an error; it just
    /// means "use the defaults".
    pub fn load(path: impl AsRef<Path>) -> crate::error::Result<Self> {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(text) => {
                toml::from_str(&text).map_err(|e| crate::error::RaceError::CorruptRecord {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(crate::error::RaceError::io(path, e)),
        }
    }

    pub fn head_path(&self, release_path: &str) -> PathBuf {
        self.storage.join(release_path).join("headdata")
    }

    pub fn race_path(&self, release_path: &str) -> PathBuf {
        self.storage.join(release_path).join("racedata")
    }

    pub fn sfv_path(&self, release_path: &str) -> PathBuf {
        self.storage.join(release_path).join("sfv")
    }

    /// `true` if `ext` (lowercased, no leading dot) matches any of `patterns` as a glob.
    pub fn ext_matches(patterns: &[String], ext: &str) -> bool {
        let ext = ext.to_ascii_lowercase();
        patterns.iter().any(|p| {
            glob::Pattern::new(&p.to_ascii_lowercase())
                .map(|pat| pat.matches(&ext))
                .unwrap_or(false)
        })
    }

    /// `true` if `path` is under one of the exemption-dir globs.
    pub fn path_matches(patterns: &[String], path: &str) -> bool {
        patterns.iter().any(|p| {
            glob::Pattern::new(p)
                .map(|pat| pat.matches(path))
                .unwrap_or(false)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_constants() {
        let cfg = RaceConfig::default();
        assert_eq!(cfg.data_version, 3);
        assert!(cfg.sfv_cleanup);
        assert!(cfg.sfv_lenient);
    }

    #[test]
    fn missing_config_file_falls_back_to_defaults() {
        let cfg = RaceConfig::load("/nonexistent/path/to/race.toml").unwrap();
        assert_eq!(cfg.max_seconds_wait_for_lock, 10);
    }

    #[test]
    fn ext_matches_is_case_insensitive() {
        let patterns = vec!["nfo".to_string(), "sfv".to_string()];
        assert!(RaceConfig::ext_matches(&patterns, "NFO"));
        assert!(!RaceConfig::ext_matches(&patterns, "rar"));
    }

    #[test]
    fn overlay_overrides_only_set_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("race.toml");
        std::fs::write(&path, "max_seconds_wait_for_lock = 30\n").unwrap();
        let cfg = RaceConfig::load(&path).unwrap();
        assert_eq!(cfg.max_seconds_wait_for_lock, 30);
        assert_eq!(cfg.lock_optimize, 2);
    }
}
