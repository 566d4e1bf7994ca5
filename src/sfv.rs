//! SFV ingest: text-to-binary conversion, extension policy, and lenient
//! filename matching.
//!
//! Grounded on `copysfv`/`readsfv`/`lenient_compare` in the reference
//! zipscript implementation. The original's runtime knobs (`sfv_cleanup`,
//! `sfv_dupecheck`, ...) were `#if` compile guards; here they're read off
//! [`RaceConfig`] at call time.

use crate::config::RaceConfig;
use crate::error::{RaceError, Result};
use crate::model::{ReleaseType, SfvEntry};
use crate::record::RecordStore;
use log::{debug, warn};
use std::io::Write;
use std::path::Path;

/// Result of parsing an SFV file's text into manifest entries.
#[derive(Debug, Clone)]
pub struct SfvParseOutcome {
    pub entries: Vec<SfvEntry>,
    pub release_type: ReleaseType,
    /// The cleaned SFV text, present whenever `cfg.sfv_cleanup` is set.
    pub cleaned_text: Option<String>,
}

/// Parse raw SFV text into a manifest, classify its dominant content type,
/// and optionally produce a cleaned rewrite (stripped comments/whitespace,
/// normalized CRC case).
///
/// `base_dir` is consulted only when an entry's CRC is absent and
/// `cfg.sfv_calc_single_fname` allows computing it from the file on disk.
/// `release_path` is consulted only for `allowed_types_exemption_dirs`
/// matching.
pub fn parse_sfv(cfg: &RaceConfig, base_dir: &Path, release_path: &str, text: &str) -> Result<SfvParseOutcome> {
    let mut entries = Vec::new();
    let mut cleaned = cfg.sfv_cleanup.then(String::new);
    let mut seen: Vec<String> = Vec::new();

    let (mut audio, mut video, mut rars, mut other) = (0u32, 0u32, 0u32, 0u32);

    for (lineno, raw_line) in text.lines().enumerate() {
        let line = raw_line.trim_start();

        if line.starts_with(';') {
            if cfg.sfv_cleanup && cfg.sfv_cleanup_comments {
                // drop comments from the cleaned copy
            } else if let Some(buf) = cleaned.as_mut() {
                buf.push_str(line);
                push_newline(buf, cfg);
            }
            continue;
        }
        if line.is_empty() {
            continue;
        }

        let (crc_str, rest) = split_trailing_token(line);
        let is_hex_crc = (6..=8).contains(&crc_str.len()) && crc_str.chars().all(|c| c.is_ascii_hexdigit());

        let (fname_part, crc32) = if is_hex_crc {
            (rest.trim_end(), u32::from_str_radix(crc_str, 16).unwrap_or(0))
        } else if cfg.sfv_cleanup {
            debug!("sfv: line {lineno} missing a valid crc, continuing anyway");
            (line, 0)
        } else {
            return Err(RaceError::InvalidSfv {
                line: lineno + 1,
                reason: "missing or malformed crc field".into(),
            });
        };

        let fname = fname_part.trim();
        if fname.is_empty() || fname.len() >= crate::model::NAME_MAX - 9 {
            if cfg.sfv_cleanup {
                continue;
            }
            return Err(RaceError::InvalidSfv {
                line: lineno + 1,
                reason: "filename missing or too long".into(),
            });
        }
        if !cfg.allow_slash_in_sfv && (fname.contains('/') || fname.contains('\\') || fname.contains('\t')) {
            return Err(RaceError::InvalidSfv {
                line: lineno + 1,
                reason: "path separator or tab in filename".into(),
            });
        }

        let crc32 = if crc32 == 0 && cfg.sfv_calc_single_fname {
            compute_file_crc32(&base_dir.join(fname)).unwrap_or(0)
        } else {
            crc32
        };
        if crc32 == 0 {
            debug!("sfv: '{fname}' has no crc, ignoring entry");
            continue;
        }

        let ext = fname.rsplit('.').next().unwrap_or("");
        if ext.eq_ignore_ascii_case("sfv") || ext.eq_ignore_ascii_case("nfo") {
            continue;
        }
        if RaceConfig::ext_matches(&cfg.ignored_types, ext) {
            continue;
        }
        let tolerated = RaceConfig::ext_matches(&cfg.allowed_types, ext)
            && !RaceConfig::path_matches(&cfg.allowed_types_exemption_dirs, release_path);
        if tolerated {
            continue;
        }

        if cfg.sfv_dupecheck {
            let key = fname.to_ascii_lowercase();
            if seen.contains(&key) {
                continue;
            }
            seen.push(key);
        }

        if let Some(buf) = cleaned.as_mut() {
            buf.push_str(fname);
            buf.push(' ');
            buf.push_str(&format!("{crc32:08x}"));
            push_newline(buf, cfg);
        }

        if RaceConfig::ext_matches(&cfg.audio_types, ext) {
            audio += 1;
        } else if RaceConfig::ext_matches(&cfg.rar_types, ext) {
            rars += 1;
        } else if RaceConfig::ext_matches(&cfg.video_types, ext) {
            video += 1;
        } else {
            other += 1;
        }

        entries.push(SfvEntry {
            crc32,
            fname: fname.to_string(),
        });
    }

    let release_type = if audio > rars {
        if video > audio {
            pick(video, other, ReleaseType::Video)
        } else {
            pick(audio, other, ReleaseType::Audio)
        }
    } else if video > rars {
        pick(video, other, ReleaseType::Video)
    } else {
        pick(rars, other, ReleaseType::Rar)
    };

    Ok(SfvParseOutcome {
        entries,
        release_type,
        cleaned_text: cleaned,
    })
}

/// Parse `sfv_file_path`'s text, write the resulting manifest to the
/// release's binary sfvdata, and rewrite the textual SFV in place if
/// `cfg.sfv_cleanup` produced a cleaned copy. On a malformed row outside
/// `sfv_cleanup` tolerance, quarantines the textual SFV as `<name>.bad`,
/// unlinks any partial sfvdata/racedata left from an earlier attempt, and
/// propagates the error so the caller exits non-zero.
pub fn ingest_release(cfg: &RaceConfig, release_path: &str, sfv_file_path: &Path) -> Result<SfvParseOutcome> {
    let text = std::fs::read_to_string(sfv_file_path).map_err(|e| RaceError::io(sfv_file_path, e))?;
    let base_dir = sfv_file_path.parent().unwrap_or_else(|| Path::new("."));

    match parse_sfv(cfg, base_dir, release_path, &text) {
        Ok(outcome) => {
            let store: RecordStore<SfvEntry> = RecordStore::new(cfg.sfv_path(release_path));
            store.rewrite_all(&outcome.entries)?;
            if let Some(cleaned) = &outcome.cleaned_text {
                rewrite_sfv_atomically(sfv_file_path, cleaned)?;
            }
            Ok(outcome)
        }
        Err(err @ RaceError::InvalidSfv { .. }) => {
            warn!("sfv: {release_path} failed ingest ({err}), quarantining");
            let mut bad = sfv_file_path.as_os_str().to_os_string();
            bad.push(".bad");
            let _ = std::fs::rename(sfv_file_path, &bad);
            let _ = std::fs::remove_file(cfg.sfv_path(release_path));
            let _ = std::fs::remove_file(cfg.race_path(release_path));
            Err(err)
        }
        Err(err) => Err(err),
    }
}

/// Write `contents` to a `.tmpsfv` sibling of `dest` and rename it over
/// `dest`, so a crash mid-write never leaves a half-written textual SFV.
fn rewrite_sfv_atomically(dest: &Path, contents: &str) -> Result<()> {
    let dir = dest.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::Builder::new()
        .prefix(".tmpsfv")
        .tempfile_in(dir)
        .map_err(|e| RaceError::io(dest, e))?;
    tmp.write_all(contents.as_bytes()).map_err(|e| RaceError::io(dest, e))?;
    tmp.persist(dest).map_err(|e| RaceError::io(dest, e.error))?;
    Ok(())
}

fn pick(winner_count: u32, other: u32, winner: ReleaseType) -> ReleaseType {
    if winner_count >= other {
        winner
    } else {
        ReleaseType::Other
    }
}

fn push_newline(buf: &mut String, cfg: &RaceConfig) {
    if cfg.sfv_cleanup_crlf {
        buf.push('\r');
    }
    buf.push('\n');
}

/// Split `line` into its trailing whitespace-delimited token (candidate crc)
/// and everything before it (candidate filename).
fn split_trailing_token(line: &str) -> (&str, &str) {
    match line.trim_end().rfind(char::is_whitespace) {
        Some(idx) => (line[idx + 1..].trim_end(), &line[..idx]),
        None => ("", line),
    }
}

fn compute_file_crc32(path: &Path) -> Option<u32> {
    let bytes = std::fs::read(path).ok()?;
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&bytes);
    Some(hasher.finalize())
}

/// Right-to-left filename comparison that optionally folds case and treats
/// `' '`, `','`, `'.'`, `'-'`, `'_'` as mutually equivalent on both sides.
///
/// The reference implementation tested `a[0] == '_'` twice instead of
/// `b[0] == '_'` when building the punctuation-equivalence class for `b`,
/// so a trailing underscore on the right-hand name was never folded. Fixed
/// here to test each side independently, matching the documented intent.
pub fn lenient_compare(cfg: &RaceConfig, name1: &str, name2: &str) -> bool {
    let a: Vec<char> = name1.chars().collect();
    let b: Vec<char> = name2.chars().collect();
    if a.len() != b.len() {
        return false;
    }

    for i in 0..a.len() {
        let (mut ca, mut cb) = (a[i], b[i]);
        if ca != cb {
            if cfg.sfv_cleanup_lowercase {
                ca = ca.to_ascii_lowercase();
                cb = cb.to_ascii_lowercase();
            }
            if cfg.sfv_lenient {
                if is_foldable(ca) {
                    ca = '*';
                }
                if is_foldable(cb) {
                    cb = '*';
                }
            }
            if ca != cb {
                return false;
            }
        }
    }
    true
}

fn is_foldable(c: char) -> bool {
    matches!(c, ' ' | ',' | '.' | '-' | '_')
}
