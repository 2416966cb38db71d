use anyhow::{Context, Result};
use chrono::{DateTime, Duration, FixedOffset, Local};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};
use tempfile::NamedTempFile;

/// Marker recording when GC last completed in a repository.
///
/// Stored as pretty-printed JSON at `<git-dir>/review-gc/last-run.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastRun {
    pub version: u32,
    pub last_run: Option<DateTime<FixedOffset>>,
}

impl LastRun {
    pub fn never() -> Self {
        LastRun {
            version: 1,
            last_run: None,
        }
    }

    pub fn now() -> Self {
        LastRun {
            version: 1,
            last_run: Some(Local::now().fixed_offset()),
        }
    }

    /// `true` when no run is recorded, or the last one is at least
    /// `interval_days` before `now`.
    pub fn is_due(&self, now: DateTime<FixedOffset>, interval_days: u32) -> bool {
        match self.last_run {
            None => true,
            Some(at) => now - at >= Duration::days(i64::from(interval_days)),
        }
    }
}

/// Load the marker from `path`. Returns [`LastRun::never`] if it does not exist.
pub fn load_last_run(path: &Path) -> Result<LastRun> {
    if !path.exists() {
        return Ok(LastRun::never());
    }
    let text =
        fs::read_to_string(path).with_context(|| format!("reading marker: {}", path.display()))?;
    let marker: LastRun = serde_json::from_str(&text)
        .with_context(|| format!("parsing marker: {}", path.display()))?;
    Ok(marker)
}

/// Write the marker to `path` atomically.
///
/// Serialises to a `NamedTempFile` in the same directory as `path`, then
/// renames it into place, so readers see either the old or the new marker.
pub fn write_last_run(path: &Path, marker: &LastRun) -> Result<()> {
    let parent = path.parent().unwrap_or(Path::new("."));
    fs::create_dir_all(parent)
        .with_context(|| format!("creating marker dir: {}", parent.display()))?;

    let text = serde_json::to_string_pretty(marker).context("serializing marker")?;

    let mut tmp = NamedTempFile::new_in(parent)
        .with_context(|| format!("creating temp file in {}", parent.display()))?;
    std::io::Write::write_all(&mut tmp, text.as_bytes())
        .with_context(|| format!("writing marker temp file in {}", parent.display()))?;
    tmp.persist(path)
        .with_context(|| format!("persisting marker to {}", path.display()))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn at(s: &str) -> DateTime<FixedOffset> {
        DateTime::parse_from_rfc3339(s).unwrap()
    }

    #[test]
    fn test_never_is_due() {
        assert!(LastRun::never().is_due(at("2026-01-01T00:00:00Z"), 7));
    }

    #[test]
    fn test_recent_run_not_due() {
        let marker = LastRun {
            version: 1,
            last_run: Some(at("2026-01-05T00:00:00Z")),
        };
        assert!(!marker.is_due(at("2026-01-08T00:00:00Z"), 7));
        assert!(marker.is_due(at("2026-01-12T00:00:00Z"), 7));
    }

    #[test]
    fn test_zero_interval_always_due() {
        let marker = LastRun {
            version: 1,
            last_run: Some(at("2026-01-05T00:00:00Z")),
        };
        assert!(marker.is_due(at("2026-01-05T00:00:00Z"), 0));
    }

    #[test]
    fn test_round_trip() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("review-gc/last-run.json");

        let marker = LastRun {
            version: 1,
            last_run: Some(at("2026-03-01T12:00:00+02:00")),
        };
        write_last_run(&path, &marker).unwrap();

        let loaded = load_last_run(&path).unwrap();
        assert_eq!(loaded.last_run, marker.last_run);
    }

    #[test]
    fn test_load_missing_returns_never() {
        let marker = load_last_run(Path::new("/nonexistent/last-run.json")).unwrap();
        assert!(marker.last_run.is_none());
    }

    #[test]
    fn test_load_corrupt_marker_is_error() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("last-run.json");
        fs::write(&path, "{ nope").unwrap();
        assert!(load_last_run(&path).is_err());
    }

    #[test]
    fn test_write_overwrites_completely() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("last-run.json");
        write_last_run(&path, &LastRun::now()).unwrap();
        write_last_run(&path, &LastRun::never()).unwrap();
        assert!(load_last_run(&path).unwrap().last_run.is_none());
    }
}
