use bb_data::MtimeStamp;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Path → stamp table for the parse session.
///
/// Stat failures collapse to [`MtimeStamp::ZERO`] and are never cached, so
/// a file that appears later is picked up by the next stamp. There is no
/// eviction; the table lives as long as the session.
#[derive(Debug, Default)]
pub struct MtimeCache {
    stamps: HashMap<PathBuf, MtimeStamp>,
}

impl MtimeCache {
    pub fn new() -> MtimeCache {
        MtimeCache::default()
    }

    /// Stamp `path`, stat'ing on first sight and caching the result.
    pub fn stamp(&mut self, path: &Path) -> std::io::Result<MtimeStamp> {
        if let Some(stamp) = self.stamps.get(path) {
            return Ok(*stamp);
        }
        let stamp = MtimeStamp::from_path(path)?;
        self.stamps.insert(path.to_path_buf(), stamp);
        Ok(stamp)
    }

    /// Like [`MtimeCache::stamp`] but absent files yield the zero sentinel
    /// without caching the failure.
    pub fn stamp_or_zero(&mut self, path: &Path) -> MtimeStamp {
        if let Some(stamp) = self.stamps.get(path) {
            return *stamp;
        }
        match MtimeStamp::from_path(path) {
            Ok(stamp) => {
                self.stamps.insert(path.to_path_buf(), stamp);
                stamp
            }
            Err(_) => MtimeStamp::ZERO,
        }
    }

    /// Re-stat `path`, refresh the table, and compare against `expected`.
    pub fn check(&mut self, path: &Path, expected: MtimeStamp) -> bool {
        let current = match MtimeStamp::from_path(path) {
            Ok(stamp) => {
                self.stamps.insert(path.to_path_buf(), stamp);
                stamp
            }
            Err(_) => MtimeStamp::ZERO,
        };
        current == expected
    }

    /// Refresh the stamp for `path` only if the table already holds one.
    pub fn update_if_present(&mut self, path: &Path) {
        if !self.stamps.contains_key(path) {
            return;
        }
        tracing::debug!(target = "bb.parse", path = %path.display(), "updating mtime cache");
        match MtimeStamp::from_path(path) {
            Ok(stamp) => {
                self.stamps.insert(path.to_path_buf(), stamp);
            }
            Err(_) => {
                self.stamps.remove(path);
            }
        }
    }

    pub fn clear(&mut self) {
        self.stamps.clear();
    }
}
