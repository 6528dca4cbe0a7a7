//! Cache attribution counters and parse timers.
//!
//! The parsing core bumps per-section hit/miss/eviction counters and
//! accumulates wall-clock time for timed sections. Totals are cumulative
//! for the sink's lifetime and are appended as one JSON record per
//! [`MetricsSink::flush`] to `<output dir>/bb-cache-metrics.jsonl`.
//!
//! Metrics must never interfere with parsing: every operation swallows
//! I/O and lock failures, dropping the update instead of surfacing an
//! error.

use serde_json::json;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

pub const METRICS_FILE_NAME: &str = "bb-cache-metrics.jsonl";

/// Attribution sections. Counter sections track cache churn; the
/// `ConfAstParse`/`ConfEval` sections are timer-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Section {
    Which,
    ResolveFile,
    Inherit,
    Include,
    ConfAst,
    Supports,
    IncludeIndex,
    ClassIndex,
    WhichDirIndex,
    ConfAstParse,
    ConfEval,
}

impl Section {
    pub fn as_str(self) -> &'static str {
        match self {
            Section::Which => "which",
            Section::ResolveFile => "resolve_file",
            Section::Inherit => "inherit",
            Section::Include => "include",
            Section::ConfAst => "conf_ast",
            Section::Supports => "supports",
            Section::IncludeIndex => "include_index",
            Section::ClassIndex => "class_index",
            Section::WhichDirIndex => "which_dir_index",
            Section::ConfAstParse => "conf_ast_parse",
            Section::ConfEval => "conf_eval",
        }
    }

    const COUNTERS: [Section; 9] = [
        Section::Which,
        Section::ResolveFile,
        Section::Inherit,
        Section::Include,
        Section::ConfAst,
        Section::Supports,
        Section::IncludeIndex,
        Section::ClassIndex,
        Section::WhichDirIndex,
    ];

    const TIMERS: [Section; 7] = [
        Section::Which,
        Section::ResolveFile,
        Section::Inherit,
        Section::Include,
        Section::ConfAstParse,
        Section::ConfEval,
        Section::Supports,
    ];
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TimeBucket {
    pub seconds: f64,
    pub count: u64,
}

/// Token returned by [`MetricsSink::time_start`]; hand it back to
/// [`MetricsSink::time_end`] to accumulate the elapsed interval.
#[derive(Debug)]
pub struct TimeToken {
    section: Section,
    started: Instant,
}

#[derive(Debug)]
struct Inner {
    totals: BTreeMap<&'static str, Counters>,
    times: BTreeMap<&'static str, TimeBucket>,
    output: Option<PathBuf>,
    seq: u64,
}

/// Serialised behind one lock so a shutdown-path flush can run while
/// parse-side updates continue.
#[derive(Debug)]
pub struct MetricsSink {
    inner: Mutex<Inner>,
}

impl Default for MetricsSink {
    fn default() -> MetricsSink {
        MetricsSink::new()
    }
}

impl MetricsSink {
    pub fn new() -> MetricsSink {
        let totals = Section::COUNTERS
            .iter()
            .map(|s| (s.as_str(), Counters::default()))
            .collect();
        let times = Section::TIMERS
            .iter()
            .map(|s| (s.as_str(), TimeBucket::default()))
            .collect();
        MetricsSink {
            inner: Mutex::new(Inner {
                totals,
                times,
                output: None,
                seq: 0,
            }),
        }
    }

    pub fn hit(&self, section: Section) {
        self.bump(section, |c| c.hits += 1);
    }

    pub fn miss(&self, section: Section) {
        self.bump(section, |c| c.misses += 1);
    }

    pub fn evict(&self, section: Section) {
        self.bump(section, |c| c.evictions += 1);
    }

    fn bump(&self, section: Section, apply: impl FnOnce(&mut Counters)) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        apply(inner.totals.entry(section.as_str()).or_default());
    }

    pub fn time_start(&self, section: Section) -> Option<TimeToken> {
        Some(TimeToken {
            section,
            started: Instant::now(),
        })
    }

    pub fn time_end(&self, token: Option<TimeToken>) {
        let Some(token) = token else { return };
        let elapsed = token.started.elapsed().as_secs_f64();
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        let bucket = inner.times.entry(token.section.as_str()).or_default();
        bucket.seconds += elapsed;
        bucket.count += 1;
    }

    /// Point the sink at the directory its record file lives in. Until this
    /// is called, flushes fall back to `$TMPDIR` (or `/tmp`).
    pub fn set_output_dir(&self, dir: impl Into<PathBuf>) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        inner.output = Some(dir.into().join(METRICS_FILE_NAME));
    }

    /// Snapshot of a counter section, for tests and embedders.
    pub fn counters(&self, section: Section) -> Counters {
        self.inner
            .lock()
            .ok()
            .and_then(|inner| inner.totals.get(section.as_str()).copied())
            .unwrap_or_default()
    }

    pub fn time_bucket(&self, section: Section) -> TimeBucket {
        self.inner
            .lock()
            .ok()
            .and_then(|inner| inner.times.get(section.as_str()).copied())
            .unwrap_or_default()
    }

    /// Append one cumulative record. Totals are not reset.
    pub fn flush(&self, note: &str) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        inner.seq += 1;

        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        let mut record = serde_json::Map::new();
        record.insert("ts".into(), json!(ts));
        record.insert("pid".into(), json!(std::process::id()));
        record.insert("seq".into(), json!(inner.seq));
        record.insert("note".into(), json!(note));
        for (name, counters) in &inner.totals {
            record.insert(
                (*name).into(),
                json!({
                    "hits": counters.hits,
                    "misses": counters.misses,
                    "evictions": counters.evictions,
                }),
            );
        }
        let times: serde_json::Map<String, serde_json::Value> = inner
            .times
            .iter()
            .map(|(name, bucket)| {
                (
                    (*name).to_string(),
                    json!({ "seconds": bucket.seconds, "count": bucket.count }),
                )
            })
            .collect();
        record.insert("time".into(), serde_json::Value::Object(times));

        let path = inner.output.clone().unwrap_or_else(|| {
            std::env::var_os("TMPDIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join(METRICS_FILE_NAME)
        });
        drop(inner);

        let line = serde_json::Value::Object(record).to_string();
        if let Err(err) = append_line(&path, &line) {
            tracing::debug!(
                target = "bb.metrics",
                path = %path.display(),
                error = %err,
                "dropping metrics flush"
            );
        }
    }
}

fn append_line(path: &std::path::Path, line: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    writeln!(file, "{line}")
}

impl Drop for MetricsSink {
    fn drop(&mut self) {
        self.flush("exit");
    }
}
