use std::io;
use std::path::{Path, PathBuf};

/// File identity stamp: modification time in nanoseconds, size, and inode.
///
/// Absent files stamp as [`MtimeStamp::ZERO`]. Equality is exact; a stamp is
/// never "close enough".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MtimeStamp {
    pub mtime_ns: i128,
    pub size: u64,
    pub inode: u64,
}

impl MtimeStamp {
    /// Sentinel for paths that could not be stat'd.
    pub const ZERO: MtimeStamp = MtimeStamp {
        mtime_ns: 0,
        size: 0,
        inode: 0,
    };

    /// Stat `path` and build its stamp.
    pub fn from_path(path: &Path) -> io::Result<MtimeStamp> {
        let meta = std::fs::metadata(path)?;
        Ok(Self::from_metadata(&meta))
    }

    #[cfg(unix)]
    fn from_metadata(meta: &std::fs::Metadata) -> MtimeStamp {
        use std::os::unix::fs::MetadataExt;
        MtimeStamp {
            mtime_ns: i128::from(meta.mtime()) * 1_000_000_000 + i128::from(meta.mtime_nsec()),
            size: meta.len(),
            inode: meta.ino(),
        }
    }

    #[cfg(not(unix))]
    fn from_metadata(meta: &std::fs::Metadata) -> MtimeStamp {
        let mtime_ns = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_nanos() as i128)
            .unwrap_or(0);
        MtimeStamp {
            mtime_ns,
            size: meta.len(),
            inode: 0,
        }
    }

    pub fn is_zero(&self) -> bool {
        *self == MtimeStamp::ZERO
    }
}

/// One entry of the dependency record kept under `__depends`: a path the
/// resolver consulted and the stamp it carried when last marked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    pub path: PathBuf,
    pub stamp: MtimeStamp,
}

impl Dependency {
    pub fn new(path: impl Into<PathBuf>, stamp: MtimeStamp) -> Dependency {
        Dependency {
            path: path.into(),
            stamp,
        }
    }
}

/// A class inherit that was parked for a second evaluation phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeferredInherit {
    /// Unexpanded inherit expression (may name several classes).
    pub expression: String,
    /// File that requested the inherit.
    pub filename: PathBuf,
    pub lineno: u32,
}

/// A value stored under a datastore variable.
///
/// Plain metadata variables hold `Str`; the reserved bookkeeping keys hold
/// the list shapes. The parsing core only ever interprets list shapes for
/// the reserved names it owns.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Str(String),
    Bool(bool),
    /// Whitespace-ordered name list (`__BBTASKS`, `__BBHANDLERS`, ...).
    List(Vec<String>),
    /// Dependency record (`__depends`, `__base_depends`).
    Deps(Vec<Dependency>),
    /// Ordered path list (`__inherit_cache`).
    Paths(Vec<PathBuf>),
    /// Parked inherits (`__BBDEFINHERITS`).
    DeferredInherits(Vec<DeferredInherit>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// String rendering used by variable expansion and whitespace-list
    /// consumers. List shapes other than `List` have no string form.
    pub fn into_string(self) -> Option<String> {
        match self {
            Value::Str(s) => Some(s),
            Value::Bool(b) => Some(if b { "1" } else { "" }.to_string()),
            Value::List(items) => Some(items.join(" ")),
            _ => None,
        }
    }
}

impl From<String> for Value {
    fn from(s: String) -> Value {
        Value::Str(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Value {
        Value::Str(s.to_string())
    }
}
