use crate::lru::Lru;
use bb_data::MtimeStamp;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const INCLUDE_INDEX_MAX: usize = 256;
const CLASS_INDEX_MAX: usize = 128;

/// Identity of a directory list: `(dir, mtime_ns, inode)` per directory,
/// in order. Any mismatch forces an index rebuild; unreadable directories
/// contribute zeros.
pub(crate) type DirFingerprint = Vec<(PathBuf, i128, u64)>;

pub(crate) fn dirs_fingerprint(dirs: &[PathBuf]) -> DirFingerprint {
    dirs.iter()
        .map(|dir| match MtimeStamp::from_path(dir) {
            Ok(stamp) => (dir.clone(), stamp.mtime_ns, stamp.inode),
            Err(_) => (dir.clone(), 0, 0),
        })
        .collect()
}

#[derive(Debug)]
struct IndexEntry {
    fingerprint: DirFingerprint,
    mapping: Arc<HashMap<String, PathBuf>>,
}

/// Search directories for a relative include: the including file's
/// directory first, then every `BBPATH` component.
pub(crate) fn include_search_dirs(dname: &str, bbpath: &str) -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if !dname.is_empty() {
        dirs.push(PathBuf::from(dname));
    }
    dirs.extend(bbpath.split(':').filter(|p| !p.is_empty()).map(PathBuf::from));
    dirs
}

/// Filename → path index over an include search path.
///
/// Keyed by `(including dir, BBPATH)`; an entry stays current while its
/// directory fingerprint matches. First directory wins on duplicate names.
#[derive(Debug)]
pub(crate) struct IncludeIndex {
    cache: Lru<(String, String), IndexEntry>,
    rebuilds: u64,
}

impl IncludeIndex {
    pub(crate) fn new() -> IncludeIndex {
        IncludeIndex {
            cache: Lru::new(INCLUDE_INDEX_MAX),
            rebuilds: 0,
        }
    }

    pub(crate) fn get(&mut self, dname: &str, bbpath: &str) -> Arc<HashMap<String, PathBuf>> {
        let key = (dname.to_string(), bbpath.to_string());
        let dirs = include_search_dirs(dname, bbpath);
        let fingerprint = dirs_fingerprint(&dirs);

        if let Some(entry) = self.cache.get(&key) {
            if entry.fingerprint == fingerprint {
                return Arc::clone(&entry.mapping);
            }
        }

        let mapping = Arc::new(build_include_mapping(&dirs));
        self.rebuilds += 1;
        tracing::debug!(
            target = "bb.parse",
            dname,
            bbpath,
            entries = mapping.len(),
            "rebuilt include index"
        );
        self.cache.insert(
            key,
            IndexEntry {
                fingerprint,
                mapping: Arc::clone(&mapping),
            },
        );
        mapping
    }

    /// Resolve a basename include through the index. The attempt ledger
    /// covers every search directory regardless of where (or whether) the
    /// name was found.
    pub(crate) fn resolve(
        &mut self,
        dname: &str,
        bbpath: &str,
        filename: &str,
    ) -> (Option<PathBuf>, Vec<PathBuf>) {
        let mapping = self.get(dname, bbpath);
        let resolved = mapping.get(filename).cloned();
        let attempts = include_search_dirs(dname, bbpath)
            .iter()
            .map(|dir| dir.join(filename))
            .collect();
        (resolved, attempts)
    }

    #[cfg(test)]
    fn rebuild_count(&self) -> u64 {
        self.rebuilds
    }
}

fn build_include_mapping(dirs: &[PathBuf]) -> HashMap<String, PathBuf> {
    let mut mapping = HashMap::new();
    for dir in dirs {
        let Ok(entries) = std::fs::read_dir(dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            // Follows symlinks; only regular files are indexed.
            if !path.is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            mapping.entry(name).or_insert(path);
        }
    }
    mapping
}

/// Class name → path index per `(classtype, BBPATH)`.
///
/// The searched directories are `<layer>/classes-<classtype>` then
/// `<layer>/classes` for each layer, existing directories only. Keys are
/// class names with the `.bbclass` extension stripped.
#[derive(Debug)]
pub(crate) struct ClassIndex {
    cache: Lru<(String, String), IndexEntry>,
}

impl ClassIndex {
    pub(crate) fn new() -> ClassIndex {
        ClassIndex {
            cache: Lru::new(CLASS_INDEX_MAX),
        }
    }

    pub(crate) fn search_dirs(bbpath: &str, classtype: &str) -> Vec<PathBuf> {
        let mut dirs = Vec::new();
        for layer in bbpath.split(':').filter(|p| !p.is_empty()) {
            for sub in [format!("classes-{classtype}"), "classes".to_string()] {
                let dir = Path::new(layer).join(sub);
                if dir.is_dir() {
                    dirs.push(dir);
                }
            }
        }
        dirs
    }

    pub(crate) fn get(&mut self, bbpath: &str, classtype: &str) -> Arc<HashMap<String, PathBuf>> {
        let key = (classtype.to_string(), bbpath.to_string());
        let dirs = Self::search_dirs(bbpath, classtype);
        let fingerprint = dirs_fingerprint(&dirs);

        if let Some(entry) = self.cache.get(&key) {
            if entry.fingerprint == fingerprint {
                return Arc::clone(&entry.mapping);
            }
        }

        let mapping = Arc::new(build_class_mapping(&dirs));
        tracing::debug!(
            target = "bb.parse",
            bbpath,
            classtype,
            entries = mapping.len(),
            "rebuilt class index"
        );
        self.cache.insert(
            key,
            IndexEntry {
                fingerprint,
                mapping: Arc::clone(&mapping),
            },
        );
        mapping
    }
}

fn build_class_mapping(dirs: &[PathBuf]) -> HashMap<String, PathBuf> {
    let mut mapping = HashMap::new();
    for dir in dirs {
        let Ok(entries) = std::fs::read_dir(dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let Some(class) = name.strip_suffix(".bbclass") else {
                continue;
            };
            mapping
                .entry(class.to_string())
                .or_insert_with(|| entry.path());
        }
    }
    mapping
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn touch(path: &Path, contents: &str) {
        fs::write(path, contents).unwrap();
    }

    #[test]
    fn first_directory_wins() {
        let tmp = tempfile::tempdir().unwrap();
        let a = tmp.path().join("a");
        let b = tmp.path().join("b");
        fs::create_dir_all(&a).unwrap();
        fs::create_dir_all(&b).unwrap();
        touch(&a.join("common.inc"), "from a");
        touch(&b.join("common.inc"), "from b");
        touch(&b.join("only-b.inc"), "");

        let bbpath = format!("{}:{}", a.display(), b.display());
        let mut index = IncludeIndex::new();
        let (resolved, attempts) = index.resolve("", &bbpath, "common.inc");
        assert_eq!(resolved.as_deref(), Some(a.join("common.inc").as_path()));
        assert_eq!(attempts, vec![a.join("common.inc"), b.join("common.inc")]);

        let (resolved, _) = index.resolve("", &bbpath, "only-b.inc");
        assert_eq!(resolved.as_deref(), Some(b.join("only-b.inc").as_path()));
    }

    #[test]
    fn fingerprint_mismatch_triggers_rebuild() {
        let tmp = tempfile::tempdir().unwrap();
        let layer = tmp.path().join("layer");
        fs::create_dir_all(&layer).unwrap();
        touch(&layer.join("seen.inc"), "");

        let bbpath = layer.display().to_string();
        let mut index = IncludeIndex::new();
        index.get("", &bbpath);
        index.get("", &bbpath);
        assert_eq!(index.rebuild_count(), 1);

        // Adding a file moves the directory mtime, invalidating the entry.
        touch(&layer.join("fresh.inc"), "");
        bump_dir_mtime(&layer);
        let mapping = index.get("", &bbpath);
        assert_eq!(index.rebuild_count(), 2);
        assert!(mapping.contains_key("fresh.inc"));
    }

    #[test]
    fn class_index_prefers_classtype_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let layer = tmp.path().join("layer");
        fs::create_dir_all(layer.join("classes-recipe")).unwrap();
        fs::create_dir_all(layer.join("classes")).unwrap();
        touch(&layer.join("classes-recipe/base.bbclass"), "typed");
        touch(&layer.join("classes/base.bbclass"), "generic");
        touch(&layer.join("classes/extra.bbclass"), "");
        touch(&layer.join("classes/notes.txt"), "ignored");

        let bbpath = layer.display().to_string();
        let mut index = ClassIndex::new();
        let mapping = index.get(&bbpath, "recipe");
        assert_eq!(
            mapping.get("base"),
            Some(&layer.join("classes-recipe/base.bbclass"))
        );
        assert_eq!(mapping.get("extra"), Some(&layer.join("classes/extra.bbclass")));
        assert!(!mapping.contains_key("notes.txt"));
    }

    fn bump_dir_mtime(dir: &Path) {
        // Directory mtimes can have coarse granularity; rewriting an entry
        // twice with a sleep keeps the test robust on such filesystems.
        std::thread::sleep(std::time::Duration::from_millis(20));
        let marker = dir.join(".marker");
        fs::write(&marker, "x").unwrap();
        fs::remove_file(&marker).unwrap();
    }
}
