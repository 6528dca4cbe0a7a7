use crate::error::ParseError;
use crate::lru::Lru;
use crate::mtime::MtimeCache;
use crate::parser::CacheOptions;
use bb_data::{keys, DataStore, Dependency, Value};
use bb_metrics::{MetricsSink, Section};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Maximum memoised resolutions before LRU eviction kicks in.
const RESOLVE_CACHE_MAX: usize = 8192;

type ResolveKey = (String, bool, String);
type ResolveEntry = (Option<PathBuf>, Arc<Vec<PathBuf>>);

/// Search-path file resolution with memoised `(name, BBPATH)` lookups.
///
/// Resolution attempts are re-marked on the dependency record on every
/// call, hits included, so incremental rebuilds notice files that appear
/// earlier in the search path.
#[derive(Debug)]
pub(crate) struct FileResolver {
    cache: Lru<ResolveKey, ResolveEntry>,
}

impl FileResolver {
    pub(crate) fn new() -> FileResolver {
        Self::with_capacity(RESOLVE_CACHE_MAX)
    }

    fn with_capacity(capacity: usize) -> FileResolver {
        FileResolver {
            cache: Lru::new(capacity),
        }
    }

    pub(crate) fn resolve(
        &mut self,
        name: &Path,
        d: &mut dyn DataStore,
        mtimes: &mut MtimeCache,
        metrics: &MetricsSink,
        options: &CacheOptions,
    ) -> Result<PathBuf, ParseError> {
        // `./name` is anchored to the working directory, a single candidate.
        if let Ok(rest) = name.strip_prefix("./") {
            let rewritten = std::env::current_dir()?.join(rest);
            mark_dependency(mtimes, d, &rewritten);
            return finish(rewritten, || String::from("."));
        }

        if name.is_absolute() {
            mark_dependency(mtimes, d, name);
            return finish(name.to_path_buf(), || {
                name.parent()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default()
            });
        }

        let bbpath = d.get_str(keys::BBPATH, true).unwrap_or_default();
        let name_str = name.to_string_lossy().into_owned();
        let key: ResolveKey = (name_str.clone(), false, bbpath.clone());

        let (resolved, attempts) = match options
            .resolve_cache
            .then(|| self.cache.get(&key).cloned())
            .flatten()
        {
            Some(cached) => {
                metrics.hit(Section::ResolveFile);
                cached
            }
            None => {
                metrics.miss(Section::Which);
                let (resolved, attempts) = which(&bbpath, &name_str);
                let entry = (resolved, Arc::new(attempts));
                if options.resolve_cache && self.cache.insert(key, entry.clone()) {
                    metrics.evict(Section::ResolveFile);
                }
                metrics.miss(Section::ResolveFile);
                entry
            }
        };

        for attempt in attempts.iter() {
            mark_dependency(mtimes, d, attempt);
        }

        let Some(resolved) = resolved else {
            return Err(ParseError::NotFound {
                name: name.to_path_buf(),
                search_path: bbpath,
            });
        };
        finish(resolved, || bbpath.clone())
    }
}

fn finish(path: PathBuf, search_path: impl FnOnce() -> String) -> Result<PathBuf, ParseError> {
    if !path.exists() {
        return Err(ParseError::NotFound {
            name: path,
            search_path: search_path(),
        });
    }
    if !path.is_file() {
        return Err(ParseError::NotAFile { path });
    }
    Ok(path)
}

/// Walk `search_path` (colon-separated) for `name`. The first existing
/// candidate wins; every candidate tested is reported, winner included.
pub(crate) fn which(search_path: &str, name: &str) -> (Option<PathBuf>, Vec<PathBuf>) {
    let mut attempts = Vec::new();
    for dir in search_path.split(':').filter(|p| !p.is_empty()) {
        let candidate = Path::new(dir).join(name);
        attempts.push(candidate.clone());
        if candidate.exists() {
            return (Some(candidate), attempts);
        }
    }
    (None, attempts)
}

/// Record `path` on the datastore's dependency ledger, stamping it with the
/// session's mtime cache. Re-marking an already-recorded `(path, stamp)`
/// pair is a no-op.
pub(crate) fn mark_dependency(mtimes: &mut MtimeCache, d: &mut dyn DataStore, path: &Path) {
    let path = rewrite_dot(path);
    let stamp = mtimes.stamp_or_zero(&path);
    let dep = Dependency::new(path, stamp);
    let mut deps = match d.get(keys::DEPENDS, false) {
        Some(Value::Deps(deps)) => deps,
        _ => Vec::new(),
    };
    if !deps.contains(&dep) {
        deps.push(dep);
        d.set(keys::DEPENDS, Value::Deps(deps));
    }
}

/// True when `(path, current stamp)` is already on the ledger; used to warn
/// about duplicate inclusion.
pub(crate) fn check_dependency(mtimes: &mut MtimeCache, d: &dyn DataStore, path: &Path) -> bool {
    let path = rewrite_dot(path);
    let dep = Dependency::new(path.clone(), mtimes.stamp_or_zero(&path));
    match d.get(keys::DEPENDS, false) {
        Some(Value::Deps(deps)) => deps.contains(&dep),
        _ => false,
    }
}

fn rewrite_dot(path: &Path) -> PathBuf {
    match path.strip_prefix("./") {
        Ok(rest) => std::env::current_dir()
            .map(|cwd| cwd.join(rest))
            .unwrap_or_else(|_| path.to_path_buf()),
        Err(_) => path.to_path_buf(),
    }
}
