use crate::ast::StatementGroup;
use crate::cache::StatementCache;
use crate::conf;
use crate::error::ParseError;
use crate::index::{ClassIndex, IncludeIndex};
use crate::inherit;
use crate::lru::Lru;
use crate::mtime::MtimeCache;
use crate::recipe;
use crate::resolve::{self, FileResolver};
use bb_data::{keys, DataStore, Value};
use bb_metrics::{MetricsSink, Section};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Default bound on include/inherit recursion.
const DEFAULT_MAX_INCLUDE_DEPTH: usize = 1024;

/// Per-session snapshot of the cache-layer kill switches. A non-empty
/// value in the corresponding environment variable disables the layer;
/// all layers are on by default.
#[derive(Debug, Clone, Copy)]
pub struct CacheOptions {
    pub supports_cache: bool,
    pub resolve_cache: bool,
    pub include_lru: bool,
    pub include_index: bool,
    pub class_index: bool,
    pub conf_ast_cache: bool,
}

impl Default for CacheOptions {
    fn default() -> CacheOptions {
        CacheOptions {
            supports_cache: true,
            resolve_cache: true,
            include_lru: true,
            include_index: true,
            class_index: true,
            conf_ast_cache: true,
        }
    }
}

impl CacheOptions {
    pub fn from_env() -> CacheOptions {
        fn layer_enabled(var: &str) -> bool {
            std::env::var_os(var).map_or(true, |v| v.is_empty())
        }
        CacheOptions {
            supports_cache: layer_enabled("BB_OPT_DISABLE_SUPPORTS_CACHE"),
            resolve_cache: layer_enabled("BB_OPT_DISABLE_RESOLVE_CACHE"),
            include_lru: layer_enabled("BB_OPT_DISABLE_INCLUDE_LRU"),
            include_index: layer_enabled("BB_OPT_DISABLE_INCLUDE_INDEX"),
            class_index: layer_enabled("BB_OPT_DISABLE_CLASS_INDEX"),
            conf_ast_cache: layer_enabled("BB_OPT_DISABLE_CONF_AST_CACHE"),
        }
    }
}

/// Outcome of a `handle` call.
pub enum Handled {
    /// Statements were evaluated into the caller's datastore.
    Inline,
    /// A top-level recipe parse (or a skipped recipe): the finalised
    /// per-variant datastores, keyed by variant name ("" is the base).
    Variants(BTreeMap<String, Box<dyn DataStore>>),
}

impl std::fmt::Debug for Handled {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Handled::Inline => write!(f, "Handled::Inline"),
            Handled::Variants(variants) => {
                write!(f, "Handled::Variants({:?})", variants.keys().collect::<Vec<_>>())
            }
        }
    }
}

impl Handled {
    pub fn variants(self) -> Option<BTreeMap<String, Box<dyn DataStore>>> {
        match self {
            Handled::Inline => None,
            Handled::Variants(map) => Some(map),
        }
    }
}

/// Post-processor applied to a top-level recipe parse. The default drains
/// deferred inherits and returns the datastore as the sole variant.
pub type Finalizer = fn(
    &mut Parser,
    &Path,
    &mut dyn DataStore,
) -> Result<BTreeMap<String, Box<dyn DataStore>>, ParseError>;

/// One registered file handler. `supports` is consulted in registration
/// order, first match wins; the result is memoised per extension.
#[derive(Clone, Copy)]
pub struct HandlerEntry {
    pub name: &'static str,
    pub supports: fn(&Path) -> bool,
    pub handle:
        fn(&mut Parser, &Path, &mut dyn DataStore, bool, bool) -> Result<Handled, ParseError>,
    pub init: fn(&mut dyn DataStore),
}

type RecipeNameParts = (Option<String>, Option<String>, Option<String>);
type ResolveCacheEntry = (Option<PathBuf>, Arc<Vec<PathBuf>>);

/// A parse session: owns every cache and dispatches files to their
/// handlers. Sessions are single-threaded; parallelism comes from
/// sharding sessions (and datastores) across workers, with only the
/// metrics sink shared.
pub struct Parser {
    pub(crate) options: CacheOptions,
    pub(crate) metrics: Arc<MetricsSink>,
    pub(crate) mtimes: MtimeCache,
    pub(crate) resolver: FileResolver,
    pub(crate) include_cache: Lru<(String, String, String), ResolveCacheEntry>,
    pub(crate) include_index: IncludeIndex,
    pub(crate) class_index: ClassIndex,
    pub(crate) conf_cache: StatementCache,
    pub(crate) recipe_cache: StatementCache,
    pub(crate) inherit_memo: Lru<(String, String, String), ResolveCacheEntry>,
    pub(crate) finalizer: Finalizer,
    handlers: Vec<HandlerEntry>,
    supports_memo: HashMap<String, Option<usize>>,
    pkgsplit_memo: HashMap<String, RecipeNameParts>,
    include_depth: usize,
    max_include_depth: usize,
}

impl Default for Parser {
    fn default() -> Parser {
        Parser::new()
    }
}

impl Parser {
    /// Build a session with the cache switches snapshotted from the
    /// environment.
    pub fn new() -> Parser {
        Parser::with_options(CacheOptions::from_env())
    }

    pub fn with_options(options: CacheOptions) -> Parser {
        Parser {
            options,
            metrics: Arc::new(MetricsSink::new()),
            mtimes: MtimeCache::new(),
            resolver: FileResolver::new(),
            include_cache: Lru::new(conf::INCLUDE_RESOLVE_MAX),
            include_index: IncludeIndex::new(),
            class_index: ClassIndex::new(),
            conf_cache: StatementCache::new(),
            recipe_cache: StatementCache::new(),
            inherit_memo: Lru::new(inherit::INHERIT_MEMO_MAX),
            finalizer: default_finalizer,
            handlers: vec![conf::handler_entry(), recipe::handler_entry()],
            supports_memo: HashMap::new(),
            pkgsplit_memo: HashMap::new(),
            include_depth: 0,
            max_include_depth: DEFAULT_MAX_INCLUDE_DEPTH,
        }
    }

    pub fn metrics(&self) -> &Arc<MetricsSink> {
        &self.metrics
    }

    pub fn options(&self) -> CacheOptions {
        self.options
    }

    /// Replace the recipe finalizer (override/variant realisation).
    pub fn set_finalizer(&mut self, finalizer: Finalizer) {
        self.finalizer = finalizer;
    }

    pub fn set_max_include_depth(&mut self, depth: usize) {
        self.max_include_depth = depth.max(1);
    }

    /// Append a handler to the registry. Built-in handlers keep priority;
    /// the extension memo is reset so the new handler is consulted.
    pub fn register_handler(&mut self, entry: HandlerEntry) {
        self.handlers.push(entry);
        self.supports_memo.clear();
    }

    /// Parse `name` and evaluate it against `d`.
    ///
    /// `include` marks a nested parse (the `FILE` variable is restored on
    /// exit); `baseconfig` marks the bootstrap configuration pass, which
    /// is the only context where `addpylib` is legal.
    pub fn handle(
        &mut self,
        name: &Path,
        d: &mut dyn DataStore,
        include: bool,
        baseconfig: bool,
    ) -> Result<Handled, ParseError> {
        if self.include_depth >= self.max_include_depth {
            return Err(ParseError::IncludeDepth {
                depth: self.max_include_depth,
                filename: name.to_path_buf(),
            });
        }
        let Some(entry) = self.get_handler(name) else {
            return Err(ParseError::syntax("not a recognised build metadata file", name, 0));
        };

        self.include_depth += 1;
        d.inchistory_enter(&name.to_string_lossy());
        let result = (entry.handle)(self, name, d, include, baseconfig);
        d.inchistory_exit();
        self.include_depth -= 1;
        result
    }

    /// True when some registered handler accepts `name`.
    pub fn supports(&mut self, name: &Path) -> bool {
        self.get_handler(name).is_some()
    }

    /// Run the matching handler's init hook.
    pub fn init(&mut self, name: &Path, d: &mut dyn DataStore) {
        if let Some(entry) = self.get_handler(name) {
            (entry.init)(d);
        }
    }

    fn get_handler(&mut self, name: &Path) -> Option<HandlerEntry> {
        let ext = name
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| format!(".{e}"))
            .unwrap_or_default();

        if self.options.supports_cache {
            if let Some(&cached) = self.supports_memo.get(&ext) {
                self.metrics.hit(Section::Supports);
                return cached.map(|i| self.handlers[i]);
            }
        }
        let found = self.handlers.iter().position(|h| (h.supports)(name));
        if self.options.supports_cache {
            self.supports_memo.insert(ext, found);
        }
        self.metrics.miss(Section::Supports);
        found.map(|i| self.handlers[i])
    }

    /// Resolve a logical file name to an absolute path, marking every
    /// candidate on the dependency record.
    pub fn resolve_file(
        &mut self,
        name: &Path,
        d: &mut dyn DataStore,
    ) -> Result<PathBuf, ParseError> {
        let token = self.metrics.time_start(Section::ResolveFile);
        let resolved =
            self.resolver
                .resolve(name, d, &mut self.mtimes, &self.metrics, &self.options);
        self.metrics.time_end(token);
        resolved
    }

    /// Record `path` (with its current stamp) on `__depends`.
    pub fn mark_dependency(&mut self, d: &mut dyn DataStore, path: &Path) {
        resolve::mark_dependency(&mut self.mtimes, d, path);
    }

    /// True when `path` with its current stamp is already on `__depends`.
    pub fn check_dependency(&mut self, d: &dyn DataStore, path: &Path) -> bool {
        resolve::check_dependency(&mut self.mtimes, d, path)
    }

    /// Parse a recipe-grammar file to its statement tree without
    /// evaluating it. `.bbclass`/`.inc` trees come from (and feed) the
    /// statement cache.
    pub fn get_statements(
        &mut self,
        filename: &Path,
        absolute: &Path,
    ) -> Result<Arc<StatementGroup>, ParseError> {
        let root = filename
            .file_stem()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let base_name = filename
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let classname = if filename.extension().and_then(|e| e.to_str()) == Some("bbclass") {
            root
        } else {
            String::new()
        };
        recipe::get_statements(self, filename, absolute, &classname, &base_name)
    }

    /// Split a recipe file name into `(name, version, revision)`,
    /// underscore-separated with missing parts `None`.
    pub fn vars_from_file(&mut self, recipe: &Path) -> Result<RecipeNameParts, ParseError> {
        let name = recipe.to_string_lossy().into_owned();
        if name.is_empty() || !(name.ends_with(".bb") || name.ends_with(".bbappend")) {
            return Ok((None, None, None));
        }
        if let Some(parts) = self.pkgsplit_memo.get(&name) {
            return Ok(parts.clone());
        }

        let stem = recipe
            .file_stem()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let split: Vec<&str> = stem.split('_').collect();
        if split.len() > 3 {
            return Err(ParseError::syntax(
                "unable to generate default variables from filename (too many underscores)",
                recipe,
                0,
            ));
        }
        let parts = (
            split.first().map(|s| s.to_string()),
            split.get(1).map(|s| s.to_string()),
            split.get(2).map(|s| s.to_string()),
        );
        self.pkgsplit_memo.insert(name, parts.clone());
        Ok(parts)
    }

    /// Refresh the cached stamp for `path` if the session has seen it.
    pub fn update_mtime(&mut self, path: &Path) {
        self.mtimes.update_if_present(path);
    }

    pub fn clear_mtime_cache(&mut self) {
        self.mtimes.clear();
    }

    /// Drop both statement caches. Callers do this when directory
    /// fingerprints move under a live session.
    pub fn clear_statement_caches(&mut self) {
        self.conf_cache.clear();
        self.recipe_cache.clear();
    }

    /// `(conf trees, recipe trees)` currently memoised.
    pub fn statement_cache_sizes(&self) -> (usize, usize) {
        (self.conf_cache.len(), self.recipe_cache.len())
    }
}

/// Space-joined absolute paths of everything the parse consulted
/// (`__base_depends` then `__depends`).
pub fn get_file_depends(d: &dyn DataStore) -> String {
    let mut out = Vec::new();
    for key in [keys::BASE_DEPENDS, keys::DEPENDS] {
        if let Some(Value::Deps(deps)) = d.get(key, false) {
            for dep in deps {
                out.push(absolute_path(dep.path));
            }
        }
    }
    out.join(" ")
}

fn absolute_path(path: PathBuf) -> String {
    if path.is_absolute() {
        return path.display().to_string();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(&path))
        .unwrap_or(path)
        .display()
        .to_string()
}

/// Default recipe finalizer: run the deferred-inherit pass, then hand the
/// datastore back as the single variant.
fn default_finalizer(
    parser: &mut Parser,
    _filename: &Path,
    d: &mut dyn DataStore,
) -> Result<BTreeMap<String, Box<dyn DataStore>>, ParseError> {
    inherit::drain_deferred(parser, d)?;
    let mut variants = BTreeMap::new();
    variants.insert(String::new(), d.clone_box());
    Ok(variants)
}
