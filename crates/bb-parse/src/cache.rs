use crate::ast::StatementGroup;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Parsed-tree memoisation keyed by `(absolute path, flags)`.
///
/// Two instances exist per session: one for `.conf` trees (flag =
/// `baseconfig`) and one for recipe-grammar trees (`.bbclass`/`.inc` only;
/// `.bb` trees are never cached because their parse depends on caller
/// state). Only trees that parsed without error are inserted. Invalidation
/// is external: callers clear the cache when directory fingerprints move.
#[derive(Debug, Default)]
pub struct StatementCache {
    trees: HashMap<(PathBuf, bool), Arc<StatementGroup>>,
}

impl StatementCache {
    pub fn new() -> StatementCache {
        StatementCache::default()
    }

    pub fn get(&self, path: &Path, flags: bool) -> Option<Arc<StatementGroup>> {
        self.trees.get(&(path.to_path_buf(), flags)).cloned()
    }

    pub fn insert(&mut self, path: &Path, flags: bool, tree: Arc<StatementGroup>) {
        self.trees.insert((path.to_path_buf(), flags), tree);
    }

    pub fn len(&self) -> usize {
        self.trees.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trees.is_empty()
    }

    pub fn clear(&mut self) {
        self.trees.clear();
    }
}
