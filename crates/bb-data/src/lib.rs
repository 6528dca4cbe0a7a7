//! Datastore contract and shared value types for the Bakehouse parsing core.
//!
//! The parsing core never owns variable storage or expansion; it drives an
//! opaque datastore through the [`DataStore`] trait. This crate defines that
//! trait, the [`Value`] union stored under variable names, and the record
//! types the core keeps under reserved keys (`__depends`, `__inherit_cache`,
//! `__BBDEFINHERITS`). [`SimpleData`] is the reference in-memory
//! implementation used by tests and by embedders that do not bring their own
//! datastore.

mod store;
mod value;

pub use store::{DataStore, SimpleData};
pub use value::{DeferredInherit, Dependency, MtimeStamp, Value};

/// Reserved datastore keys interpreted by the parsing core.
pub mod keys {
    pub const BBPATH: &str = "BBPATH";
    pub const FILE: &str = "FILE";
    pub const TMPDIR: &str = "TMPDIR";
    pub const BB_DEFER_BBCLASSES: &str = "BB_DEFER_BBCLASSES";
    pub const DEPENDS: &str = "__depends";
    pub const BASE_DEPENDS: &str = "__base_depends";
    pub const INHERIT_CACHE: &str = "__inherit_cache";
    pub const DEFERRED_INHERITS: &str = "__BBDEFINHERITS";
    pub const SKIPPED: &str = "__SKIPPED";
    pub const CLASS_TYPE: &str = "__bbclasstype";
    pub const TASKS: &str = "__BBTASKS";
    pub const HANDLERS: &str = "__BBHANDLERS";
    pub const ANON_FUNCS: &str = "__BBANONFUNCS";
    pub const PYLIB_PATH: &str = "__pylib_path";
    pub const PYLIB_MODULES: &str = "__pylib_modules";
}
