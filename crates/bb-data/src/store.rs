use crate::value::Value;
use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::sync::OnceLock;

/// Flag holding the weak default installed by `??=` assignments. Reads fall
/// back to it when the variable has no direct value.
pub const DEFAULTVAL_FLAG: &str = "_defaultval";

/// Iterative `${VAR}` passes before expansion gives up on a cycle.
const MAX_EXPANSION_PASSES: usize = 64;

/// The datastore the parsing core evaluates against.
///
/// The core treats the store as opaque: it reads and writes [`Value`]s,
/// asks the store to expand `${VAR}` references, and brackets includes with
/// the inclusion-history scope. Implementations that don't track inclusion
/// history keep the default no-ops.
pub trait DataStore {
    fn get(&self, name: &str, expand: bool) -> Option<Value>;
    fn set(&mut self, name: &str, value: Value);
    fn del_var(&mut self, name: &str);

    /// `get` without the `_defaultval` fallback. Assignment evaluation reads
    /// through this so a weak default neither blocks `?=` nor feeds the
    /// concatenation operators.
    fn get_no_default(&self, name: &str) -> Option<Value>;

    fn get_flag(&self, name: &str, flag: &str) -> Option<String>;
    fn set_flag(&mut self, name: &str, flag: &str, value: &str);
    fn del_flag(&mut self, name: &str, flag: &str);

    fn expand(&self, s: &str) -> String;

    /// Owned snapshot across the object-safe boundary, used when a parse
    /// produces per-variant datastore copies.
    fn clone_box(&self) -> Box<dyn DataStore>;

    fn inchistory_enter(&mut self, _name: &str) {}
    fn inchistory_exit(&mut self) {}

    /// `get` narrowed to the string rendering of the value.
    fn get_str(&self, name: &str, expand: bool) -> Option<String> {
        self.get(name, expand)?.into_string()
    }

    fn set_str(&mut self, name: &str, value: &str) {
        self.set(name, Value::Str(value.to_string()));
    }
}

#[derive(Debug, Clone, Default)]
struct VarEntry {
    value: Option<Value>,
    flags: BTreeMap<String, String>,
}

/// Reference in-memory datastore.
///
/// Variables map to a value plus a flag table. Expansion substitutes
/// `${VAR}` references iteratively, leaving unresolvable references in
/// place, and honours the `_defaultval` fallback installed by `??=`.
#[derive(Debug, Clone, Default)]
pub struct SimpleData {
    vars: HashMap<String, VarEntry>,
    inchistory: Vec<String>,
}

impl SimpleData {
    pub fn new() -> SimpleData {
        SimpleData::default()
    }

    /// The inclusion chain currently open, outermost first.
    pub fn include_history(&self) -> &[String] {
        &self.inchistory
    }

    fn lookup(&self, name: &str) -> Option<Value> {
        let entry = self.vars.get(name)?;
        if let Some(value) = &entry.value {
            return Some(value.clone());
        }
        entry
            .flags
            .get(DEFAULTVAL_FLAG)
            .map(|v| Value::Str(v.clone()))
    }
}

fn reference_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\$\{([a-zA-Z0-9\-_+./~:]+)\}").expect("variable reference regex should compile")
    })
}

impl DataStore for SimpleData {
    fn get(&self, name: &str, expand: bool) -> Option<Value> {
        let value = self.lookup(name)?;
        if expand {
            if let Value::Str(s) = &value {
                return Some(Value::Str(self.expand(s)));
            }
        }
        Some(value)
    }

    fn get_no_default(&self, name: &str) -> Option<Value> {
        self.vars.get(name)?.value.clone()
    }

    fn set(&mut self, name: &str, value: Value) {
        self.vars.entry(name.to_string()).or_default().value = Some(value);
    }

    fn del_var(&mut self, name: &str) {
        self.vars.remove(name);
    }

    fn get_flag(&self, name: &str, flag: &str) -> Option<String> {
        self.vars.get(name)?.flags.get(flag).cloned()
    }

    fn set_flag(&mut self, name: &str, flag: &str, value: &str) {
        self.vars
            .entry(name.to_string())
            .or_default()
            .flags
            .insert(flag.to_string(), value.to_string());
    }

    fn del_flag(&mut self, name: &str, flag: &str) {
        if let Some(entry) = self.vars.get_mut(name) {
            entry.flags.remove(flag);
        }
    }

    fn expand(&self, s: &str) -> String {
        if !s.contains("${") {
            return s.to_string();
        }
        let re = reference_regex();
        let mut current = s.to_string();
        for _ in 0..MAX_EXPANSION_PASSES {
            let mut changed = false;
            let next = re
                .replace_all(&current, |caps: &regex::Captures<'_>| {
                    match self.lookup(&caps[1]).and_then(Value::into_string) {
                        Some(replacement) => {
                            changed = true;
                            replacement
                        }
                        // Unresolvable references stay verbatim.
                        None => caps[0].to_string(),
                    }
                })
                .into_owned();
            current = next;
            if !changed {
                break;
            }
        }
        current
    }

    fn clone_box(&self) -> Box<dyn DataStore> {
        Box::new(self.clone())
    }

    fn inchistory_enter(&mut self, name: &str) {
        self.inchistory.push(name.to_string());
    }

    fn inchistory_exit(&mut self) {
        self.inchistory.pop();
    }
}
