use crate::error::ParseError;
use crate::parser::Parser;
use crate::resolve;
use bb_data::{keys, DataStore, DeferredInherit, Value};
use bb_metrics::Section;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Maximum memoised class resolutions before LRU eviction kicks in.
pub(crate) const INHERIT_MEMO_MAX: usize = 8192;

type ResolvedClass = (Option<PathBuf>, Arc<Vec<PathBuf>>);

/// Compose the named classes into the datastore.
///
/// Names are expanded and split on whitespace. A name listed in
/// `BB_DEFER_BBCLASSES` is parked on `__BBDEFINHERITS` unless this *is*
/// the deferred pass. Each class is inherited at most once per datastore,
/// tracked through `__inherit_cache`.
pub(crate) fn inherit(
    parser: &mut Parser,
    classes: &str,
    from: &Path,
    lineno: u32,
    d: &mut dyn DataStore,
    deferred: bool,
) -> Result<(), ParseError> {
    let files = d.expand(classes);
    for file in files.split_whitespace() {
        let defer_list = d
            .get_str(keys::BB_DEFER_BBCLASSES, true)
            .unwrap_or_default();
        if !deferred && defer_list.split_whitespace().any(|c| c == file) {
            inherit_defer(file, from, lineno, d);
            continue;
        }

        let (resolved, attempts) = resolve_class(parser, file, d);
        for attempt in attempts.iter() {
            if Some(attempt) != resolved.as_ref() {
                parser.mark_dependency(d, attempt);
            }
        }

        let Some(class_path) = resolved else {
            return Err(ParseError::syntax(
                format!("could not inherit file {file}"),
                from,
                lineno,
            ));
        };
        if !class_path.exists() {
            return Err(ParseError::syntax(
                format!("could not inherit file {}", class_path.display()),
                from,
                lineno,
            ));
        }

        let mut cache = inherit_cache(d);
        if cache.iter().any(|p| p == &class_path) {
            continue;
        }
        tracing::debug!(
            target = "bb.parse",
            "inheriting {} (from {}:{})",
            class_path.display(),
            from.display(),
            lineno
        );
        cache.push(class_path.clone());
        d.set(keys::INHERIT_CACHE, Value::Paths(cache));

        match parser.handle(&class_path, d, true, false) {
            Ok(_) => {}
            Err(err) if err.is_not_found() => {
                return Err(ParseError::syntax(
                    format!("could not inherit file {}", class_path.display()),
                    from,
                    lineno,
                ));
            }
            Err(ParseError::Io(io)) => {
                return Err(ParseError::syntax(
                    format!("could not inherit file {}: {io}", class_path.display()),
                    from,
                    lineno,
                ));
            }
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

/// Park an inherit expression for the deferred pass.
pub(crate) fn inherit_defer(expression: &str, from: &Path, lineno: u32, d: &mut dyn DataStore) {
    let mut list = match d.get(keys::DEFERRED_INHERITS, false) {
        Some(Value::DeferredInherits(list)) => list,
        _ => Vec::new(),
    };
    list.push(DeferredInherit {
        expression: expression.to_string(),
        filename: from.to_path_buf(),
        lineno,
    });
    d.set(keys::DEFERRED_INHERITS, Value::DeferredInherits(list));
}

/// Re-enter the inherit engine for every parked inherit, front to back,
/// including any that the re-entry itself parks.
pub(crate) fn drain_deferred(parser: &mut Parser, d: &mut dyn DataStore) -> Result<(), ParseError> {
    loop {
        let mut list = match d.get(keys::DEFERRED_INHERITS, false) {
            Some(Value::DeferredInherits(list)) => list,
            _ => Vec::new(),
        };
        if list.is_empty() {
            return Ok(());
        }
        let next = list.remove(0);
        d.set(keys::DEFERRED_INHERITS, Value::DeferredInherits(list));
        inherit(parser, &next.expression, &next.filename, next.lineno, d, true)?;
    }
}

fn inherit_cache(d: &dyn DataStore) -> Vec<PathBuf> {
    match d.get(keys::INHERIT_CACHE, false) {
        Some(Value::Paths(paths)) => paths,
        _ => Vec::new(),
    }
}

/// Resolve an inherit target to a class file plus the attempt ledger.
///
/// Absolute names and explicit `.bbclass` references get an existence check
/// only. Hierarchical names walk the search path under the
/// `classes-<classtype>/` and `classes/` prefixes; bare names go through
/// the ClassIndex. Bare and hierarchical resolutions are memoised per
/// `(name, classtype, BBPATH)`.
fn resolve_class(parser: &mut Parser, origfile: &str, d: &mut dyn DataStore) -> ResolvedClass {
    let token = parser.metrics.time_start(Section::Inherit);
    let resolved = resolve_class_inner(parser, origfile, d);
    parser.metrics.time_end(token);
    resolved
}

fn resolve_class_inner(parser: &mut Parser, origfile: &str, d: &mut dyn DataStore) -> ResolvedClass {
    let path = Path::new(origfile);
    if path.is_absolute() || origfile.ends_with(".bbclass") {
        let resolved = path.exists().then(|| path.to_path_buf());
        return (resolved, Arc::new(Vec::new()));
    }

    let classtype = d.get_str(keys::CLASS_TYPE, false).unwrap_or_default();
    let bbpath = d.get_str(keys::BBPATH, true).unwrap_or_default();
    let key = (origfile.to_string(), classtype.clone(), bbpath.clone());

    if let Some(cached) = parser.inherit_memo.get(&key).cloned() {
        parser.metrics.hit(Section::Inherit);
        return cached;
    }
    parser.metrics.miss(Section::Inherit);

    let prefixes = [format!("classes-{classtype}"), "classes".to_string()];
    let mut attempts = Vec::new();
    let mut resolved = None;

    if origfile.contains('/') || !parser.options.class_index {
        for prefix in &prefixes {
            let candidate = format!("{prefix}/{origfile}.bbclass");
            parser.metrics.miss(Section::Which);
            let (found, walked) = resolve::which(&bbpath, &candidate);
            attempts.extend(walked);
            if let Some(found) = found {
                resolved = Some(found);
                break;
            }
        }
        if !origfile.contains('/') {
            parser.metrics.miss(Section::ClassIndex);
        }
    } else {
        let mapping = parser.class_index.get(&bbpath, &classtype);
        resolved = mapping.get(origfile).cloned();
        if resolved.is_some() {
            parser.metrics.hit(Section::ClassIndex);
        } else {
            parser.metrics.miss(Section::ClassIndex);
        }
        // The attempt ledger always covers every candidate in search order,
        // found or not.
        for layer in bbpath.split(':').filter(|p| !p.is_empty()) {
            for prefix in &prefixes {
                attempts.push(
                    Path::new(layer)
                        .join(prefix)
                        .join(format!("{origfile}.bbclass")),
                );
            }
        }
    }

    let entry: ResolvedClass = (resolved, Arc::new(attempts));
    if parser.inherit_memo.insert(key, entry.clone()) {
        parser.metrics.evict(Section::Inherit);
    }
    entry
}
