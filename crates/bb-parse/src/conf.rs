use crate::ast::{AssignOp, StatementGroup, StatementKind};
use crate::error::ParseError;
use crate::parser::{Handled, HandlerEntry, Parser};
use crate::resolve;
use bb_data::{keys, DataStore};
use bb_metrics::Section;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

/// Maximum memoised include resolutions before LRU eviction kicks in.
pub(crate) const INCLUDE_RESOLVE_MAX: usize = 8192;

pub(crate) fn handler_entry() -> HandlerEntry {
    HandlerEntry {
        name: "conf",
        supports,
        handle,
        init,
    }
}

fn supports(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some("conf")
}

fn init(_d: &mut dyn DataStore) {}

fn handle(
    parser: &mut Parser,
    path: &Path,
    d: &mut dyn DataStore,
    include: bool,
    baseconfig: bool,
) -> Result<Handled, ParseError> {
    if let Some(tmpdir) = d.get_str(keys::TMPDIR, true) {
        if !tmpdir.is_empty() {
            parser.metrics.set_output_dir(tmpdir);
        }
    }

    let result = handle_inner(parser, path, d, include, baseconfig);
    if !include {
        parser.metrics.flush("confhandler");
    }
    result
}

fn handle_inner(
    parser: &mut Parser,
    path: &Path,
    d: &mut dyn DataStore,
    include: bool,
    baseconfig: bool,
) -> Result<Handled, ParseError> {
    let oldfile = if include {
        d.get_str(keys::FILE, false)
    } else {
        None
    };

    let abs = parser.resolve_file(path, d)?;
    let statements = conf_statements(parser, &abs, baseconfig)?;

    d.set_str(keys::FILE, &abs.display().to_string());
    let token = parser.metrics.time_start(Section::ConfEval);
    let evaluated = statements.eval(parser, d);
    parser.metrics.time_end(token);
    evaluated?;

    if let Some(oldfile) = oldfile {
        d.set_str(keys::FILE, &oldfile);
    }
    Ok(Handled::Inline)
}

/// Fetch or parse the statement tree for a `.conf` file, keyed on
/// `(absolute path, baseconfig)`. Only clean parses are cached.
fn conf_statements(
    parser: &mut Parser,
    abs: &Path,
    baseconfig: bool,
) -> Result<Arc<StatementGroup>, ParseError> {
    if parser.options.conf_ast_cache {
        if let Some(tree) = parser.conf_cache.get(abs, baseconfig) {
            parser.metrics.hit(Section::ConfAst);
            return Ok(tree);
        }
    }

    let token = parser.metrics.time_start(Section::ConfAstParse);
    let parsed = parse_conf_file(abs, baseconfig);
    parser.metrics.time_end(token);

    let tree = Arc::new(parsed?);
    if parser.options.conf_ast_cache {
        parser.conf_cache.insert(abs, baseconfig, Arc::clone(&tree));
    }
    parser.metrics.miss(Section::ConfAst);
    Ok(tree)
}

fn parse_conf_file(abs: &Path, baseconfig: bool) -> Result<StatementGroup, ParseError> {
    let text = std::fs::read_to_string(abs)?;
    let mut statements = StatementGroup::new();
    let lines: Vec<&str> = text.lines().collect();

    let mut i = 0;
    while i < lines.len() {
        let origlineno = i + 1;
        let raw = lines[i];
        i += 1;
        if raw.trim().is_empty() {
            continue;
        }

        let mut s = raw.trim_end().to_string();
        while s.ends_with('\\') {
            let Some(&next) = lines.get(i) else {
                break;
            };
            i += 1;
            let s2 = next.trim_end();
            if (s2.is_empty() || !s2.starts_with('#')) && s.starts_with('#') {
                return Err(ParseError::fatal(format!(
                    "confusing multiline, partially commented expression starting on line {} of {}",
                    origlineno,
                    abs.display()
                )));
            }
            s.pop();
            s.push_str(s2);
        }

        if s.starts_with('#') {
            continue;
        }
        feeder(i as u32, &s, abs, &mut statements, baseconfig, true)?;
    }
    Ok(statements)
}

fn assignment_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(concat!(
            r"^(?:(?P<exp>export)\s+)?",
            r"(?P<var>[a-zA-Z0-9\-_+.${}/~:]*?)",
            r"(?:\[(?P<flag>[a-zA-Z0-9\-_+.][a-zA-Z0-9\-_+.@/]*)\])?",
            r"(?P<ws>\s*)(?P<op>:=|\?\?=|\?=|\+=|=\+|=\.|\.=|=)(?P<ws2>\s*)",
            r"(?P<rest>.*)$",
        ))
        .expect("assignment regex should compile")
    })
}

fn simple_regex(pattern: &'static str, cell: &'static OnceLock<Regex>) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).expect("config line regex should compile"))
}

macro_rules! line_regex {
    ($pattern:literal) => {{
        static RE: OnceLock<Regex> = OnceLock::new();
        simple_regex($pattern, &RE)
    }};
}

/// Validate the quoted right-hand side of an assignment. Returns the value
/// between the outer quotes, or `None` when the text is not a single
/// well-delimited quoted string. A value containing exactly one copy of its
/// own delimiter is the ambiguous three-quote form and is rejected.
fn quoted_value(rest: &str) -> Option<&str> {
    let quote = rest.chars().next()?;
    if quote != '"' && quote != '\'' {
        return None;
    }
    if rest.len() < 2 || !rest.ends_with(quote) {
        return None;
    }
    let value = &rest[1..rest.len() - 1];
    if value.matches(quote).count() == 1 {
        return None;
    }
    Some(value)
}

/// Dispatch one logical config line. Patterns are anchored; first match
/// wins in the order listed. An unmatched non-empty line is a parse error.
pub(crate) fn feeder(
    lineno: u32,
    s: &str,
    filename: &Path,
    statements: &mut StatementGroup,
    baseconfig: bool,
    conffile: bool,
) -> Result<(), ParseError> {
    if let Some(caps) = assignment_regex().captures(s) {
        if let Some(value) = quoted_value(caps.name("rest").map_or("", |m| m.as_str())) {
            let var = &caps["var"];
            if var.is_empty() {
                return Err(ParseError::syntax(
                    format!("empty variable name in assignment: '{s}'"),
                    filename,
                    lineno,
                ));
            }
            if caps["ws"].is_empty() || caps["ws2"].is_empty() {
                tracing::warn!(
                    target = "bb.parse",
                    "{}:{} has a lack of whitespace around the assignment: '{}'",
                    filename.display(),
                    lineno,
                    s
                );
            }
            let op = match &caps["op"] {
                ":=" => AssignOp::Immediate,
                "??=" => AssignOp::WeakDefault,
                "?=" => AssignOp::Default,
                "+=" => AssignOp::Append,
                "=+" => AssignOp::Prepend,
                ".=" => AssignOp::PostDot,
                "=." => AssignOp::PreDot,
                _ => AssignOp::Assign,
            };
            statements.push(
                filename,
                lineno,
                StatementKind::DataAssign {
                    var: var.to_string(),
                    flag: caps.name("flag").map(|m| m.as_str().to_string()),
                    exported: caps.name("exp").is_some(),
                    op,
                    value: value.to_string(),
                },
            );
            return Ok(());
        }
    }

    if let Some(caps) = line_regex!(r"^include\s+(.+)$").captures(s) {
        statements.push(
            filename,
            lineno,
            StatementKind::Include {
                what: caps[1].to_string(),
                required: false,
            },
        );
        return Ok(());
    }

    if let Some(caps) = line_regex!(r"^require\s+(.+)$").captures(s) {
        statements.push(
            filename,
            lineno,
            StatementKind::Include {
                what: caps[1].to_string(),
                required: true,
            },
        );
        return Ok(());
    }

    if let Some(caps) = line_regex!(r"^include_all\s+(.+)$").captures(s) {
        statements.push(
            filename,
            lineno,
            StatementKind::IncludeAll {
                what: caps[1].to_string(),
            },
        );
        return Ok(());
    }

    if let Some(caps) = line_regex!(r"^export\s+([a-zA-Z0-9\-_+.${}/~]+)$").captures(s) {
        statements.push(
            filename,
            lineno,
            StatementKind::Export {
                var: caps[1].to_string(),
            },
        );
        return Ok(());
    }

    if let Some(caps) = line_regex!(r"^unset\s+([a-zA-Z0-9\-_+.${}/~]+)$").captures(s) {
        statements.push(
            filename,
            lineno,
            StatementKind::Unset {
                var: caps[1].to_string(),
            },
        );
        return Ok(());
    }

    if let Some(caps) =
        line_regex!(r"^unset\s+([a-zA-Z0-9\-_+.${}/~]+)\[([a-zA-Z0-9\-_+.][a-zA-Z0-9\-_+.@]+)\]$")
            .captures(s)
    {
        statements.push(
            filename,
            lineno,
            StatementKind::UnsetFlag {
                var: caps[1].to_string(),
                flag: caps[2].to_string(),
            },
        );
        return Ok(());
    }

    if baseconfig && conffile {
        if let Some(caps) = line_regex!(r"^addpylib\s+(.+)\s+(\S+)$").captures(s) {
            statements.push(
                filename,
                lineno,
                StatementKind::AddPyLib {
                    dir: caps[1].to_string(),
                    module: caps[2].to_string(),
                },
            );
            return Ok(());
        }
    }

    if let Some(caps) = line_regex!(r"^addfragments\s+(\S+)\s+(\S+)\s+(\S+)\s+(\S+)$").captures(s) {
        statements.push(
            filename,
            lineno,
            StatementKind::AddFragments {
                path_prefix: caps[1].to_string(),
                fragments_var: caps[2].to_string(),
                flagged_var: caps[3].to_string(),
                builtin_var: caps[4].to_string(),
            },
        );
        return Ok(());
    }

    Err(ParseError::syntax(
        format!("unparsed line: '{s}'"),
        filename,
        lineno,
    ))
}

/// Expand and split an include expression, then include each file.
pub(crate) fn include(
    parser: &mut Parser,
    parent: &Path,
    fns: &str,
    lineno: u32,
    d: &mut dyn DataStore,
    error_verb: Option<&str>,
) -> Result<(), ParseError> {
    let fns = d.expand(fns);
    let parent = PathBuf::from(d.expand(&parent.to_string_lossy()));
    for name in fns.split_whitespace() {
        include_single_file(parser, &parent, name, lineno, d, error_verb)?;
    }
    Ok(())
}

/// Include one file without expanding or splitting its name.
///
/// Self-inclusion is a no-op that marks nothing. Relative names search the
/// including file's directory first, then `BBPATH`, through an LRU-fronted
/// directory index; every candidate is marked on the dependency record.
pub(crate) fn include_single_file(
    parser: &mut Parser,
    parent: &Path,
    name: &str,
    lineno: u32,
    d: &mut dyn DataStore,
    error_verb: Option<&str>,
) -> Result<(), ParseError> {
    if Path::new(name) == parent {
        return Ok(());
    }

    let mut target = PathBuf::from(name);
    if !target.is_absolute() {
        let dname = parent
            .parent()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        let bbpath = d.get_str(keys::BBPATH, true).unwrap_or_default();
        let key = (name.to_string(), dname.clone(), bbpath.clone());

        let cached = parser
            .options
            .include_lru
            .then(|| parser.include_cache.get(&key).cloned())
            .flatten();
        let (resolved, attempts) = match cached {
            Some(entry) => {
                parser.metrics.hit(Section::Include);
                entry
            }
            None => {
                let token = parser.metrics.time_start(Section::Include);
                let use_index = !name.contains('/') && parser.options.include_index;
                let (resolved, attempts) = if use_index {
                    let (resolved, attempts) = parser.include_index.resolve(&dname, &bbpath, name);
                    if resolved.is_some() {
                        parser.metrics.hit(Section::IncludeIndex);
                    } else {
                        parser.metrics.miss(Section::IncludeIndex);
                    }
                    (resolved, attempts)
                } else {
                    let search = if dname.is_empty() {
                        bbpath.clone()
                    } else {
                        format!("{dname}:{bbpath}")
                    };
                    parser.metrics.miss(Section::Which);
                    let walked = resolve::which(&search, name);
                    if !name.contains('/') {
                        parser.metrics.miss(Section::IncludeIndex);
                    }
                    walked
                };
                parser.metrics.time_end(token);

                let entry = (resolved, Arc::new(attempts));
                if parser.options.include_lru
                    && parser.include_cache.insert(key, entry.clone())
                {
                    parser.metrics.evict(Section::Include);
                }
                parser.metrics.miss(Section::Include);
                entry
            }
        };

        if let Some(resolved) = &resolved {
            if parser.check_dependency(d, resolved) {
                warn_duplicate_inclusion(d, resolved);
            }
        }
        for attempt in attempts.iter() {
            parser.mark_dependency(d, attempt);
        }
        if let Some(resolved) = resolved {
            target = resolved;
        }
    } else if parser.check_dependency(d, &target) {
        warn_duplicate_inclusion(d, &target);
    }

    match parser.handle(&target, d, true, false) {
        Ok(_) => Ok(()),
        Err(err) if err.is_not_found() => match error_verb {
            Some(verb) => Err(ParseError::syntax(
                format!("could not {verb} file {}", target.display()),
                parent,
                lineno,
            )),
            None => {
                tracing::debug!(
                    target = "bb.parse",
                    "include file '{}' not found",
                    target.display()
                );
                Ok(())
            }
        },
        Err(ParseError::Io(io)) => {
            let msg = match error_verb {
                Some(verb) => format!("could not {verb} file {}: {io}", target.display()),
                None => format!("error parsing {}: {io}", target.display()),
            };
            Err(ParseError::syntax(msg, parent, lineno))
        }
        Err(err) => Err(err),
    }
}

fn warn_duplicate_inclusion(d: &dyn DataStore, path: &Path) {
    tracing::warn!(
        target = "bb.parse",
        "duplicate inclusion for {} in {}",
        path.display(),
        d.get_str(keys::FILE, false).unwrap_or_default()
    );
}
