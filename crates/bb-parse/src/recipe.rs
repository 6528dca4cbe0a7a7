use crate::ast::{StatementGroup, StatementKind};
use crate::conf;
use crate::error::ParseError;
use crate::parser::{Handled, HandlerEntry, Parser};
use bb_data::{keys, DataStore, Value};
use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

/// Mutation keywords that may not appear in task names.
const SETVAR_KEYWORDS: [&str; 3] = ["append", "prepend", "remove"];

pub(crate) fn handler_entry() -> HandlerEntry {
    HandlerEntry {
        name: "recipe",
        supports,
        handle,
        init,
    }
}

fn supports(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("bb") | Some("bbclass") | Some("inc")
    )
}

fn init(_d: &mut dyn DataStore) {}

/// Per-call parser state for the recipe grammar. A fresh instance is built
/// for every parse; nothing is shared across calls.
pub(crate) struct RecipeParser {
    infunc: Option<FuncHead>,
    inpython: Option<String>,
    body: Vec<String>,
    residue: Vec<String>,
    classname: String,
    root: String,
}

struct FuncHead {
    name: String,
    filename: PathBuf,
    lineno: u32,
    python: bool,
    fakeroot: bool,
}

impl RecipeParser {
    fn new(classname: &str, root: &str) -> RecipeParser {
        RecipeParser {
            infunc: None,
            inpython: None,
            body: Vec::new(),
            residue: Vec::new(),
            classname: classname.to_string(),
            root: root.to_string(),
        }
    }

    fn feeder(
        &mut self,
        lineno: u32,
        s: &str,
        filename: &Path,
        statements: &mut StatementGroup,
        eof: bool,
    ) -> Result<(), ParseError> {
        let in_python_func = self.inpython.is_some()
            || self
                .infunc
                .as_ref()
                .is_some_and(|head| head.name == "__anonymous" || head.python);
        if in_python_func && has_tab_indent(s) {
            tracing::warn!(
                target = "bb.parse",
                "python functions should use 4 spaces indentation, but found tabs in {}, line {}",
                self.root,
                lineno
            );
        }

        if let Some(head) = &self.infunc {
            if s == "}" {
                self.body.push(String::new());
                statements.push(
                    filename,
                    lineno,
                    StatementKind::ShellMethod {
                        name: head.name.clone(),
                        python: head.python,
                        fakeroot: head.fakeroot,
                        body: std::mem::take(&mut self.body),
                    },
                );
                self.infunc = None;
            } else {
                self.body.push(s.to_string());
            }
            return Ok(());
        }

        if let Some(name) = &self.inpython {
            if continues_python_body(s) && !eof {
                self.body.push(s.to_string());
                return Ok(());
            }
            statements.push(
                filename,
                lineno,
                StatementKind::LanguageMethod {
                    name: name.clone(),
                    root: self.root.clone(),
                    body: std::mem::take(&mut self.body),
                },
            );
            self.inpython = None;
            if eof {
                return Ok(());
            }
            // The current line closed the body; it still needs parsing.
        }

        if s.starts_with('#')
            && !self.residue.is_empty()
            && !self.residue[0].starts_with('#')
        {
            return Err(ParseError::fatal(format!(
                "comment on line {} of {} is in the middle of a multiline expression",
                lineno,
                filename.display()
            )));
        }

        if !self.residue.is_empty()
            && self.residue[0].starts_with('#')
            && (s.is_empty() || !s.starts_with('#'))
        {
            return Err(ParseError::fatal(format!(
                "confusing multiline, partially commented expression ending on line {} of {}",
                lineno,
                filename.display()
            )));
        }

        if let Some(stripped) = s.strip_suffix('\\') {
            self.residue.push(stripped.to_string());
            return Ok(());
        }

        let joined = if self.residue.is_empty() {
            s.to_string()
        } else {
            let mut joined = self.residue.concat();
            joined.push_str(s);
            self.residue.clear();
            joined
        };
        let s = joined.as_str();

        if s.is_empty() {
            return Ok(());
        }
        if s.starts_with('#') {
            return Ok(());
        }

        if let Some((name, python, fakeroot)) = parse_func_start(s) {
            self.infunc = Some(FuncHead {
                name: name.unwrap_or_else(|| "__anonymous".to_string()),
                filename: filename.to_path_buf(),
                lineno,
                python,
                fakeroot,
            });
            return Ok(());
        }

        if let Some(caps) = def_regex().captures(s) {
            self.body.push(s.to_string());
            self.inpython = Some(caps[1].to_string());
            return Ok(());
        }

        if let Some(caps) = export_funcs_regex().captures(s) {
            statements.push(
                filename,
                lineno,
                StatementKind::ExportFuncs {
                    names: caps[1].split_whitespace().map(str::to_string).collect(),
                    classname: self.classname.clone(),
                },
            );
            return Ok(());
        }

        if let Some(caps) = addtask_regex().captures(s) {
            check_reserved_task_keywords(s, filename, lineno)?;
            let expr = caps[1].trim();
            let (tasks, before, after) = split_task_clauses(expr);
            statements.push(
                filename,
                lineno,
                StatementKind::AddTask {
                    tasks,
                    before,
                    after,
                },
            );
            return Ok(());
        }

        if let Some(caps) = deltask_regex().captures(s) {
            statements.push(
                filename,
                lineno,
                StatementKind::DelTask {
                    tasks: caps[1]
                        .trim()
                        .split_whitespace()
                        .map(str::to_string)
                        .collect(),
                },
            );
            return Ok(());
        }

        if let Some(caps) = addhandler_regex().captures(s) {
            statements.push(
                filename,
                lineno,
                StatementKind::AddHandler {
                    handlers: caps[1].split_whitespace().map(str::to_string).collect(),
                },
            );
            return Ok(());
        }

        if let Some(caps) = inherit_regex().captures(s) {
            statements.push(
                filename,
                lineno,
                StatementKind::Inherit {
                    classes: caps[1].to_string(),
                },
            );
            return Ok(());
        }

        if let Some(caps) = inherit_defer_regex().captures(s) {
            statements.push(
                filename,
                lineno,
                StatementKind::InheritDeferred {
                    expression: caps[1].to_string(),
                },
            );
            return Ok(());
        }

        conf::feeder(lineno, s, filename, statements, false, false)
    }

    fn finish(
        &mut self,
        last_lineno: u32,
        filename: &Path,
        statements: &mut StatementGroup,
    ) -> Result<(), ParseError> {
        if self.inpython.is_some() {
            // A blank EOF line closes out any open embedded definition.
            self.feeder(last_lineno, "", filename, statements, true)?;
        }
        if let Some(head) = &self.infunc {
            return Err(ParseError::syntax(
                format!("shell function {} is never closed", head.name),
                head.filename.clone(),
                head.lineno,
            ));
        }
        if !self.residue.is_empty() {
            return Err(ParseError::syntax(
                format!("unparsed lines from incomplete expression: {:?}", self.residue),
                filename,
                last_lineno,
            ));
        }
        Ok(())
    }
}

fn has_tab_indent(s: &str) -> bool {
    s.trim_start_matches(' ').starts_with('\t')
}

/// Embedded-language bodies continue over indented, blank, or comment lines.
fn continues_python_body(s: &str) -> bool {
    s.is_empty() || s.starts_with('#') || s.chars().next().is_some_and(char::is_whitespace)
}

/// Recognise `[python ][fakeroot ]NAME() {` openers. The keywords are
/// stripped by hand (`python` may be glued to the parens, as in
/// `python() {`); the remainder must be exactly the parenthesised opener.
fn parse_func_start(s: &str) -> Option<(Option<String>, bool, bool)> {
    let mut rest = s.trim_start();
    let mut python = false;
    let mut fakeroot = false;
    loop {
        if let Some(after) = rest.strip_prefix("python") {
            if after.starts_with('(') || after.starts_with(|c: char| c.is_whitespace()) {
                python = true;
                rest = after.trim_start();
                continue;
            }
        }
        if let Some(after) = rest.strip_prefix("fakeroot") {
            if after.starts_with(|c: char| c.is_whitespace()) {
                fakeroot = true;
                rest = after.trim_start();
                continue;
            }
        }
        break;
    }

    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"^(?P<func>[\w.\-+{}$:]+)?\s*\(\s*\)\s*\{$")
            .expect("function opener regex should compile")
    });
    let caps = re.captures(rest)?;
    Some((
        caps.name("func").map(|m| m.as_str().to_string()),
        python,
        fakeroot,
    ))
}

fn def_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^def\s+(\w+).*:").expect("def regex should compile"))
}

fn export_funcs_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^EXPORT_FUNCTIONS\s+(.+)$").expect("EXPORT_FUNCTIONS regex should compile")
    })
}

fn addtask_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^addtask\s+([^#\n]+)").expect("addtask regex should compile"))
}

fn deltask_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^deltask\s+([^#\n]+)").expect("deltask regex should compile"))
}

fn addhandler_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^addhandler\s+(.+)$").expect("addhandler regex should compile"))
}

fn inherit_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^inherit\s+(.+)$").expect("inherit regex should compile"))
}

fn inherit_defer_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^inherit_defer\s+(.+)$").expect("inherit_defer regex should compile")
    })
}

fn check_reserved_task_keywords(
    line: &str,
    filename: &Path,
    lineno: u32,
) -> Result<(), ParseError> {
    for token in line.split_whitespace() {
        for keyword in SETVAR_KEYWORDS {
            if token.contains(&format!("{keyword}_")) || token.contains(&format!("_{keyword}")) {
                return Err(ParseError::syntax(
                    format!(
                        "task name '{token}' contains the reserved keyword '{keyword}'; \
                         rename the task to avoid it"
                    ),
                    filename,
                    lineno,
                ));
            }
        }
    }
    Ok(())
}

/// Split an addtask expression into task names and their `before`/`after`
/// clause tokens. The clauses may interleave in any order.
fn split_task_clauses(expr: &str) -> (Vec<String>, Vec<String>, Vec<String>) {
    let tasks = expr
        .split(" before ")
        .next()
        .unwrap_or("")
        .split(" after ")
        .next()
        .unwrap_or("")
        .split_whitespace()
        .map(str::to_string)
        .collect();

    let mut after = Vec::new();
    for part in expr.split(" before ") {
        let mut segments = part.split(" after ");
        segments.next();
        for segment in segments {
            after.extend(segment.split_whitespace().map(str::to_string));
        }
    }

    let mut before = Vec::new();
    for part in expr.split(" after ") {
        let mut segments = part.split(" before ");
        segments.next();
        for segment in segments {
            before.extend(segment.split_whitespace().map(str::to_string));
        }
    }

    (tasks, before, after)
}

/// Fetch or parse a recipe-grammar statement tree. Trees for `.bbclass`
/// and `.inc` files are memoised per absolute path; `.bb` trees are not
/// cached because their parse depends on the caller's class name.
pub(crate) fn get_statements(
    parser: &mut Parser,
    filename: &Path,
    abs: &Path,
    classname: &str,
    root: &str,
) -> Result<Arc<StatementGroup>, ParseError> {
    let ext = filename.extension().and_then(|e| e.to_str()).unwrap_or("");
    let cacheable = matches!(ext, "bbclass" | "inc");

    if cacheable {
        if let Some(tree) = parser.recipe_cache.get(abs, false) {
            return Ok(tree);
        }
    }

    let text = std::fs::read_to_string(abs)?;
    let mut statements = StatementGroup::new();
    let mut state = RecipeParser::new(classname, root);
    let mut lineno = 0u32;
    for (i, line) in text.lines().enumerate() {
        lineno = (i + 1) as u32;
        state.feeder(lineno, line.trim_end(), filename, &mut statements, false)?;
    }
    state.finish(lineno, filename, &mut statements)?;

    let tree = Arc::new(statements);
    if cacheable {
        parser.recipe_cache.insert(abs, false, Arc::clone(&tree));
    }
    Ok(tree)
}

fn handle(
    parser: &mut Parser,
    path: &Path,
    d: &mut dyn DataStore,
    include: bool,
    baseconfig: bool,
) -> Result<Handled, ParseError> {
    let _ = baseconfig;
    if let Some(tmpdir) = d.get_str(keys::TMPDIR, true) {
        if !tmpdir.is_empty() {
            parser.metrics.set_output_dir(tmpdir);
        }
    }

    let base_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let root = path
        .file_stem()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    let is_class = ext == "bbclass";
    let classname = if is_class { root.as_str() } else { "" };

    if is_class {
        ensure_inherit_cache(d, path);
    }

    let oldfile = if include {
        d.get_str(keys::FILE, false)
    } else {
        None
    };

    let abs = parser.resolve_file(path, d)?;
    let statements = get_statements(parser, path, &abs, classname, &base_name)?;

    let abs_str = abs.display().to_string();
    if !is_class && oldfile.as_deref() != Some(abs_str.as_str()) {
        d.set_str(keys::FILE, &abs_str);
    }

    let skipped = absorb_skip(statements.eval(parser, d), d)?;
    if skipped && !include {
        parser.metrics.flush("bbhandler");
        return Ok(Handled::Variants(single_variant(d)));
    }

    if !is_class && !include {
        parser.metrics.flush("bbhandler");
        let finalize = parser.finalizer;
        return Ok(Handled::Variants(finalize(parser, &abs, d)?));
    }

    if !is_class {
        if let Some(oldfile) = oldfile {
            if oldfile != abs_str {
                d.set_str(keys::FILE, &oldfile);
            }
        }
    }
    Ok(Handled::Inline)
}

/// A class being parsed records itself on `__inherit_cache` so an explicit
/// `inherit` of the same class later becomes a no-op.
fn ensure_inherit_cache(d: &mut dyn DataStore, path: &Path) {
    let mut cache = match d.get(keys::INHERIT_CACHE, false) {
        Some(Value::Paths(paths)) => paths,
        _ => Vec::new(),
    };
    if !cache.iter().any(|p| p == path) {
        cache.push(path.to_path_buf());
        d.set(keys::INHERIT_CACHE, Value::Paths(cache));
    }
}

/// Map a SkipRecipe signal from evaluation onto the `__SKIPPED` flag.
fn absorb_skip(result: Result<(), ParseError>, d: &mut dyn DataStore) -> Result<bool, ParseError> {
    match result {
        Ok(()) => Ok(false),
        Err(ParseError::SkipRecipe) => {
            d.set(keys::SKIPPED, Value::Bool(true));
            Ok(true)
        }
        Err(err) => Err(err),
    }
}

fn single_variant(d: &mut dyn DataStore) -> BTreeMap<String, Box<dyn DataStore>> {
    let mut map = BTreeMap::new();
    map.insert(String::new(), d.clone_box());
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use bb_data::SimpleData;

    fn parse_lines(lines: &[&str]) -> Result<StatementGroup, ParseError> {
        let mut statements = StatementGroup::new();
        let mut state = RecipeParser::new("myclass", "test.bb");
        let mut lineno = 0;
        for (i, line) in lines.iter().enumerate() {
            lineno = (i + 1) as u32;
            state.feeder(lineno, line, Path::new("test.bb"), &mut statements, false)?;
        }
        state.finish(lineno, Path::new("test.bb"), &mut statements)?;
        Ok(statements)
    }

    #[test]
    fn shell_function_body_is_collected() {
        let tree = parse_lines(&["do_build() {", "    make", "}"]).unwrap();
        match &tree.statements()[0].kind {
            StatementKind::ShellMethod {
                name,
                python,
                fakeroot,
                body,
            } => {
                assert_eq!(name, "do_build");
                assert!(!python && !fakeroot);
                assert_eq!(body, &["    make", ""]);
            }
            other => panic!("parsed as {other:?}"),
        }
    }

    #[test]
    fn python_and_fakeroot_prefixes() {
        let tree = parse_lines(&["fakeroot python do_install() {", "    pass", "}"]).unwrap();
        match &tree.statements()[0].kind {
            StatementKind::ShellMethod {
                name,
                python,
                fakeroot,
                ..
            } => {
                assert_eq!(name, "do_install");
                assert!(python);
                assert!(fakeroot);
            }
            other => panic!("parsed as {other:?}"),
        }
    }

    #[test]
    fn anonymous_python_function() {
        let tree = parse_lines(&["python() {", "    pass", "}"]).unwrap();
        match &tree.statements()[0].kind {
            StatementKind::ShellMethod { name, python, .. } => {
                assert_eq!(name, "__anonymous");
                assert!(python);
            }
            other => panic!("parsed as {other:?}"),
        }
    }

    #[test]
    fn def_body_runs_until_unindented_line() {
        let tree = parse_lines(&[
            "def helper(d):",
            "    return 1",
            "",
            "    # still body",
            "A = \"x\"",
        ])
        .unwrap();
        match &tree.statements()[0].kind {
            StatementKind::LanguageMethod { name, body, .. } => {
                assert_eq!(name, "helper");
                assert_eq!(body.len(), 4);
            }
            other => panic!("parsed as {other:?}"),
        }
        assert!(matches!(
            tree.statements()[1].kind,
            StatementKind::DataAssign { .. }
        ));
    }

    #[test]
    fn def_body_is_flushed_at_eof() {
        let tree = parse_lines(&["def helper(d):", "    return 1"]).unwrap();
        assert!(matches!(
            tree.statements()[0].kind,
            StatementKind::LanguageMethod { .. }
        ));
    }

    #[test]
    fn addtask_clauses() {
        let tree = parse_lines(&["addtask do_x before do_y after do_w"]).unwrap();
        match &tree.statements()[0].kind {
            StatementKind::AddTask {
                tasks,
                before,
                after,
            } => {
                assert_eq!(tasks, &["do_x"]);
                assert_eq!(before, &["do_y"]);
                assert_eq!(after, &["do_w"]);
            }
            other => panic!("parsed as {other:?}"),
        }
    }

    #[test]
    fn addtask_strips_trailing_comment() {
        let tree = parse_lines(&["addtask do_x # wire it up later"]).unwrap();
        match &tree.statements()[0].kind {
            StatementKind::AddTask { tasks, .. } => assert_eq!(tasks, &["do_x"]),
            other => panic!("parsed as {other:?}"),
        }
    }

    #[test]
    fn reserved_keyword_in_task_name_is_rejected() {
        assert!(matches!(
            parse_lines(&["addtask do_x_append"]),
            Err(ParseError::Syntax { .. })
        ));
        assert!(matches!(
            parse_lines(&["addtask remove_thing"]),
            Err(ParseError::Syntax { .. })
        ));
    }

    #[test]
    fn inherit_lines() {
        let tree = parse_lines(&["inherit base utils", "inherit_defer lazy"]).unwrap();
        assert!(matches!(
            &tree.statements()[0].kind,
            StatementKind::Inherit { classes } if classes == "base utils"
        ));
        assert!(matches!(
            &tree.statements()[1].kind,
            StatementKind::InheritDeferred { expression } if expression == "lazy"
        ));
    }

    #[test]
    fn export_functions_capture_classname() {
        let tree = parse_lines(&["EXPORT_FUNCTIONS do_fetch do_unpack"]).unwrap();
        match &tree.statements()[0].kind {
            StatementKind::ExportFuncs { names, classname } => {
                assert_eq!(names, &["do_fetch", "do_unpack"]);
                assert_eq!(classname, "myclass");
            }
            other => panic!("parsed as {other:?}"),
        }
    }

    #[test]
    fn residue_joins_without_space() {
        let tree = parse_lines(&["A = \"x \\", " y\""]).unwrap();
        match &tree.statements()[0].kind {
            StatementKind::DataAssign { value, .. } => assert_eq!(value, "x  y"),
            other => panic!("parsed as {other:?}"),
        }
    }

    #[test]
    fn comment_inside_continuation_is_fatal() {
        assert!(matches!(
            parse_lines(&["A = \"x \\", "# comment", " y\""]),
            Err(ParseError::Fatal { .. })
        ));
    }

    #[test]
    fn unclosed_shell_function_is_reported() {
        let err = parse_lines(&["do_foo() {", "    true"]).unwrap_err();
        match err {
            ParseError::Syntax { msg, lineno, .. } => {
                assert!(msg.contains("never closed"), "{msg}");
                assert_eq!(lineno, 1);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn conf_grammar_falls_through() {
        let tree = parse_lines(&["require common.inc", "B ?= \"z\""]).unwrap();
        assert!(matches!(
            tree.statements()[0].kind,
            StatementKind::Include { required: true, .. }
        ));
    }

    #[test]
    fn absorb_skip_flags_datastore() {
        let mut d = SimpleData::new();
        let skipped = absorb_skip(Err(ParseError::SkipRecipe), &mut d).unwrap();
        assert!(skipped);
        assert_eq!(d.get(keys::SKIPPED, false), Some(Value::Bool(true)));

        let mut d = SimpleData::new();
        assert!(!absorb_skip(Ok(()), &mut d).unwrap());
        assert!(d.get(keys::SKIPPED, false).is_none());
    }
}
