use crate::conf;
use crate::error::ParseError;
use crate::inherit;
use crate::parser::Parser;
use bb_data::{keys, DataStore, Value};
use std::path::{Path, PathBuf};

/// One assignment operator of the config grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOp {
    /// `=`
    Assign,
    /// `:=` — value is expanded at evaluation time.
    Immediate,
    /// `?=` — set only when the variable has no value.
    Default,
    /// `??=` — weak default, stored under `_defaultval`.
    WeakDefault,
    /// `+=` — append with a space.
    Append,
    /// `=+` — prepend with a space.
    Prepend,
    /// `.=` — append without a space.
    PostDot,
    /// `=.` — prepend without a space.
    PreDot,
}

/// A parsed statement with its source location.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub filename: PathBuf,
    pub lineno: u32,
    pub kind: StatementKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StatementKind {
    DataAssign {
        var: String,
        flag: Option<String>,
        exported: bool,
        op: AssignOp,
        value: String,
    },
    /// `include` (`required = false`) or `require` (`required = true`).
    Include {
        what: String,
        required: bool,
    },
    IncludeAll {
        what: String,
    },
    Export {
        var: String,
    },
    Unset {
        var: String,
    },
    UnsetFlag {
        var: String,
        flag: String,
    },
    AddPyLib {
        dir: String,
        module: String,
    },
    AddFragments {
        path_prefix: String,
        fragments_var: String,
        flagged_var: String,
        builtin_var: String,
    },
    ShellMethod {
        name: String,
        python: bool,
        fakeroot: bool,
        body: Vec<String>,
    },
    /// `def name(...):` embedded-language function.
    LanguageMethod {
        name: String,
        root: String,
        body: Vec<String>,
    },
    ExportFuncs {
        names: Vec<String>,
        classname: String,
    },
    AddTask {
        tasks: Vec<String>,
        before: Vec<String>,
        after: Vec<String>,
    },
    DelTask {
        tasks: Vec<String>,
    },
    AddHandler {
        handlers: Vec<String>,
    },
    Inherit {
        classes: String,
    },
    InheritDeferred {
        expression: String,
    },
}

/// Ordered statement tree for one file. Evaluation is strictly sequential;
/// includes run inline at their textual position.
#[derive(Debug, Default, PartialEq)]
pub struct StatementGroup {
    statements: Vec<Statement>,
}

impl StatementGroup {
    pub fn new() -> StatementGroup {
        StatementGroup::default()
    }

    pub(crate) fn push(&mut self, filename: &Path, lineno: u32, kind: StatementKind) {
        self.statements.push(Statement {
            filename: filename.to_path_buf(),
            lineno,
            kind,
        });
    }

    pub fn statements(&self) -> &[Statement] {
        &self.statements
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    pub fn eval(&self, parser: &mut Parser, d: &mut dyn DataStore) -> Result<(), ParseError> {
        for statement in &self.statements {
            statement.eval(parser, d)?;
        }
        Ok(())
    }
}

impl Statement {
    fn eval(&self, parser: &mut Parser, d: &mut dyn DataStore) -> Result<(), ParseError> {
        match &self.kind {
            StatementKind::DataAssign {
                var,
                flag,
                exported,
                op,
                value,
            } => {
                eval_assignment(d, var, flag.as_deref(), *exported, *op, value);
                Ok(())
            }
            StatementKind::Include { what, required } => {
                let verb = required.then_some("include required");
                conf::include(parser, &self.filename, what, self.lineno, d, verb)
            }
            StatementKind::IncludeAll { what } => {
                let what = d.expand(what);
                let bbpath = d.get_str(keys::BBPATH, true).unwrap_or_default();
                for layer in bbpath.split(':').filter(|p| !p.is_empty()) {
                    let candidate = Path::new(layer).join(&what);
                    conf::include_single_file(
                        parser,
                        &self.filename,
                        &candidate.to_string_lossy(),
                        self.lineno,
                        d,
                        None,
                    )?;
                }
                Ok(())
            }
            StatementKind::Export { var } => {
                d.set_flag(var, "export", "1");
                Ok(())
            }
            StatementKind::Unset { var } => {
                d.del_var(var);
                Ok(())
            }
            StatementKind::UnsetFlag { var, flag } => {
                d.del_flag(var, flag);
                Ok(())
            }
            StatementKind::AddPyLib { dir, module } => {
                let dir = d.expand(dir);
                push_list_item(d, keys::PYLIB_PATH, &dir);
                push_list_item(d, keys::PYLIB_MODULES, module);
                Ok(())
            }
            StatementKind::AddFragments {
                path_prefix,
                fragments_var,
                flagged_var: _,
                builtin_var,
            } => {
                let prefix = d.expand(path_prefix);
                let enabled = d.get_str(fragments_var, true).unwrap_or_default();
                let builtin = d.get_str(builtin_var, true).unwrap_or_default();
                let builtin: Vec<&str> = builtin.split_whitespace().collect();
                for fragment in enabled.split_whitespace() {
                    if builtin.contains(&fragment) {
                        continue;
                    }
                    let target = format!("{prefix}/{fragment}.conf");
                    conf::include_single_file(parser, &self.filename, &target, self.lineno, d, None)?;
                }
                Ok(())
            }
            StatementKind::ShellMethod {
                name,
                python,
                fakeroot,
                body,
            } => {
                let funcname = if name == "__anonymous" {
                    let anon = anonymous_name(&self.filename, self.lineno);
                    push_list_item(d, keys::ANON_FUNCS, &anon);
                    anon
                } else {
                    name.clone()
                };
                d.set_str(&funcname, &body.join("\n"));
                d.set_flag(&funcname, "func", "1");
                if *python {
                    d.set_flag(&funcname, "python", "1");
                }
                if *fakeroot {
                    d.set_flag(&funcname, "fakeroot", "1");
                }
                Ok(())
            }
            StatementKind::LanguageMethod { name, root: _, body } => {
                d.set_str(name, &body.join("\n"));
                d.set_flag(name, "func", "1");
                d.set_flag(name, "python", "1");
                Ok(())
            }
            StatementKind::ExportFuncs { names, classname } => {
                eval_export_funcs(d, names, classname, &self.filename, self.lineno)
            }
            StatementKind::AddTask {
                tasks,
                before,
                after,
            } => {
                for task in tasks {
                    let task = task_name(&d.expand(task));
                    push_list_item(d, keys::TASKS, &task);
                    d.set_flag(&task, "task", "1");
                    for dep in after {
                        let dep = task_name(&d.expand(dep));
                        append_flag_token(d, &task, "deps", &dep);
                    }
                    for successor in before {
                        let successor = task_name(&d.expand(successor));
                        append_flag_token(d, &successor, "deps", &task);
                    }
                }
                Ok(())
            }
            StatementKind::DelTask { tasks } => {
                for task in tasks {
                    let task = task_name(&d.expand(task));
                    remove_list_item(d, keys::TASKS, &task);
                    d.del_flag(&task, "task");
                }
                Ok(())
            }
            StatementKind::AddHandler { handlers } => {
                for handler in handlers {
                    push_list_item(d, keys::HANDLERS, handler);
                    d.set_flag(handler, "handler", "1");
                }
                Ok(())
            }
            StatementKind::Inherit { classes } => {
                inherit::inherit(parser, classes, &self.filename, self.lineno, d, false)
            }
            StatementKind::InheritDeferred { expression } => {
                inherit::inherit_defer(expression, &self.filename, self.lineno, d);
                Ok(())
            }
        }
    }
}

fn eval_assignment(
    d: &mut dyn DataStore,
    var: &str,
    flag: Option<&str>,
    exported: bool,
    op: AssignOp,
    value: &str,
) {
    if exported {
        d.set_flag(var, "export", "1");
    }

    let current = match flag {
        Some(flag) => d.get_flag(var, flag),
        None => d.get_no_default(var).and_then(Value::into_string),
    };
    let assign = |d: &mut dyn DataStore, value: &str| match flag {
        Some(flag) => d.set_flag(var, flag, value),
        None => d.set_str(var, value),
    };

    match op {
        AssignOp::Assign => assign(d, value),
        AssignOp::Immediate => {
            let expanded = d.expand(value);
            assign(d, &expanded);
        }
        AssignOp::Default => {
            if current.is_none() {
                assign(d, value);
            }
        }
        AssignOp::WeakDefault => d.set_flag(var, "_defaultval", value),
        AssignOp::Append => assign(d, &format!("{} {}", current.unwrap_or_default(), value)),
        AssignOp::Prepend => assign(d, &format!("{} {}", value, current.unwrap_or_default())),
        AssignOp::PostDot => assign(d, &format!("{}{}", current.unwrap_or_default(), value)),
        AssignOp::PreDot => assign(d, &format!("{}{}", value, current.unwrap_or_default())),
    }
}

fn eval_export_funcs(
    d: &mut dyn DataStore,
    names: &[String],
    classname: &str,
    filename: &Path,
    lineno: u32,
) -> Result<(), ParseError> {
    for func in names {
        let sourced = format!("{classname}_{func}");
        // A definition the user supplied directly wins over the alias.
        if d.get_no_default(func).is_some() && d.get_flag(func, "export_func").is_none() {
            continue;
        }
        let python = d.get_flag(&sourced, "python").is_some();
        if python {
            d.set_str(func, &format!("    {sourced}(d)\n"));
        } else {
            if classname.contains('-') {
                return Err(ParseError::syntax(
                    format!(
                        "cannot export shell function {func}: class name {classname} contains a dash"
                    ),
                    filename,
                    lineno,
                ));
            }
            d.set_str(func, &format!("    {sourced}\n"));
            if d.get_flag(&sourced, "fakeroot").is_some() {
                d.set_flag(func, "fakeroot", "1");
            }
        }
        d.set_flag(func, "func", "1");
        d.set_flag(func, "export_func", "1");
        if python {
            d.set_flag(func, "python", "1");
        }
    }
    Ok(())
}

/// Task names carry the `do_` prefix; bare names gain it.
fn task_name(name: &str) -> String {
    if name.starts_with("do_") {
        name.to_string()
    } else {
        format!("do_{name}")
    }
}

fn anonymous_name(filename: &Path, lineno: u32) -> String {
    let mangled: String = filename
        .to_string_lossy()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("__anon_{lineno}_{mangled}")
}

fn push_list_item(d: &mut dyn DataStore, key: &str, item: &str) {
    let mut items = match d.get(key, false) {
        Some(Value::List(items)) => items,
        _ => Vec::new(),
    };
    if !items.iter().any(|existing| existing == item) {
        items.push(item.to_string());
        d.set(key, Value::List(items));
    }
}

fn remove_list_item(d: &mut dyn DataStore, key: &str, item: &str) {
    if let Some(Value::List(items)) = d.get(key, false) {
        let filtered: Vec<String> = items.into_iter().filter(|i| i != item).collect();
        d.set(key, Value::List(filtered));
    }
}

fn append_flag_token(d: &mut dyn DataStore, var: &str, flag: &str, token: &str) {
    let current = d.get_flag(var, flag).unwrap_or_default();
    if current.split_whitespace().any(|t| t == token) {
        return;
    }
    let joined = if current.is_empty() {
        token.to_string()
    } else {
        format!("{current} {token}")
    };
    d.set_flag(var, flag, &joined);
}

#[cfg(test)]
mod tests {
    use super::*;
    use bb_data::SimpleData;

    fn assign(d: &mut SimpleData, var: &str, op: AssignOp, value: &str) {
        eval_assignment(d, var, None, false, op, value);
    }

    #[test]
    fn operator_semantics() {
        let mut d = SimpleData::new();
        assign(&mut d, "A", AssignOp::Assign, "x");
        assign(&mut d, "A", AssignOp::Append, "y");
        assert_eq!(d.get_str("A", false).as_deref(), Some("x y"));

        assign(&mut d, "B", AssignOp::Default, "z");
        assign(&mut d, "B", AssignOp::Assign, "real");
        assert_eq!(d.get_str("B", false).as_deref(), Some("real"));

        assign(&mut d, "C", AssignOp::Assign, "c");
        assign(&mut d, "C", AssignOp::Prepend, "pre");
        assert_eq!(d.get_str("C", false).as_deref(), Some("pre c"));

        assign(&mut d, "D", AssignOp::Assign, "d");
        assign(&mut d, "D", AssignOp::PostDot, "!");
        assign(&mut d, "D", AssignOp::PreDot, "?");
        assert_eq!(d.get_str("D", false).as_deref(), Some("?d!"));
    }

    #[test]
    fn immediate_expansion_snapshots_value() {
        let mut d = SimpleData::new();
        d.set_str("V", "one");
        assign(&mut d, "E", AssignOp::Immediate, "${V}");
        d.set_str("V", "two");
        assert_eq!(d.get_str("E", true).as_deref(), Some("one"));
    }

    #[test]
    fn weak_default_yields_to_default() {
        let mut d = SimpleData::new();
        assign(&mut d, "A", AssignOp::WeakDefault, "weak");
        assert_eq!(d.get_str("A", false).as_deref(), Some("weak"));
        // `?=` still fires: the weak default is not a real value.
        assign(&mut d, "A", AssignOp::Default, "firm");
        assert_eq!(d.get_str("A", false).as_deref(), Some("firm"));
    }

    #[test]
    fn flagged_assignment_targets_the_flag() {
        let mut d = SimpleData::new();
        eval_assignment(&mut d, "A", Some("doc"), false, AssignOp::Assign, "docs");
        eval_assignment(&mut d, "A", Some("doc"), false, AssignOp::Append, "more");
        assert_eq!(d.get_flag("A", "doc").as_deref(), Some("docs more"));
        assert_eq!(d.get_no_default("A"), None);
    }

    #[test]
    fn export_prefix_sets_flag() {
        let mut d = SimpleData::new();
        eval_assignment(&mut d, "PATH", None, true, AssignOp::Assign, "/bin");
        assert_eq!(d.get_flag("PATH", "export").as_deref(), Some("1"));
    }

    #[test]
    fn task_name_gains_prefix() {
        assert_eq!(task_name("compile"), "do_compile");
        assert_eq!(task_name("do_compile"), "do_compile");
    }
}
