use bb_data::{keys, DataStore, SimpleData, Value};
use bb_parse::{CacheOptions, ParseError, Parser};
use std::fs;
use std::path::Path;

fn write(path: &Path, contents: &str) {
    fs::write(path, contents).unwrap();
}

#[test]
fn assignment_operators_compose_in_order() {
    let tmp = tempfile::tempdir().unwrap();
    let conf = tmp.path().join("ops.conf");
    write(
        &conf,
        "A = \"x\"\nA += \"y\"\nB ?= \"z\"\nB = \"real\"\n",
    );

    let mut parser = Parser::with_options(CacheOptions::default());
    let mut d = SimpleData::new();
    parser.handle(&conf, &mut d, false, false).unwrap();

    assert_eq!(d.get_str("A", false).as_deref(), Some("x y"));
    assert_eq!(d.get_str("B", false).as_deref(), Some("real"));
}

#[test]
fn conf_statements_cover_flags_export_and_unset() {
    let tmp = tempfile::tempdir().unwrap();
    let conf = tmp.path().join("site.conf");
    write(
        &conf,
        concat!(
            "export PATH = \"/usr/bin\"\n",
            "A[doc] = \"docs\"\n",
            "B = \"kept\"\n",
            "GONE = \"value\"\n",
            "unset GONE\n",
            "B[doc] = \"note\"\n",
            "unset B[doc]\n",
            "export LATER\n",
        ),
    );

    let mut parser = Parser::with_options(CacheOptions::default());
    let mut d = SimpleData::new();
    parser.handle(&conf, &mut d, false, false).unwrap();

    assert_eq!(d.get_flag("PATH", "export").as_deref(), Some("1"));
    assert_eq!(d.get_flag("A", "doc").as_deref(), Some("docs"));
    assert!(d.get("GONE", false).is_none());
    assert_eq!(d.get_str("B", false).as_deref(), Some("kept"));
    assert!(d.get_flag("B", "doc").is_none());
    assert_eq!(d.get_flag("LATER", "export").as_deref(), Some("1"));
}

#[test]
fn weak_default_applies_only_without_a_real_value() {
    let tmp = tempfile::tempdir().unwrap();
    let conf = tmp.path().join("weak.conf");
    write(&conf, "W ??= \"weak\"\nS ??= \"weak\"\nS = \"strong\"\n");

    let mut parser = Parser::with_options(CacheOptions::default());
    let mut d = SimpleData::new();
    parser.handle(&conf, &mut d, false, false).unwrap();

    assert_eq!(d.get_str("W", false).as_deref(), Some("weak"));
    assert_eq!(d.get_str("S", false).as_deref(), Some("strong"));
}

#[test]
fn recipe_parse_returns_the_base_variant() {
    let tmp = tempfile::tempdir().unwrap();
    let recipe = tmp.path().join("hello_1.0.bb");
    write(&recipe, "PN = \"hello\"\nPV = \"1.0\"\n");

    let mut parser = Parser::with_options(CacheOptions::default());
    let mut d = SimpleData::new();
    let handled = parser.handle(&recipe, &mut d, false, false).unwrap();
    let variants = handled.variants().expect("recipe parse produces variants");

    assert_eq!(variants.len(), 1);
    let base = variants.get("").expect("base variant");
    assert_eq!(base.get_str("PN", false).as_deref(), Some("hello"));
    // FILE names the recipe itself.
    assert_eq!(
        d.get_str(keys::FILE, false).as_deref(),
        Some(recipe.display().to_string().as_str())
    );
}

#[test]
fn addtask_wires_task_metadata() {
    let tmp = tempfile::tempdir().unwrap();
    let recipe = tmp.path().join("tasks.bb");
    write(
        &recipe,
        concat!(
            "addtask do_x before do_y after do_w\n",
            "addtask compile\n",
            "deltask do_compile\n",
        ),
    );

    let mut parser = Parser::with_options(CacheOptions::default());
    let mut d = SimpleData::new();
    parser.handle(&recipe, &mut d, false, false).unwrap();

    assert_eq!(
        d.get(keys::TASKS, false),
        Some(Value::List(vec!["do_x".to_string()]))
    );
    assert_eq!(d.get_flag("do_x", "task").as_deref(), Some("1"));
    assert_eq!(d.get_flag("do_x", "deps").as_deref(), Some("do_w"));
    assert_eq!(d.get_flag("do_y", "deps").as_deref(), Some("do_x"));
    // Added then deleted: the task flag is gone again.
    assert!(d.get_flag("do_compile", "task").is_none());
}

#[test]
fn reserved_keyword_in_task_name_fails_the_parse() {
    let tmp = tempfile::tempdir().unwrap();
    let recipe = tmp.path().join("bad.bb");
    write(&recipe, "addtask do_x_append\n");

    let mut parser = Parser::with_options(CacheOptions::default());
    let mut d = SimpleData::new();
    let err = parser.handle(&recipe, &mut d, false, false).unwrap_err();
    match err {
        ParseError::Syntax { msg, .. } => assert!(msg.contains("reserved keyword"), "{msg}"),
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn unclosed_shell_function_fails_the_parse() {
    let tmp = tempfile::tempdir().unwrap();
    let recipe = tmp.path().join("open.bb");
    write(&recipe, "do_foo() {\n    true\n");

    let mut parser = Parser::with_options(CacheOptions::default());
    let mut d = SimpleData::new();
    let err = parser.handle(&recipe, &mut d, false, false).unwrap_err();
    match err {
        ParseError::Syntax { msg, .. } => assert!(msg.contains("never closed"), "{msg}"),
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn shell_and_python_methods_land_in_the_datastore() {
    let tmp = tempfile::tempdir().unwrap();
    let recipe = tmp.path().join("funcs.bb");
    write(
        &recipe,
        concat!(
            "do_build() {\n",
            "    make all\n",
            "}\n",
            "python do_report() {\n",
            "    pass\n",
            "}\n",
            "def helper(d):\n",
            "    return 1\n",
        ),
    );

    let mut parser = Parser::with_options(CacheOptions::default());
    let mut d = SimpleData::new();
    parser.handle(&recipe, &mut d, false, false).unwrap();

    assert_eq!(
        d.get_str("do_build", false).as_deref(),
        Some("    make all\n")
    );
    assert_eq!(d.get_flag("do_build", "func").as_deref(), Some("1"));
    assert!(d.get_flag("do_build", "python").is_none());

    assert_eq!(d.get_flag("do_report", "python").as_deref(), Some("1"));
    assert_eq!(d.get_flag("helper", "python").as_deref(), Some("1"));
}

#[test]
fn anonymous_functions_are_registered() {
    let tmp = tempfile::tempdir().unwrap();
    let recipe = tmp.path().join("anon.bb");
    write(&recipe, "python() {\n    pass\n}\n");

    let mut parser = Parser::with_options(CacheOptions::default());
    let mut d = SimpleData::new();
    parser.handle(&recipe, &mut d, false, false).unwrap();

    let anon = match d.get(keys::ANON_FUNCS, false) {
        Some(Value::List(names)) => names,
        other => panic!("expected anonymous function list, got {other:?}"),
    };
    assert_eq!(anon.len(), 1);
    assert_eq!(d.get_flag(&anon[0], "python").as_deref(), Some("1"));
}

#[test]
fn include_restores_the_file_variable() {
    let tmp = tempfile::tempdir().unwrap();
    let outer = tmp.path().join("outer.conf");
    let inner = tmp.path().join("inner.conf");
    write(&inner, "IN := \"${FILE}\"\n");
    write(
        &outer,
        &format!("include {}\nOUT := \"${{FILE}}\"\n", inner.display()),
    );

    let mut parser = Parser::with_options(CacheOptions::default());
    let mut d = SimpleData::new();
    parser.handle(&outer, &mut d, false, false).unwrap();

    // Inside the include FILE named the inner file; afterwards it is
    // restored to the including file.
    assert_eq!(
        d.get_str("IN", true).as_deref(),
        Some(inner.display().to_string().as_str())
    );
    assert_eq!(
        d.get_str("OUT", true).as_deref(),
        Some(outer.display().to_string().as_str())
    );
}

#[test]
fn immediate_assignment_expands_at_parse_position() {
    let tmp = tempfile::tempdir().unwrap();
    let conf = tmp.path().join("imm.conf");
    write(&conf, "V = \"one\"\nSNAP := \"${V}\"\nLAZY = \"${V}\"\nV = \"two\"\n");

    let mut parser = Parser::with_options(CacheOptions::default());
    let mut d = SimpleData::new();
    parser.handle(&conf, &mut d, false, false).unwrap();

    assert_eq!(d.get_str("SNAP", true).as_deref(), Some("one"));
    assert_eq!(d.get_str("LAZY", true).as_deref(), Some("two"));
}
