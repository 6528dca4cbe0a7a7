use bb_data::{keys, DataStore, SimpleData, Value};
use bb_metrics::Section;
use bb_parse::{CacheOptions, ParseError, Parser};
use std::fs;
use std::path::{Path, PathBuf};

fn dep_paths(d: &SimpleData) -> Vec<PathBuf> {
    match d.get(keys::DEPENDS, false) {
        Some(Value::Deps(deps)) => deps.into_iter().map(|dep| dep.path).collect(),
        _ => Vec::new(),
    }
}

fn layered_bbpath(dirs: &[&Path]) -> String {
    dirs.iter()
        .map(|d| d.display().to_string())
        .collect::<Vec<_>>()
        .join(":")
}

#[test]
fn search_path_resolution_marks_attempts_and_counts_cache_traffic() {
    let tmp = tempfile::tempdir().unwrap();
    let a = tmp.path().join("a");
    let b = tmp.path().join("b");
    let c = tmp.path().join("c");
    for dir in [&a, &b, &c] {
        fs::create_dir_all(dir).unwrap();
    }
    fs::write(b.join("foo.conf"), "").unwrap();

    let mut parser = Parser::with_options(CacheOptions::default());
    let mut d = SimpleData::new();
    d.set_str(keys::BBPATH, &layered_bbpath(&[&a, &b, &c]));

    let resolved = parser.resolve_file(Path::new("foo.conf"), &mut d).unwrap();
    assert_eq!(resolved, b.join("foo.conf"));
    // The walk stopped at the first hit; /c was never consulted.
    assert_eq!(dep_paths(&d), vec![a.join("foo.conf"), b.join("foo.conf")]);
    let counters = parser.metrics().counters(Section::ResolveFile);
    assert_eq!((counters.hits, counters.misses), (0, 1));

    // Second resolution: cache hit, attempts re-marked without duplicates.
    let resolved = parser.resolve_file(Path::new("foo.conf"), &mut d).unwrap();
    assert_eq!(resolved, b.join("foo.conf"));
    assert_eq!(dep_paths(&d), vec![a.join("foo.conf"), b.join("foo.conf")]);
    let counters = parser.metrics().counters(Section::ResolveFile);
    assert_eq!((counters.hits, counters.misses), (1, 1));
}

#[test]
fn resolution_is_deterministic() {
    let tmp = tempfile::tempdir().unwrap();
    let a = tmp.path().join("a");
    let b = tmp.path().join("b");
    fs::create_dir_all(&a).unwrap();
    fs::create_dir_all(&b).unwrap();
    fs::write(b.join("site.conf"), "").unwrap();

    let mut parser = Parser::with_options(CacheOptions::default());
    let bbpath = layered_bbpath(&[&a, &b]);

    let mut first = SimpleData::new();
    first.set_str(keys::BBPATH, &bbpath);
    let path1 = parser.resolve_file(Path::new("site.conf"), &mut first).unwrap();

    let mut second = SimpleData::new();
    second.set_str(keys::BBPATH, &bbpath);
    let path2 = parser.resolve_file(Path::new("site.conf"), &mut second).unwrap();

    assert_eq!(path1, path2);
    assert_eq!(dep_paths(&first), dep_paths(&second));
}

#[test]
fn miss_marks_every_directory() {
    let tmp = tempfile::tempdir().unwrap();
    let a = tmp.path().join("a");
    let b = tmp.path().join("b");
    fs::create_dir_all(&a).unwrap();
    fs::create_dir_all(&b).unwrap();

    let mut parser = Parser::with_options(CacheOptions::default());
    let mut d = SimpleData::new();
    d.set_str(keys::BBPATH, &layered_bbpath(&[&a, &b]));

    let err = parser
        .resolve_file(Path::new("absent.conf"), &mut d)
        .unwrap_err();
    assert!(matches!(err, ParseError::NotFound { .. }));
    assert_eq!(dep_paths(&d), vec![a.join("absent.conf"), b.join("absent.conf")]);
}

#[test]
fn absolute_names_skip_the_search_path() {
    let tmp = tempfile::tempdir().unwrap();
    let file = tmp.path().join("local.conf");
    fs::write(&file, "").unwrap();

    let mut parser = Parser::with_options(CacheOptions::default());
    let mut d = SimpleData::new();

    let resolved = parser.resolve_file(&file, &mut d).unwrap();
    assert_eq!(resolved, file);
    assert_eq!(dep_paths(&d), vec![file.clone()]);
    // No BBPATH was consulted, so the resolver cache saw no traffic.
    let counters = parser.metrics().counters(Section::ResolveFile);
    assert_eq!((counters.hits, counters.misses), (0, 0));
}

#[test]
fn directories_are_not_files() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("conf.conf");
    fs::create_dir_all(&dir).unwrap();

    let mut parser = Parser::with_options(CacheOptions::default());
    let mut d = SimpleData::new();
    let err = parser.resolve_file(&dir, &mut d).unwrap_err();
    assert!(matches!(err, ParseError::NotAFile { .. }));
}

#[test]
fn disabled_resolve_cache_walks_every_time() {
    let tmp = tempfile::tempdir().unwrap();
    let a = tmp.path().join("a");
    fs::create_dir_all(&a).unwrap();
    fs::write(a.join("x.conf"), "").unwrap();

    let options = CacheOptions {
        resolve_cache: false,
        ..CacheOptions::default()
    };
    let mut parser = Parser::with_options(options);
    let mut d = SimpleData::new();
    d.set_str(keys::BBPATH, &a.display().to_string());

    parser.resolve_file(Path::new("x.conf"), &mut d).unwrap();
    parser.resolve_file(Path::new("x.conf"), &mut d).unwrap();
    let counters = parser.metrics().counters(Section::ResolveFile);
    assert_eq!((counters.hits, counters.misses), (0, 2));
}

#[test]
fn expanded_bbpath_is_honoured() {
    let tmp = tempfile::tempdir().unwrap();
    let layer = tmp.path().join("layer");
    fs::create_dir_all(&layer).unwrap();
    fs::write(layer.join("x.conf"), "").unwrap();

    let mut parser = Parser::with_options(CacheOptions::default());
    let mut d = SimpleData::new();
    d.set_str("LAYERDIR", &layer.display().to_string());
    d.set_str(keys::BBPATH, "${LAYERDIR}");

    let resolved = parser.resolve_file(Path::new("x.conf"), &mut d).unwrap();
    assert_eq!(resolved, layer.join("x.conf"));
}
