mod common;

use std::path::Path;

use build_golem::preflight::run_preflight;
use build_golem::types::{BuildCommand, WorkItem};

use common::{fake_build, fixture_path};

fn item(id: usize, name: &str, program: &str) -> WorkItem {
    WorkItem::new(id, BuildCommand::new(name, program, &[]), 0, false)
}

#[test]
fn valid_builds_pass() {
    let items = vec![fake_build(0, 0, "0", None), fake_build(1, 0, "0", None)];
    assert!(run_preflight(&items, Path::new("builds.toml")).is_ok());
}

#[test]
fn empty_manifest_fails() {
    let errors = run_preflight(&[], Path::new("builds.toml")).unwrap_err();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].condition.contains("no builds"));
    assert_eq!(errors[0].location, "builds.toml");
}

#[test]
fn duplicate_names_reported_once() {
    let items = vec![item(0, "a", "sh"), item(1, "a", "sh"), item(2, "a", "sh")];
    let errors = run_preflight(&items, Path::new("m.toml")).unwrap_err();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].condition.contains("duplicate build name 'a'"));
}

#[test]
fn missing_program_and_paths_all_reported() {
    let dir = tempfile::tempdir().unwrap();
    let mut bad_dir = BuildCommand::new("dir", "sh", &[]);
    bad_dir.working_dir = Some(dir.path().join("missing"));
    let mut bad_log = BuildCommand::new("log", "sh", &[]);
    bad_log.log_path = Some(dir.path().to_path_buf());

    let items = vec![
        item(0, "tool", "build-golem-no-such-tool"),
        item(1, "tool2", "build-golem-no-such-tool"),
        WorkItem::new(2, bad_dir, 0, false),
        WorkItem::new(3, bad_log, 0, false),
    ];
    let errors = run_preflight(&items, Path::new("m.toml")).unwrap_err();

    let conditions: Vec<&str> = errors.iter().map(|e| e.condition.as_str()).collect();
    assert_eq!(errors.len(), 3, "{:?}", conditions);
    assert!(conditions[0].contains("program 'build-golem-no-such-tool' not found"));
    assert!(conditions[1].contains("working directory"));
    assert!(conditions[2].contains("is a directory"));
    assert_eq!(errors[0].location, "tool");
}

#[test]
fn fixture_script_path_resolves() {
    let script = fixture_path("fake_build.sh");
    let items = vec![item(0, "script", script.to_str().unwrap())];
    assert!(run_preflight(&items, Path::new("m.toml")).is_ok());
}
