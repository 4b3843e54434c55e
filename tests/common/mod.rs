#![allow(dead_code)]

use std::path::PathBuf;

use build_golem::types::{BuildCommand, WorkItem};

/// Creates a `WorkItem` named `b{id}` running the mock program.
///
/// # Parameters
/// - `id`: Item identity (position in the caller's list)
/// - `cost`: Cost heuristic used for ordering
/// - `collect_trace`: Whether trace collection is requested
pub fn make_item(id: usize, cost: u64, collect_trace: bool) -> WorkItem {
    WorkItem::new(id, BuildCommand::new(&build_name(id), "mock", &[]), cost, collect_trace)
}

/// Build name used by `make_item`, for keying mock behaviours.
pub fn build_name(id: usize) -> String {
    format!("b{}", id)
}

/// One untraced item per cost, ids in slice order.
pub fn items_with_costs(costs: &[u64]) -> Vec<WorkItem> {
    costs
        .iter()
        .enumerate()
        .map(|(id, &cost)| make_item(id, cost, false))
        .collect()
}

/// `count` traced items with equal cost.
pub fn traced_items(count: usize) -> Vec<WorkItem> {
    (0..count).map(|id| make_item(id, 1, true)).collect()
}

/// Returns the path to the `tests/fixtures` directory.
pub fn fixtures_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures")
}

/// Returns the path to a specific fixture file.
pub fn fixture_path(name: &str) -> PathBuf {
    fixtures_dir().join(name)
}

/// A `WorkItem` running `fake_build.sh` through bash.
///
/// # Parameters
/// - `id`: Item identity
/// - `exit_code`: Code the fake build exits with
/// - `sleep_secs`: How long the fake build runs (fractional allowed)
/// - `log_path`: Where stdout/stderr go, if anywhere
pub fn fake_build(
    id: usize,
    exit_code: i32,
    sleep_secs: &str,
    log_path: Option<PathBuf>,
) -> WorkItem {
    let script = fixture_path("fake_build.sh");
    let mut command = BuildCommand::new(
        &build_name(id),
        "bash",
        &[
            script.to_str().expect("fixture path is utf-8"),
            &exit_code.to_string(),
            sleep_secs,
        ],
    );
    command.log_path = log_path;
    WorkItem::new(id, command, 0, false)
}
