use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::types::{BuildCommand, WorkItem};

/// One `[[build]]` table of a manifest.
#[derive(Deserialize, Clone, Debug, PartialEq)]
pub struct ManifestEntry {
    #[serde(flatten)]
    pub command: BuildCommand,
    /// Relative expected run time; only used for ordering.
    #[serde(default)]
    pub cost: u64,
    #[serde(default)]
    pub collect_trace: bool,
}

#[derive(Deserialize, Clone, Debug, Default, PartialEq)]
pub struct Manifest {
    #[serde(default, rename = "build")]
    pub builds: Vec<ManifestEntry>,
}

/// Parse manifest text. Paths are left as written.
pub fn parse_manifest(contents: &str) -> Result<Manifest, String> {
    toml::from_str(contents).map_err(|e| format!("Failed to parse manifest: {}", e))
}

/// Load a manifest file into work items, ids in file order.
///
/// Relative `working_dir` and `log_path` resolve from the manifest's
/// directory, as does a relative `program` containing a path separator.
/// Bare program names are left for `PATH` lookup.
pub fn load_manifest(path: &Path) -> Result<Vec<WorkItem>, String> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read manifest {}: {}", path.display(), e))?;
    let manifest = parse_manifest(&contents)
        .map_err(|e| format!("{} ({})", e, path.display()))?;

    let base = path.parent().unwrap_or(Path::new("."));
    Ok(into_work_items(manifest, base))
}

pub fn into_work_items(manifest: Manifest, base: &Path) -> Vec<WorkItem> {
    manifest
        .builds
        .into_iter()
        .enumerate()
        .map(|(id, entry)| {
            let mut command = entry.command;
            if command.program.components().count() > 1 {
                command.program = resolve(base, &command.program);
            }
            command.working_dir = command.working_dir.map(|d| resolve(base, &d));
            command.log_path = command.log_path.map(|p| resolve(base, &p));
            WorkItem::new(id, command, entry.cost, entry.collect_trace)
        })
        .collect()
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_defaults_cost_and_trace() {
        let manifest = parse_manifest(
            r#"
[[build]]
name = "corelib"
program = "crossgen2"
"#,
        )
        .unwrap();
        assert_eq!(manifest.builds.len(), 1);
        assert_eq!(manifest.builds[0].cost, 0);
        assert!(!manifest.builds[0].collect_trace);
        assert!(manifest.builds[0].command.args.is_empty());
    }

    #[test]
    fn resolve_keeps_bare_program_names() {
        let manifest = parse_manifest(
            r#"
[[build]]
name = "a"
program = "crossgen2"
log_path = "logs/a.log"

[[build]]
name = "b"
program = "tools/run.sh"
working_dir = "/abs/dir"
"#,
        )
        .unwrap();
        let items = into_work_items(manifest, Path::new("/proj"));
        assert_eq!(items[0].command().program, PathBuf::from("crossgen2"));
        assert_eq!(
            items[0].command().log_path,
            Some(PathBuf::from("/proj/logs/a.log"))
        );
        assert_eq!(items[1].command().program, PathBuf::from("/proj/tools/run.sh"));
        assert_eq!(items[1].command().working_dir, Some(PathBuf::from("/abs/dir")));
        assert_eq!(items[1].id(), 1);
    }
}
