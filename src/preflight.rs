use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::types::WorkItem;

/// A single preflight validation error with actionable context.
#[derive(Debug, Clone, PartialEq)]
pub struct PreflightError {
    /// What condition failed.
    pub condition: String,
    /// Which build (or the manifest) the error comes from.
    pub location: String,
    /// How to fix it.
    pub suggested_fix: String,
}

impl std::fmt::Display for PreflightError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Preflight error: {}\n  Build: {}\n  Fix: {}",
            self.condition, self.location, self.suggested_fix
        )
    }
}

/// Run all preflight checks over the manifest's builds.
///
/// 1. Manifest is non-empty
/// 2. Build names are unique
/// 3. Programs resolve (existing file, or found on `PATH`)
/// 4. Working directories exist
/// 5. Log paths don't point at directories
///
/// Returns every error found, not just the first.
pub fn run_preflight(
    items: &[WorkItem],
    manifest_path: &Path,
) -> Result<(), Vec<PreflightError>> {
    let mut errors = Vec::new();

    if items.is_empty() {
        errors.push(PreflightError {
            condition: "manifest contains no builds".to_string(),
            location: manifest_path.display().to_string(),
            suggested_fix: "Add at least one [[build]] table".to_string(),
        });
        return Err(errors);
    }

    errors.extend(validate_unique_names(items));
    errors.extend(probe_programs(items));
    errors.extend(validate_paths(items));

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_unique_names(items: &[WorkItem]) -> Vec<PreflightError> {
    let mut seen = HashSet::new();
    let mut reported = HashSet::new();
    let mut errors = Vec::new();
    for item in items {
        let name = &item.command().name;
        if !seen.insert(name) && reported.insert(name) {
            errors.push(PreflightError {
                condition: format!("duplicate build name '{}'", name),
                location: name.clone(),
                suggested_fix: "Give every [[build]] a unique name".to_string(),
            });
        }
    }
    errors
}

fn probe_programs(items: &[WorkItem]) -> Vec<PreflightError> {
    // Each distinct program once
    let mut probed = HashSet::new();
    let mut errors = Vec::new();
    for item in items {
        let program = &item.command().program;
        if !probed.insert(program.clone()) {
            continue;
        }
        if resolve_program(program).is_none() {
            errors.push(PreflightError {
                condition: format!("program '{}' not found", program.display()),
                location: item.command().name.clone(),
                suggested_fix: "Install the tool, add it to PATH, or use an absolute path"
                    .to_string(),
            });
        }
    }
    errors
}

fn validate_paths(items: &[WorkItem]) -> Vec<PreflightError> {
    let mut errors = Vec::new();
    for item in items {
        let command = item.command();
        if let Some(dir) = &command.working_dir {
            if !dir.is_dir() {
                errors.push(PreflightError {
                    condition: format!("working directory {} does not exist", dir.display()),
                    location: command.name.clone(),
                    suggested_fix: "Create the directory or fix working_dir".to_string(),
                });
            }
        }
        if let Some(log) = &command.log_path {
            if log.is_dir() {
                errors.push(PreflightError {
                    condition: format!("log path {} is a directory", log.display()),
                    location: command.name.clone(),
                    suggested_fix: "Point log_path at a file".to_string(),
                });
            }
        }
    }
    errors
}

/// Locate `program`: paths with a separator must exist, bare names are
/// searched on `PATH`.
pub fn resolve_program(program: &Path) -> Option<PathBuf> {
    if program.components().count() > 1 || program.is_absolute() {
        return program.is_file().then(|| program.to_path_buf());
    }
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}
