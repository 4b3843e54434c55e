use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use crate::types::TraceFacts;

/// Append a build's trace facts to its log file.
///
/// Creates the file and parent directories if missing.
///
/// Format:
/// ```text
/// Jitted methods ({total} total):
/// {module} -> {method}
/// ...
/// ```
/// or `Jitted method info not available` when nothing was gathered.
pub fn append_trace_facts(log_path: &Path, facts: &TraceFacts) -> Result<(), String> {
    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create log directory {}: {}", parent.display(), e))?;
    }

    let mut entry = String::new();
    match facts {
        TraceFacts::Collected(methods) => {
            entry.push_str(&format!(
                "Jitted methods ({} total):\n",
                facts.method_count()
            ));
            for (module, names) in methods {
                for method in names {
                    entry.push_str(&format!("{} -> {}\n", module, method));
                }
            }
        }
        TraceFacts::NotAvailable => entry.push_str("Jitted method info not available\n"),
    }

    let mut file = OpenOptions::new()
        .append(true)
        .create(true)
        .open(log_path)
        .map_err(|e| format!("Failed to open log at {}: {}", log_path.display(), e))?;

    file.write_all(entry.as_bytes())
        .map_err(|e| format!("Failed to write log at {}: {}", log_path.display(), e))?;

    Ok(())
}
