use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::batch::{TraceOptions, DEFAULT_SESSION_NAME, DEFAULT_TRACE_BATCH_SIZE};
use crate::parallel::{RunOptions, MAX_DEGREE_OF_PARALLELISM};
use crate::trace::TraceCategory;

pub const CONFIG_FILE_NAME: &str = "build-golem.toml";

#[derive(Default, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct BuildGolemConfig {
    pub execution: ExecutionConfig,
    pub trace: TraceConfig,
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ExecutionConfig {
    /// 0 = logical processor count.
    pub degree_of_parallelism: usize,
    /// 0 = no timeout.
    pub process_timeout_minutes: u32,
    pub trace_batch_size: usize,
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct TraceConfig {
    /// Relative paths resolve from the project root.
    pub socket_path: String,
    pub session_name: String,
    pub categories: Vec<TraceCategory>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            degree_of_parallelism: 0,
            process_timeout_minutes: 0,
            trace_batch_size: DEFAULT_TRACE_BATCH_SIZE,
        }
    }
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            socket_path: ".build-golem/trace.sock".to_string(),
            session_name: DEFAULT_SESSION_NAME.to_string(),
            categories: vec![TraceCategory::Jit, TraceCategory::Loader],
        }
    }
}

impl ExecutionConfig {
    pub fn process_timeout(&self) -> Option<Duration> {
        match self.process_timeout_minutes {
            0 => None,
            minutes => Some(Duration::from_secs(u64::from(minutes) * 60)),
        }
    }
}

impl BuildGolemConfig {
    /// Run options, with `degree_override` (from `-j`) taking precedence.
    pub fn run_options(&self, degree_override: Option<usize>) -> RunOptions {
        RunOptions {
            degree_of_parallelism: degree_override
                .unwrap_or(self.execution.degree_of_parallelism),
            trace: TraceOptions {
                session_name: self.trace.session_name.clone(),
                categories: self.trace.categories.clone(),
                batch_size: self.execution.trace_batch_size,
            },
        }
    }

    pub fn socket_path(&self, project_root: &Path) -> PathBuf {
        project_root.join(&self.trace.socket_path)
    }
}

pub fn validate(config: &BuildGolemConfig) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();

    if config.execution.degree_of_parallelism > MAX_DEGREE_OF_PARALLELISM {
        errors.push(format!(
            "execution.degree_of_parallelism must be <= {}",
            MAX_DEGREE_OF_PARALLELISM
        ));
    }

    if config.execution.trace_batch_size < 1 {
        errors.push("execution.trace_batch_size must be >= 1".to_string());
    }

    if config.trace.socket_path.trim().is_empty() {
        errors.push("trace.socket_path must not be empty".to_string());
    }

    if config.trace.session_name.trim().is_empty() {
        errors.push("trace.session_name must not be empty".to_string());
    }

    if !config.trace.categories.contains(&TraceCategory::Jit) {
        errors.push("trace.categories must include \"jit\"".to_string());
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Load `build-golem.toml` from the project root, or defaults when absent.
pub fn load_config(project_root: &Path) -> Result<BuildGolemConfig, String> {
    let config_path = project_root.join(CONFIG_FILE_NAME);
    if !config_path.exists() {
        return Ok(BuildGolemConfig::default());
    }
    load_config_file(&config_path)
}

/// Load from an explicit path when given, otherwise from the project root.
pub fn load_config_from(
    config_path: Option<&Path>,
    project_root: &Path,
) -> Result<BuildGolemConfig, String> {
    match config_path {
        Some(path) => load_config_file(path),
        None => load_config(project_root),
    }
}

fn load_config_file(config_path: &Path) -> Result<BuildGolemConfig, String> {
    let contents = std::fs::read_to_string(config_path)
        .map_err(|e| format!("Failed to read {}: {}", config_path.display(), e))?;

    let config: BuildGolemConfig = toml::from_str(&contents)
        .map_err(|e| format!("Failed to parse {}: {}", config_path.display(), e))?;

    validate(&config).map_err(|errors| {
        format!(
            "Config validation failed:\n{}",
            errors
                .iter()
                .map(|e| format!("  - {}", e))
                .collect::<Vec<_>>()
                .join("\n")
        )
    })?;

    Ok(config)
}
