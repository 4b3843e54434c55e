use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};

use build_golem::batch::{batch_size_for, plan_batches};
use build_golem::config;
use build_golem::lock;
use build_golem::log::parse_log_level;
use build_golem::manifest;
use build_golem::parallel::{needs_trace, resolve_parallelism, run_parallel};
use build_golem::preflight;
use build_golem::run_error::RunError;
use build_golem::runner::{
    install_signal_handlers, is_shutdown_requested, kill_all_children, running_child_count,
    CommandRunner,
};
use build_golem::scheduler::order_by_cost;
use build_golem::trace_socket::SocketTraceSource;
use build_golem::types::{ExitState, RunSummary, WorkItem};
use build_golem::{log_error, log_info, log_warn};

/// How often the shutdown monitor checks the signal flag.
const SHUTDOWN_POLL_MS: u64 = 100;

#[derive(Parser)]
#[command(
    name = "build-golem",
    about = "Run independent build commands in parallel"
)]
struct Cli {
    /// Project root directory (defaults to current directory)
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// Path to config file (defaults to {root}/build-golem.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log verbosity level (error, warn, info, debug)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every build in the manifest
    Run {
        /// Build manifest (TOML with [[build]] tables)
        #[arg(long, short)]
        manifest: PathBuf,
        /// Maximum concurrent builds (0 = logical processor count)
        #[arg(long, short = 'j')]
        jobs: Option<usize>,
        /// Write the run summary as JSON to this path
        #[arg(long)]
        summary: Option<PathBuf>,
    },
    /// Show launch order and trace batches without running anything
    Plan {
        /// Build manifest (TOML with [[build]] tables)
        #[arg(long, short)]
        manifest: PathBuf,
        /// Maximum concurrent builds (0 = logical processor count)
        #[arg(long, short = 'j')]
        jobs: Option<usize>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match parse_log_level(&cli.log_level) {
        Ok(level) => build_golem::log::set_log_level(level),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }

    let config_path = cli.config.as_deref();
    let result = match cli.command {
        Commands::Run {
            manifest,
            jobs,
            summary,
        } => handle_run(&cli.root, config_path, &manifest, jobs, summary.as_deref()).await,
        Commands::Plan { manifest, jobs } => {
            handle_plan(&cli.root, config_path, &manifest, jobs).map(|()| true)
        }
    };

    match result {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            log_error!("Error: {}", e);
            std::process::exit(e.exit_code());
        }
    }
}

fn load_items(manifest_path: &Path) -> Result<Vec<WorkItem>, RunError> {
    manifest::load_manifest(manifest_path).map_err(RunError::Manifest)
}

/// Returns `Ok(false)` when the run finished but some builds failed.
async fn handle_run(
    root: &Path,
    config_path: Option<&Path>,
    manifest_path: &Path,
    jobs: Option<usize>,
    summary_path: Option<&Path>,
) -> Result<bool, RunError> {
    install_signal_handlers().map_err(RunError::Config)?;

    log_info!("--- Build Golem ---");
    log_info!("");

    let config = config::load_config_from(config_path, root).map_err(RunError::Config)?;
    let socket_path = config.socket_path(root);

    log_info!("[pre] Acquiring lock...");
    let run_lock =
        lock::acquire(&root.join(".build-golem"), &socket_path).map_err(RunError::Lock)?;

    let items = load_items(manifest_path)?;

    log_info!("[pre] Running preflight checks...");
    if let Err(errors) = preflight::run_preflight(&items, manifest_path) {
        for e in &errors {
            log_error!("{}", e);
        }
        return Err(RunError::Manifest(format!(
            "preflight failed with {} error(s)",
            errors.len()
        )));
    }
    log_info!("[pre] Preflight passed.");

    let options = config.run_options(jobs);
    log_info!("");
    log_info!(
        "[config] Parallelism: {}, timeout: {}, trace batch size: {}",
        match options.degree_of_parallelism {
            0 => "auto".to_string(),
            n => n.to_string(),
        },
        match config.execution.process_timeout_minutes {
            0 => "none".to_string(),
            m => format!("{}min", m),
        },
        options.trace.batch_size
    );
    if needs_trace(&items) {
        log_info!("[config] Trace socket: {}", run_lock.socket_path().display());
    }
    log_info!("");

    let runner = Arc::new(CommandRunner::new(
        config.execution.process_timeout(),
        Some(run_lock.socket_path().to_path_buf()),
    ));
    let trace_source = SocketTraceSource::new(run_lock.socket_path());

    // Kill builds as soon as a signal arrives; the scheduler then sees them
    // exit and the run winds down with every build recorded.
    let monitor = tokio::spawn(async {
        loop {
            if is_shutdown_requested() && running_child_count() > 0 {
                log_warn!("Shutdown requested, killing running builds");
                if let Err(e) = tokio::task::spawn_blocking(kill_all_children).await {
                    log_warn!("kill_all_children task panicked: {}", e);
                }
            }
            tokio::time::sleep(Duration::from_millis(SHUTDOWN_POLL_MS)).await;
        }
    });

    let result = run_parallel(items, runner, &trace_source, &options).await;
    monitor.abort();
    let summary = result?;

    print_summary(&summary);
    if let Some(path) = summary_path {
        write_summary(path, &summary).map_err(RunError::Config)?;
        log_info!("Summary written to {}", path.display());
    }

    Ok(summary.all_succeeded())
}

fn handle_plan(
    root: &Path,
    config_path: Option<&Path>,
    manifest_path: &Path,
    jobs: Option<usize>,
) -> Result<(), RunError> {
    let config = config::load_config_from(config_path, root).map_err(RunError::Config)?;
    let mut items = load_items(manifest_path)?;
    let options = config.run_options(jobs);
    let degree = resolve_parallelism(options.degree_of_parallelism, items.len())?;

    order_by_cost(&mut items);
    println!("{} builds, parallelism {}", items.len(), degree);
    for (ordinal, item) in items.iter().enumerate() {
        println!(
            "{:>4}  cost={:<8} {}{}",
            ordinal,
            item.cost(),
            item.command().name,
            if item.collect_trace() { " [trace]" } else { "" }
        );
    }

    if needs_trace(&items) {
        let batch_size = batch_size_for(degree, options.trace.batch_size);
        let batches = plan_batches(items.len(), batch_size);
        println!();
        println!("{} trace batch(es) of up to {}:", batches.len(), batch_size);
        for (number, range) in batches.iter().enumerate() {
            println!("  batch {}: ordinals {}..{}", number + 1, range.start, range.end);
        }
    }

    Ok(())
}

fn print_summary(summary: &RunSummary) {
    log_info!("\n--- Run Summary ---");
    log_info!(
        "Builds: {} ({} succeeded, {} failed)",
        summary.records.len(),
        summary.succeeded(),
        summary.failed()
    );
    if summary.timed_out() > 0 {
        log_info!("Timed out: {}", summary.timed_out());
    }
    if summary.launch_failed() > 0 {
        log_info!("Failed to launch: {}", summary.launch_failed());
    }
    if summary.trace_sessions > 0 {
        log_info!("Trace sessions: {}", summary.trace_sessions);
    }
    for record in summary.records.iter().filter(|r| !r.is_success()) {
        let detail = match &record.exit {
            ExitState::LaunchFailed { reason } => reason.clone(),
            other => other.to_string(),
        };
        log_info!("  FAILED {}: {}", record.name, detail);
    }
}

fn write_summary(path: &Path, summary: &RunSummary) -> Result<(), String> {
    let json = serde_json::to_string_pretty(summary)
        .map_err(|e| format!("Failed to serialize summary: {}", e))?;
    std::fs::write(path, json).map_err(|e| format!("Failed to write {}: {}", path.display(), e))
}
