pub mod batch;
pub mod config;
pub mod lock;
pub mod log;
pub mod manifest;
pub mod parallel;
pub mod preflight;
pub mod run_error;
pub mod runner;
pub mod scheduler;
pub mod slot;
pub mod trace;
pub mod trace_log;
pub mod trace_socket;
pub mod types;
