use std::error::Error;

use build_golem::run_error::RunError;
use build_golem::trace::TraceError;

#[test]
fn setup_errors_exit_with_two() {
    for err in [
        RunError::Config("bad".into()),
        RunError::Manifest("bad".into()),
        RunError::Lock("held".into()),
        RunError::InvalidParallelism("5000".into()),
    ] {
        assert!(err.is_setup_error(), "{}", err);
        assert_eq!(err.exit_code(), 2);
    }
}

#[test]
fn trace_error_converts_and_keeps_source() {
    let err: RunError = TraceError::Open {
        session: "BuildGolemSession".into(),
        reason: "address in use".into(),
    }
    .into();

    assert!(!err.is_setup_error());
    assert_eq!(err.exit_code(), 3);
    assert!(err.source().is_some());
    let message: String = err.into();
    assert!(message.starts_with("Trace session failed"), "{}", message);
}

#[test]
fn scheduler_panic_is_internal() {
    let err = RunError::SchedulerPanicked("task 3 panicked".into());
    assert!(!err.is_setup_error());
    assert_eq!(err.exit_code(), 4);
}
