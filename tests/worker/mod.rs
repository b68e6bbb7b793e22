//! Worker module tests.

mod command_test;

/// Verify all public worker types are exported from the library.
#[test]
fn test_all_worker_types_exported() {
    use debug_mcp_wrapper::worker::{
        SpawnError, StopError, StopOutcome, WorkerCommand, WorkerError, DEFAULT_EXECUTABLE,
        DEFAULT_STOP_TIMEOUT, DEFAULT_WORKER_SCRIPT,
    };

    let _ = WorkerCommand::default();
    let _: fn() -> SpawnError = || SpawnError::MissingPipe("stdin");
    let _: fn() -> WorkerError = || WorkerError::ReaperGone;
    let _: fn(WorkerError) -> StopError = StopError::Wait;
    let _ = StopOutcome::Graceful;

    assert_eq!(DEFAULT_EXECUTABLE, "php");
    assert_eq!(DEFAULT_WORKER_SCRIPT, "bin/debug-mcp");
    assert_eq!(DEFAULT_STOP_TIMEOUT.as_secs(), 5);
}
