//! Proxy module tests.

mod supervisor_test;

/// Verify all public proxy types are exported from the library.
#[test]
fn test_all_proxy_types_exported() {
    use debug_mcp_wrapper::proxy::{
        ExponentialBackoff, FixedBackoff, ForwardError, ReplayBuffer, ReplayError,
        RestartReason, RespawnBackoff, StateMachine, Supervisor, SupervisorSettings,
        SupervisorState, WorkerInfo, DEFAULT_BUFFER_CAPACITY, DEFAULT_RESPAWN_DELAY,
        DEFAULT_RESTART_INTERVAL,
    };
    use debug_mcp_wrapper::worker::WorkerCommand;

    let _ = ReplayBuffer::new(DEFAULT_BUFFER_CAPACITY);
    let _ = StateMachine::new();
    let _ = Supervisor::new(SupervisorSettings::new(WorkerCommand::default()));
    let _: fn(usize) -> ReplayError = ReplayError::sink_closed;
    let _: fn(std::io::Error) -> ForwardError = ForwardError::ReadInput;
    let _ = RestartReason::Crashed;
    let _ = SupervisorState::Recovering;
    let _ = WorkerInfo::default();

    assert_eq!(FixedBackoff::default().delay(0), DEFAULT_RESPAWN_DELAY);
    assert!(ExponentialBackoff::default().delay(100) <= std::time::Duration::from_secs(30));
    assert_eq!(DEFAULT_RESTART_INTERVAL.as_secs(), 60);
}
