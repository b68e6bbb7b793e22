//! Tests for worker command construction.

use std::path::PathBuf;

use debug_mcp_wrapper::worker::WorkerCommand;

#[test]
fn debug_mcp_command_runs_bundled_script() {
    let command = WorkerCommand::debug_mcp("/usr/local/bin/php");

    assert_eq!(command.program(), "/usr/local/bin/php");
    assert_eq!(command.get_args(), ["bin/debug-mcp".to_string()]);
    assert!(command.get_working_dir().is_none());
}

#[test]
fn builder_accumulates_args() {
    let command = WorkerCommand::new("sh")
        .arg("-c")
        .args(["exec cat", "ignored"])
        .working_dir("/tmp");

    assert_eq!(command.get_args(), ["-c", "exec cat", "ignored"]);
    assert_eq!(command.get_working_dir(), Some(&PathBuf::from("/tmp")));
}
