//! Builder describing how a worker process is launched.

use std::path::PathBuf;

use tokio::process::Command;

/// Program run when no executable is configured.
pub const DEFAULT_EXECUTABLE: &str = "php";

/// Entry script of the debug-mcp server, relative to the working directory.
pub const DEFAULT_WORKER_SCRIPT: &str = "bin/debug-mcp";

/// Builder for the worker's program, fixed argument list and working directory.
///
/// A command is immutable once handed to the supervisor; every restart spawns
/// a fresh process from the same description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    program: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
}

impl WorkerCommand {
    /// Create a command for the given program with no arguments.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
        }
    }

    /// The debug-mcp server run by the given PHP binary.
    #[must_use]
    pub fn debug_mcp(php_binary: impl Into<String>) -> Self {
        Self::new(php_binary).arg(DEFAULT_WORKER_SCRIPT)
    }

    /// Append a single argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set the working directory for the worker process.
    #[must_use]
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Get the working directory, if set.
    #[must_use]
    pub fn get_working_dir(&self) -> Option<&PathBuf> {
        self.working_dir.as_ref()
    }

    /// Get the program name or path.
    #[must_use]
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Get the argument list.
    #[must_use]
    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    pub(crate) fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);

        if let Some(ref dir) = self.working_dir {
            cmd.current_dir(dir);
        }

        cmd
    }
}

impl Default for WorkerCommand {
    fn default() -> Self {
        Self::debug_mcp(DEFAULT_EXECUTABLE)
    }
}
