// Standard library
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

// External crates
use crate::error::{CoreError, Result};
use duct::cmd;
use tracing::debug;
use which::which;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A fully described external command invocation.
#[derive(Debug, Clone, Default)]
pub struct CommandSpec {
    program: String,
    args: Vec<String>,
    dir: Option<PathBuf>,
    envs: Vec<(String, String)>,
    timeout: Option<Duration>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Kill the command if it is still running after `timeout`. `None` waits forever.
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// The full command line, as recorded in deployment logs.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Result of a finished command. `output` is stdout and stderr interleaved as the process wrote them.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub command_line: String,
    pub output: String,
    pub exit_code: Option<i32>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Run a command to completion, capturing combined stdout/stderr.
///
/// A non-zero exit is not an error here: callers inspect [`CommandOutput::success`] so the
/// captured output can still be recorded. Errors are reserved for spawn failures and timeouts.
/// This blocks the calling thread; async callers go through `spawn_blocking`.
pub fn run_captured(spec: &CommandSpec) -> Result<CommandOutput> {
    let command_line = spec.command_line();
    debug!(command = %command_line, "Running external command");

    let mut expression = cmd(spec.program.as_str(), &spec.args)
        .stderr_to_stdout()
        .stdout_capture()
        .unchecked();

    if let Some(dir) = &spec.dir {
        expression = expression.dir(dir);
    }
    for (key, value) in &spec.envs {
        expression = expression.env(key, value);
    }

    let handle = expression.start().map_err(|e| {
        CoreError::Command(format!("Failed to start command '{}': {}", command_line, e))
    })?;

    let start = Instant::now();

    loop {
        if let Some(limit) = spec.timeout {
            if start.elapsed() >= limit {
                let _ = handle.kill();
                return Err(CoreError::Timeout(format!(
                    "command exceeded {}s: {}",
                    limit.as_secs(),
                    command_line
                )));
            }
        }

        match handle.try_wait() {
            Ok(Some(output)) => {
                return Ok(CommandOutput {
                    command_line,
                    output: String::from_utf8_lossy(&output.stdout).into_owned(),
                    exit_code: output.status.code(),
                });
            }
            Ok(None) => thread::sleep(POLL_INTERVAL),
            Err(e) => {
                return Err(CoreError::Command(format!(
                    "Error waiting for command '{}': {}",
                    command_line, e
                )));
            }
        }
    }
}

/// Checks if a command-line tool is available in the system's PATH.
pub fn is_tool_installed(tool_name: &str) -> bool {
    which(tool_name).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_line_joins_program_and_args() {
        let spec = CommandSpec::new("terraform").args(["apply", "-auto-approve"]);
        assert_eq!(spec.command_line(), "terraform apply -auto-approve");
    }

    #[test]
    fn test_captures_stdout_and_stderr_with_exit_code() {
        let spec = CommandSpec::new("sh").args(["-c", "echo out; echo err 1>&2; exit 3"]);
        let output = run_captured(&spec).unwrap();

        assert!(!output.success());
        assert_eq!(output.exit_code, Some(3));
        assert!(output.output.contains("out"));
        assert!(output.output.contains("err"));
    }

    #[test]
    fn test_runs_in_working_directory_with_env() {
        let dir = std::env::temp_dir();
        let spec = CommandSpec::new("sh")
            .args(["-c", "pwd; echo $LAB_TEST_VALUE"])
            .dir(&dir)
            .env("LAB_TEST_VALUE", "marker-42");
        let output = run_captured(&spec).unwrap();

        assert!(output.success());
        assert!(output.output.contains("marker-42"));
    }

    #[test]
    fn test_timeout_kills_command() {
        let spec = CommandSpec::new("sleep")
            .arg("5")
            .timeout(Some(Duration::from_millis(300)));
        let start = Instant::now();

        match run_captured(&spec) {
            Err(CoreError::Timeout(msg)) => assert!(msg.contains("sleep 5")),
            other => panic!("Expected timeout, got {:?}", other),
        }
        assert!(start.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn test_missing_program_is_an_error() {
        let spec = CommandSpec::new("definitely-not-a-real-binary-xyz");
        assert!(run_captured(&spec).is_err());
    }
}
