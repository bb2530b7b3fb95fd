//! Shell command execution for the host-side iSCSI and multipath tooling.

use std::process::Command;

use tracing::{debug, warn};

/// Captured result of a host command. A non-zero status is data, not an
/// error: most of the iSCSI tooling reports expected conditions through
/// exit codes.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub status: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Executes host commands. Implemented by [`HostCommandRunner`] in
/// production and by canned fakes in tests.
pub trait CommandRunner: Send + Sync {
    /// Runs `argv[0]` with the remaining arguments, capturing stdout.
    /// Never fails: a command that cannot be spawned is reported as an
    /// empty output with a non-zero status.
    fn run(&self, argv: &[&str]) -> CommandOutput;
}

/// Runs commands directly on the host.
#[derive(Debug, Default)]
pub struct HostCommandRunner;

impl CommandRunner for HostCommandRunner {
    fn run(&self, argv: &[&str]) -> CommandOutput {
        debug!("Running {:?}", argv);
        let (program, args) = match argv.split_first() {
            Some(split) => split,
            None => return CommandOutput { stdout: String::new(), status: -1 },
        };

        match Command::new(program).args(args).output() {
            Ok(output) => CommandOutput {
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                status: output.status.code().unwrap_or(-1),
            },
            Err(e) => {
                warn!("Failed to spawn {:?}: {}", argv, e);
                CommandOutput { stdout: String::new(), status: -1 }
            }
        }
    }
}

/// Canned command runner shared by the iSCSI and driver tests.
#[cfg(test)]
pub mod testing {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::{CommandOutput, CommandRunner};

    /// Replays canned outputs keyed on the space-joined argv. Unmatched
    /// commands succeed with empty output. Every call is recorded.
    #[derive(Default)]
    pub struct FakeRunner {
        responses: Mutex<HashMap<String, CommandOutput>>,
        calls: Mutex<Vec<String>>,
    }

    impl FakeRunner {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn respond(&self, command: &str, stdout: &str, status: i32) {
            self.responses.lock().unwrap().insert(
                command.to_string(),
                CommandOutput { stdout: stdout.to_string(), status },
            );
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        pub fn ran(&self, command: &str) -> bool {
            self.calls().iter().any(|c| c == command)
        }
    }

    impl CommandRunner for FakeRunner {
        fn run(&self, argv: &[&str]) -> CommandOutput {
            let command = argv.join(" ");
            self.calls.lock().unwrap().push(command.clone());
            self.responses
                .lock()
                .unwrap()
                .get(&command)
                .cloned()
                .unwrap_or_default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_captures_stdout_of_successful_command() {
        let output = HostCommandRunner.run(&["echo", "hello"]);
        assert!(output.success());
        assert_eq!(output.stdout.trim(), "hello");
    }

    #[test]
    fn test_nonzero_exit_is_not_an_error() {
        let output = HostCommandRunner.run(&["false"]);
        assert!(!output.success());
    }

    #[test]
    fn test_unspawnable_command_reports_failure_status() {
        let output = HostCommandRunner.run(&["/nonexistent/binary-for-test"]);
        assert!(!output.success());
        assert!(output.stdout.is_empty());
    }
}
