//! Interactive monitor: one command per line, reply printed verbatim.

use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::time::Duration;

use tracing::{debug, warn};

use crate::qmp::{QmpClient, QmpError};
use crate::vm::VmId;

pub const PROMPT: &str = "qarax> ";

/// Something that executes a monitor command line and returns its text reply.
pub trait MonitorEndpoint {
    fn execute(&mut self, command: &str) -> Result<String, QmpError>;
}

/// Runs every command over a fresh QMP connection.
pub struct QmpMonitor {
    socket: PathBuf,
    timeout: Duration,
}

impl QmpMonitor {
    pub fn new(socket: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            socket: socket.into(),
            timeout,
        }
    }
}

impl MonitorEndpoint for QmpMonitor {
    fn execute(&mut self, command: &str) -> Result<String, QmpError> {
        QmpClient::connect(&self.socket, self.timeout)?.human_monitor_command(command)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MonitorSummary {
    pub executed: usize,
    pub failed: usize,
}

pub struct MonitorSession<E> {
    vmid: VmId,
    endpoint: E,
}

impl<E: MonitorEndpoint> MonitorSession<E> {
    pub fn new(vmid: VmId, endpoint: E) -> Self {
        Self { vmid, endpoint }
    }

    /// Read commands from `input` until `q`, `quit` or end of input.
    ///
    /// Only I/O errors on `input`/`output` end the session early; command
    /// failures are printed and the loop goes on.
    pub fn run<R, W>(&mut self, input: &mut R, output: &mut W) -> std::io::Result<MonitorSummary>
    where
        R: BufRead,
        W: Write,
    {
        let mut summary = MonitorSummary::default();
        writeln!(
            output,
            "Entering monitor for VM {} - type 'help' for help",
            self.vmid
        )?;

        let mut line = String::new();
        loop {
            write!(output, "{PROMPT}")?;
            output.flush()?;

            line.clear();
            if input.read_line(&mut line)? == 0 {
                writeln!(output)?;
                break;
            }

            let command = line.trim();
            if command.is_empty() {
                continue;
            }
            if command == "q" || command == "quit" {
                break;
            }

            summary.executed += 1;
            match self.endpoint.execute(command) {
                Ok(reply) => output.write_all(reply.as_bytes())?,
                Err(e) => {
                    summary.failed += 1;
                    warn!(vmid = %self.vmid, error = %e, "monitor command failed");
                    writeln!(output, "ERROR: {e}")?;
                }
            }
        }

        debug!(vmid = %self.vmid, ?summary, "monitor session finished");
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::qmp::tests::serve_once;
    use std::io::Cursor;
    use std::os::unix::net::UnixListener;

    /// Replies `reply:<cmd>` unless the command is `boom` or `bare`.
    #[derive(Default)]
    struct Scripted {
        seen: Vec<String>,
    }

    impl MonitorEndpoint for Scripted {
        fn execute(&mut self, command: &str) -> Result<String, QmpError> {
            self.seen.push(command.to_string());
            if command == "boom" {
                return Err(QmpError::Command {
                    class: "GenericError".into(),
                    desc: "device not found".into(),
                });
            }
            if command == "bare" {
                return Ok("no trailing newline".into());
            }
            Ok(format!("reply:{command}\n"))
        }
    }

    fn vmid() -> VmId {
        VmId::new(100).unwrap()
    }

    fn run(input: &str) -> (MonitorSummary, String, Vec<String>) {
        let mut session = MonitorSession::new(vmid(), Scripted::default());
        let mut output = Vec::new();
        let summary = session
            .run(&mut Cursor::new(input.as_bytes()), &mut output)
            .unwrap();
        (
            summary,
            String::from_utf8(output).unwrap(),
            session.endpoint.seen,
        )
    }

    #[test]
    fn failing_command_does_not_end_session() {
        let (summary, output, seen) = run("info status\nboom\ninfo cpus\nquit\n");

        assert_eq!(seen, vec!["info status", "boom", "info cpus"]);
        assert_eq!(
            summary,
            MonitorSummary {
                executed: 3,
                failed: 1
            }
        );
        let status = output.find("reply:info status").unwrap();
        let error = output.find("ERROR: device not found").unwrap();
        let cpus = output.find("reply:info cpus").unwrap();
        assert!(status < error && error < cpus);
    }

    #[test]
    fn blank_lines_then_q_run_nothing() {
        let (summary, output, seen) = run("\n   \n\t\n q \n");
        assert!(seen.is_empty());
        assert_eq!(summary, MonitorSummary::default());
        assert!(!output.contains("ERROR:"));
    }

    #[test]
    fn end_of_input_ends_session() {
        let (summary, _, seen) = run("info version\n");
        assert_eq!(seen, vec!["info version"]);
        assert_eq!(summary.executed, 1);
    }

    #[test]
    fn commands_are_trimmed_and_replies_printed_verbatim() {
        let (_, output, seen) = run("  info block  \nquit\n");
        assert_eq!(seen, vec!["info block"]);
        assert!(output.contains("reply:info block\n"));
        assert!(output.starts_with("Entering monitor for VM 100"));
    }

    #[test]
    fn reply_bytes_are_not_padded_with_a_newline() {
        let (_, output, _) = run("bare
quit
");
        assert!(output.contains(&format!("no trailing newline{PROMPT}")));
    }

    #[test]
    fn qmp_monitor_reports_connection_faults_per_command() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("100.qmp");
        let listener = UnixListener::bind(&path).unwrap();
        let server = serve_once(listener, vec!["{\"return\": \"running\\n\"}\n"]);

        let mut session =
            MonitorSession::new(vmid(), QmpMonitor::new(&path, Duration::from_secs(5)));
        let mut output = Vec::new();
        // The second command finds no listener and fails on its own.
        let summary = session
            .run(
                &mut Cursor::new(&b"info status\ninfo status\nq\n"[..]),
                &mut output,
            )
            .unwrap();
        server.join().unwrap();

        let output = String::from_utf8(output).unwrap();
        assert!(output.contains("running\n"));
        assert_eq!(output.matches("ERROR:").count(), 1);
        assert_eq!(summary, MonitorSummary { executed: 2, failed: 1 });
    }
}
