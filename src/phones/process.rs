//! Child process plumbing: long-running commands whose stdout/stderr are
//! drained line-wise into channels, and one-shot command execution.

use std::io::{BufRead, BufReader};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{debug, info, warn};

use crate::error::{Result, VoltaError};

/// A spawned child with two reader threads feeding its output into byte
/// channels. `close` terminates the child and flushes whatever is left in
/// the pipes before the readers exit.
pub struct PipedChild {
    child: Child,
    cmd: String,
    stdout_rx: Receiver<String>,
    stderr_rx: Receiver<String>,
    readers: Vec<JoinHandle<()>>,
}

impl PipedChild {
    pub fn spawn(cmd: &str) -> Result<PipedChild> {
        let parts: Vec<&str> = cmd.split_whitespace().collect();
        let (program, args) = parts
            .split_first()
            .ok_or_else(|| VoltaError::Config("empty command".into()))?;
        let mut child = Command::new(program)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| VoltaError::Resource(format!("failed to spawn '{cmd}': {e}")))?;
        debug!(cmd, pid = child.id(), "spawned child process");

        let (stdout_tx, stdout_rx) = unbounded();
        let (stderr_tx, stderr_rx) = unbounded();
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_pipe_reader("child-stdout", stdout, stdout_tx));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_pipe_reader("child-stderr", stderr, stderr_tx));
        }
        Ok(PipedChild {
            child,
            cmd: cmd.to_string(),
            stdout_rx,
            stderr_rx,
            readers,
        })
    }

    pub fn stdout(&self) -> Receiver<String> {
        self.stdout_rx.clone()
    }

    pub fn stderr(&self) -> Receiver<String> {
        self.stderr_rx.clone()
    }

    /// Exit status if the child has already terminated.
    pub fn try_wait(&mut self) -> Option<ExitStatus> {
        self.child.try_wait().ok().flatten()
    }

    /// Terminates the child (SIGTERM), waits for it to exit and joins the
    /// pipe readers. The readers drain the pipes to EOF, so nothing the
    /// child wrote is lost.
    pub fn close(&mut self) {
        if self.child.try_wait().ok().flatten().is_none() {
            debug!(cmd = %self.cmd, "terminating child process");
            unsafe {
                libc::kill(self.child.id() as libc::pid_t, libc::SIGTERM);
            }
        }
        match self.child.wait() {
            Ok(status) => info!(cmd = %self.cmd, %status, "child process finished"),
            Err(e) => warn!(cmd = %self.cmd, error = %e, "failed to wait for child"),
        }
        for reader in self.readers.drain(..) {
            let _ = reader.join();
        }
    }
}

fn spawn_pipe_reader<R>(name: &str, pipe: R, destination: Sender<String>) -> JoinHandle<()>
where
    R: std::io::Read + Send + 'static,
{
    thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let reader = BufReader::new(pipe);
            for line in reader.lines() {
                match line {
                    Ok(line) => {
                        if destination.send(line).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "pipe read failed");
                        break;
                    }
                }
            }
        })
        .expect("failed to spawn pipe reader thread")
}

/// Runs a command to completion and returns its output. Used for the device
/// probes and the adb one-shots.
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub status: ExitStatus,
}

pub fn run_command(cmd: &str) -> Result<CommandOutput> {
    let parts: Vec<&str> = cmd.split_whitespace().collect();
    let (program, args) = parts
        .split_first()
        .ok_or_else(|| VoltaError::Config("empty command".into()))?;
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|e| VoltaError::Resource(format!("failed to execute '{cmd}': {e}")))?;
    let result = CommandOutput {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        status: output.status,
    };
    debug!(cmd, status = %result.status, "command executed");
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn drains_stdout_to_channel() {
        let mut child = PipedChild::spawn("echo one two").unwrap();
        let rx = child.stdout();
        let line = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(line, "one two");
        child.close();
    }

    #[test]
    fn close_terminates_long_running_child() {
        let mut child = PipedChild::spawn("sleep 60").unwrap();
        let start = std::time::Instant::now();
        child.close();
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn close_flushes_remaining_output() {
        let mut child = PipedChild::spawn("printf a\\nb\\nc\\n").unwrap();
        let rx = child.stdout();
        child.close();
        let lines: Vec<String> = rx.try_iter().collect();
        assert_eq!(lines, vec!["a", "b", "c"]);
    }

    #[test]
    fn run_command_captures_output() {
        let out = run_command("echo hello").unwrap();
        assert_eq!(out.stdout.trim(), "hello");
        assert!(out.status.success());
    }
}
