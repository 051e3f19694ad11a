//! Stage handler that runs an external program.
//!
//! The projected input is written to the child's stdin as JSON and the
//! child's stdout is parsed as the stage result. Exit status decides the
//! error class: listed codes are transient, any other failure is fatal.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver};
use serde_json::{json, Value};

use super::stage::{StageError, StageHandler};

/// `EX_TEMPFAIL` from sysexits.h.
pub const EX_TEMPFAIL: i32 = 75;

const WAIT_POLL: Duration = Duration::from_millis(10);

/// How long a killed command's pipes are read before giving up on them.
const DRAIN_GRACE: Duration = Duration::from_millis(200);

/// Formats a failed run with stderr, falling back to stdout and the exit code.
fn format_command_error(status: ExitStatus, stdout: &str, stderr: &str) -> String {
    let stderr = stderr.trim();
    let stdout = stdout.trim();
    match (stderr.is_empty(), stdout.is_empty()) {
        (true, true) => match status.code() {
            Some(code) => format!("command failed with exit code {}", code),
            None => "command terminated by signal".to_string(),
        },
        (false, _) => stderr.to_string(),
        (true, false) => stdout.to_string(),
    }
}

fn drain<R: Read + Send + 'static>(source: Option<R>) -> Receiver<String> {
    let (tx, rx) = bounded(1);
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut source) = source {
            let _ = source.read_to_end(&mut buf);
        }
        let _ = tx.send(String::from_utf8_lossy(&buf).into_owned());
    });
    rx
}

/// Kills the command together with anything it forked, then reaps it.
///
/// The child leads its own process group, so grandchildren holding the
/// output pipes die with it.
fn kill_tree(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::errno::Errno;
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        match killpg(Pid::from_raw(child.id() as i32), Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => log::warn!("Failed to kill process group {}: {}", child.id(), e),
        }
    }
    let _ = child.kill();
    let _ = child.wait();
}

#[derive(Debug, Clone)]
pub struct CommandHandler {
    program: PathBuf,
    args: Vec<String>,
    env: Vec<(String, String)>,
    working_dir: Option<PathBuf>,
    timeout: Option<Duration>,
    transient_exit_codes: Vec<i32>,
}

impl CommandHandler {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            working_dir: None,
            timeout: None,
            transient_exit_codes: vec![EX_TEMPFAIL],
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.push((key.to_string(), value.to_string()));
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Kills the child and reports a transient error after `timeout`.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn transient_exit_codes(mut self, codes: Vec<i32>) -> Self {
        self.transient_exit_codes = codes;
        self
    }

    fn spawn(&self, job_id: &str, input: &Value) -> Result<Child, StageError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .env("LABFLOW_JOB_ID", job_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(stage) = input.get("stage").and_then(Value::as_str) {
            cmd.env("LABFLOW_STAGE", stage);
        }
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        cmd.spawn().map_err(|e| {
            StageError::fatal(format!(
                "failed to start '{}': {}",
                self.program.display(),
                e
            ))
        })
    }

    /// Waits for the child, killing it once the timeout elapses.
    /// Returns `None` on timeout.
    fn wait(&self, child: &mut Child) -> Result<Option<ExitStatus>, StageError> {
        let started = Instant::now();
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Ok(Some(status)),
                Ok(None) => {}
                Err(e) => {
                    kill_tree(child);
                    return Err(StageError::transient(format!("wait failed: {}", e)));
                }
            }
            if let Some(timeout) = self.timeout {
                if started.elapsed() >= timeout {
                    kill_tree(child);
                    return Ok(None);
                }
            }
            thread::sleep(WAIT_POLL);
        }
    }
}

impl StageHandler for CommandHandler {
    fn invoke(&self, job_id: &str, input: &Value) -> Result<Value, StageError> {
        let payload = serde_json::to_vec(input)
            .map_err(|e| StageError::fatal(format!("failed to encode stage input: {}", e)))?;

        let mut child = self.spawn(job_id, input)?;

        let stdin = child.stdin.take();
        let writer = thread::spawn(move || {
            if let Some(mut stdin) = stdin {
                // A child that never reads its input closes the pipe early.
                let _ = stdin.write_all(&payload);
            }
        });
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        // After a kill the pipe readers and the stdin writer are left to
        // finish on their own.
        let Some(status) = self.wait(&mut child)? else {
            let stderr = stderr.recv_timeout(DRAIN_GRACE).unwrap_or_default();
            log::debug!(
                "'{}' killed after timeout, stderr: {}",
                self.program.display(),
                stderr.trim()
            );
            return Err(StageError::transient(format!(
                "'{}' timed out after {:?}",
                self.program.display(),
                self.timeout.unwrap_or_default()
            )));
        };
        let _ = writer.join();
        let stdout = stdout.recv().unwrap_or_default();
        let stderr = stderr.recv().unwrap_or_default();

        if !status.success() {
            let message = format_command_error(status, &stdout, &stderr);
            let transient = status
                .code()
                .is_some_and(|code| self.transient_exit_codes.contains(&code));
            return Err(if transient {
                StageError::Transient(message)
            } else {
                StageError::Fatal(message)
            });
        }

        if stdout.trim().is_empty() {
            return Ok(json!({}));
        }
        serde_json::from_str(&stdout)
            .map_err(|e| StageError::fatal(format!("stage output is not valid JSON: {}", e)))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> CommandHandler {
        CommandHandler::new("sh").args(["-c", script])
    }

    #[test]
    fn test_stdout_json_becomes_result() {
        let handler = sh("cat");
        let input = json!({ "job_id": "j1", "stage": "parse", "params": { "file_key": "k" } });
        let output = handler.invoke("j1", &input).unwrap();
        assert_eq!(output, input);
    }

    #[test]
    fn test_job_and_stage_are_exported() {
        let handler = sh(r#"printf '{"job":"%s","stage":"%s"}' "$LABFLOW_JOB_ID" "$LABFLOW_STAGE""#);
        let output = handler
            .invoke("j7", &json!({ "stage": "normalize" }))
            .unwrap();
        assert_eq!(output, json!({ "job": "j7", "stage": "normalize" }));
    }

    #[test]
    fn test_empty_stdout_is_empty_object() {
        let output = sh("true").invoke("j1", &json!({})).unwrap();
        assert_eq!(output, json!({}));
    }

    #[test]
    fn test_tempfail_exit_is_transient() {
        let err = sh("echo 'storage busy' >&2; exit 75")
            .invoke("j1", &json!({}))
            .unwrap_err();
        assert_eq!(err, StageError::transient("storage busy"));
    }

    #[test]
    fn test_other_exit_is_fatal() {
        let err = sh("exit 3").invoke("j1", &json!({})).unwrap_err();
        assert_eq!(err, StageError::fatal("command failed with exit code 3"));
    }

    #[test]
    fn test_custom_transient_codes() {
        let err = sh("exit 3")
            .transient_exit_codes(vec![3])
            .invoke("j1", &json!({}))
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn test_invalid_json_is_fatal() {
        let err = sh("echo not-json").invoke("j1", &json!({})).unwrap_err();
        assert!(!err.is_transient());
        assert!(err.message().contains("not valid JSON"));
    }

    #[test]
    fn test_missing_program_is_fatal() {
        let err = CommandHandler::new("/nonexistent/labflow-stage")
            .invoke("j1", &json!({}))
            .unwrap_err();
        assert!(!err.is_transient());
    }

    #[test]
    fn test_timeout_kills_forked_children() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("finished");
        let script = format!("sleep 1; touch '{}'", marker.display());

        let started = Instant::now();
        let err = sh(&script)
            .timeout(Duration::from_millis(100))
            .invoke("j1", &json!({}))
            .unwrap_err();

        assert!(err.is_transient());
        assert!(started.elapsed() < Duration::from_millis(900));
        thread::sleep(Duration::from_millis(1300));
        assert!(!marker.exists(), "forked shell outlived the timeout");
    }

    #[test]
    fn test_timeout_with_sleeping_grandchild_returns_promptly() {
        let started = Instant::now();
        let err = sh("sleep 3; true")
            .timeout(Duration::from_millis(100))
            .invoke("j1", &json!({}))
            .unwrap_err();
        assert!(err.is_transient());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_timeout_is_transient() {
        let err = sh("exec sleep 5")
            .timeout(Duration::from_millis(100))
            .invoke("j1", &json!({}))
            .unwrap_err();
        assert!(err.is_transient());
        assert!(err.message().contains("timed out"));
    }
}
