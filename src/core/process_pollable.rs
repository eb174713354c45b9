//! Process pollable: runs an external command, enforces a timeout, captures
//! streams, and retries on failure up to a bound.
//!
//! Grounded on `src/core/runtime.rs`'s non-blocking reap idiom
//! (`libc::waitpid(pid, &mut status, libc::WNOHANG)` inside a polling loop
//! bounded by `Instant`), generalized from "wait for a known child to exit" into
//! a full start/poll/cancel/retry pollable.

use std::io::Read;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use crate::core::events::{Event, ProgramKind};
use crate::core::pollable::{PollOutcome, Pollable};
use crate::error::{Error, Result};

/// Name used in error messages and events for this pollable variant.
pub const KIND: &str = "process pollable";

/// Captured output of a completed (or exhausted) process pollable.
#[derive(Debug, Clone, Default)]
pub struct ProcessOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Runs `command` (a `sh -c`-style string, already quoted by the caller) to
/// completion, respecting `timeout` and retrying up to `allowed_errors` times on
/// non-zero exit.
pub struct ProcessPollable {
    command: String,
    timeout: Option<Duration>,
    allowed_errors: u32,
    stdout_sink: Option<PathBuf>,
    started_at: Option<Instant>,
    child: Option<Child>,
    remaining_retries: u32,
    output: ProcessOutput,
    cancelled: bool,
    context: Option<(String, ProgramKind)>,
    pending_events: Vec<Event>,
}

impl ProcessPollable {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            timeout: None,
            allowed_errors: 0,
            stdout_sink: None,
            started_at: None,
            child: None,
            remaining_retries: 0,
            output: ProcessOutput::default(),
            cancelled: false,
            context: None,
            pending_events: Vec::new(),
        }
    }

    /// Tags this pollable with the service and program kind it runs on behalf
    /// of, so its `poll()` can emit the matching [`Event`] variants instead of
    /// completing silently.
    pub fn with_context(mut self, service: impl Into<String>, kind: ProgramKind) -> Self {
        self.context = Some((service.into(), kind));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_allowed_errors(mut self, allowed_errors: u32) -> Self {
        self.allowed_errors = allowed_errors;
        self.remaining_retries = allowed_errors;
        self
    }

    pub fn with_stdout_sink(mut self, path: PathBuf) -> Self {
        self.stdout_sink = Some(path);
        self
    }

    pub fn output(&self) -> &ProcessOutput {
        &self.output
    }

    fn spawn(&mut self) -> Result<()> {
        let mut command = Command::new("sh");
        command.arg("-c").arg(&self.command);
        command.stdin(Stdio::null());
        command.stderr(Stdio::piped());
        match &self.stdout_sink {
            Some(path) => {
                let file = std::fs::File::create(path).map_err(|source| Error::Io {
                    path: path.clone(),
                    source,
                })?;
                command.stdout(Stdio::from(file));
            }
            None => {
                command.stdout(Stdio::piped());
            }
        }
        let child = command
            .spawn()
            .map_err(|source| Error::Io { path: PathBuf::from(&self.command), source })?;
        self.child = Some(child);
        self.started_at = Some(Instant::now());
        Ok(())
    }
}

impl Pollable for ProcessPollable {
    fn start(&mut self) -> Result<()> {
        if self.started_at.is_some() {
            return Err(Error::api_misuse("process pollable started twice"));
        }
        self.spawn()
    }

    fn poll(&mut self) -> Result<PollOutcome> {
        if self.cancelled {
            return Ok(PollOutcome::Done);
        }
        let started_at = self
            .started_at
            .ok_or_else(|| Error::api_misuse("process pollable polled before start"))?;

        if let Some(timeout) = self.timeout {
            if started_at.elapsed() > timeout {
                if let Some(mut child) = self.child.take() {
                    let _ = kill_child(&child);
                    let _ = child.wait();
                }
                if let Some((service, _)) = &self.context {
                    self.pending_events.push(Event::PollableTimedOut {
                        service: service.clone(),
                        pollable: KIND.to_string(),
                    });
                }
                return Err(Error::TimeoutError {
                    pollable: KIND,
                    elapsed_secs: started_at.elapsed().as_secs(),
                    budget_secs: timeout.as_secs(),
                });
            }
        }

        let child = self
            .child
            .as_mut()
            .ok_or_else(|| Error::api_misuse("process pollable polled after cancel"))?;

        // Non-blocking reap: mirrors the teacher's `wait_for_process_exit`, which
        // never calls the blocking `Child::wait`.
        let pid = child.id() as libc::pid_t;
        let mut status: libc::c_int = 0;
        let reaped = unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) };
        if reaped == 0 {
            return Ok(PollOutcome::NotDone);
        }
        if reaped < 0 {
            return Err(Error::iaas("waitpid failed for process pollable"));
        }

        let exit_code = if libc::WIFEXITED(status) {
            libc::WEXITSTATUS(status)
        } else {
            -1
        };

        let mut child = self.child.take().expect("child present");
        if let Some(mut stderr) = child.stderr.take() {
            let mut buf = String::new();
            let _ = stderr.read_to_string(&mut buf);
            self.output.stderr = buf;
        }
        if self.stdout_sink.is_none() {
            if let Some(mut stdout) = child.stdout.take() {
                let mut buf = String::new();
                let _ = stdout.read_to_string(&mut buf);
                self.output.stdout = buf;
            }
        }
        self.output.exit_code = Some(exit_code);

        if exit_code == 0 {
            if let Some((service, kind)) = &self.context {
                self.pending_events.push(Event::ProgramCompleted {
                    service: service.clone(),
                    kind: *kind,
                    exit_code,
                });
            }
            return Ok(PollOutcome::Done);
        }

        if self.remaining_retries > 0 {
            self.remaining_retries -= 1;
            if let Some((service, kind)) = &self.context {
                self.pending_events.push(Event::ProgramRetried {
                    service: service.clone(),
                    kind: *kind,
                    attempts_remaining: self.remaining_retries,
                });
            }
            self.spawn()?;
            return Ok(PollOutcome::NotDone);
        }

        Err(Error::ServiceError {
            service: String::new(),
            host: None,
            pollable: KIND,
            message: format!("command `{}` exited {exit_code}", self.command),
            stdout: self.output.stdout.clone(),
            stderr: self.output.stderr.clone(),
        })
    }

    fn cancel(&mut self) {
        if let Some(child) = &mut self.child {
            let _ = kill_child(child);
            let _ = child.wait();
        }
        self.child = None;
        self.cancelled = true;
    }

    fn drain_events(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.pending_events)
    }
}

fn kill_child(child: &Child) -> std::io::Result<()> {
    let pid = child.id() as libc::pid_t;
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drive_to_done(pollable: &mut ProcessPollable) -> Result<()> {
        pollable.start()?;
        loop {
            match pollable.poll()? {
                PollOutcome::Done => return Ok(()),
                PollOutcome::NotDone => std::thread::sleep(Duration::from_millis(10)),
            }
        }
    }

    #[test]
    fn succeeds_on_zero_exit() {
        let mut pollable = ProcessPollable::new("true");
        drive_to_done(&mut pollable).unwrap();
        assert_eq!(pollable.output().exit_code, Some(0));
    }

    #[test]
    fn fails_after_exhausting_retries() {
        let mut pollable = ProcessPollable::new("false").with_allowed_errors(1);
        let err = drive_to_done(&mut pollable).unwrap_err();
        assert!(matches!(err, Error::ServiceError { .. }));
    }

    #[test]
    fn retries_recover_from_a_transient_failure() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("marker");
        let command = format!(
            "test -f {0} && exit 0 || (touch {0} && exit 1)",
            marker.display()
        );
        let mut pollable = ProcessPollable::new(command).with_allowed_errors(1);
        drive_to_done(&mut pollable).unwrap();
        assert_eq!(pollable.output().exit_code, Some(0));
    }

    #[test]
    fn timeout_kills_the_child() {
        let mut pollable = ProcessPollable::new("sleep 5").with_timeout(Duration::from_millis(200));
        pollable.start().unwrap();
        let start = Instant::now();
        let err = loop {
            match pollable.poll() {
                Ok(PollOutcome::NotDone) => std::thread::sleep(Duration::from_millis(20)),
                Ok(PollOutcome::Done) => panic!("expected timeout"),
                Err(err) => break err,
            }
        };
        assert!(matches!(err, Error::TimeoutError { .. }));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn cancel_is_idempotent_after_completion() {
        let mut pollable = ProcessPollable::new("true");
        drive_to_done(&mut pollable).unwrap();
        pollable.cancel();
        pollable.cancel();
    }
}
