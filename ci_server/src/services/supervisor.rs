//! Process supervisor — runs a build script and decides how the build ended.
//!
//! The script is started in its own process group with stdout and stderr
//! pumped into the build's [`OutputStream`]. The supervisor then races the
//! child's exit against the build's [`CancelControl`]. Exit wins ties, so a
//! script that already finished is never reported as canceled. When
//! cancellation wins the whole process group is SIGKILLed, which also takes
//! down anything the script forked. The group is killed after a natural exit
//! as well, so background jobs never outlive their build.

use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use crate::events::build::BuildEvent;
use crate::models::build::{BuildRecord, BuildState, TransitionError};
use crate::services::cancel::CancelControl;
use crate::services::output_stream::OutputStream;

/// Infrastructure failures. A script that runs and fails is not an error.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("build script not found: {0}")]
    MissingScript(PathBuf),
    #[error("failed to start {script}: {source}")]
    Spawn {
        script: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to wait for build script: {0}")]
    Wait(#[source] io::Error),
    #[error("failed to kill build process group {pgid}: {source}")]
    Kill {
        pgid: u32,
        #[source]
        source: io::Error,
    },
    #[error("build is in state {0}, expected running")]
    NotRunning(BuildState),
    #[error(transparent)]
    Transition(#[from] TransitionError),
}

#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    /// How long to wait for the output pumps after the script is gone.
    drain_timeout: Duration,
}

impl ProcessSupervisor {
    pub fn new(drain_timeout: Duration) -> Self {
        Self { drain_timeout }
    }

    /// Run `record`'s script to completion.
    ///
    /// The record must be `Running`. On `Ok` it has reached exactly one
    /// terminal state with its output attached. On `Err` it is left `Running`
    /// (with whatever output was produced) for the caller to mark errored.
    /// In both cases `output` is ended and `cancel` finished on return.
    pub async fn execute(
        &self,
        record: &mut BuildRecord,
        output: &OutputStream,
        cancel: &CancelControl,
    ) -> Result<BuildState, SupervisorError> {
        let started = Instant::now();
        let result = self.run(record, output, cancel).await;
        cancel.finish();
        output.end();
        record.attach_output(output.snapshot())?;

        let event = result?;
        record.apply(event)?;
        crate::metrics::build_duration(started.elapsed().as_millis() as u64);
        Ok(record.state())
    }

    async fn run(
        &self,
        record: &BuildRecord,
        output: &OutputStream,
        cancel: &CancelControl,
    ) -> Result<BuildEvent, SupervisorError> {
        if record.state() != BuildState::Running {
            return Err(SupervisorError::NotRunning(record.state()));
        }

        let script = record.path.join(&record.script);
        if !tokio::fs::try_exists(&script).await.unwrap_or(false) {
            return Err(SupervisorError::MissingScript(script));
        }

        let mut child = spawn_script(record, &script)?;
        let pid = child.id();
        tracing::info!(build = %record.id, pid, script = %script.display(), "Build script started");

        let pumps = [
            child.stdout.take().map(|out| pump(out, output.clone())),
            child.stderr.take().map(|err| pump(err, output.clone())),
        ];

        let outcome = tokio::select! {
            biased;
            status = child.wait() => status.map(exit_event).map_err(SupervisorError::Wait),
            _ = cancel.cancelled() => self.cancel_child(record, &mut child).await,
        };
        // Nothing observes the control past this point
        cancel.finish();

        // Reap whatever the script left running in its group
        if let Some(pgid) = pid {
            if let Err(e) = kill_process_group(pgid) {
                tracing::warn!(build = %record.id, "{e}");
            }
        }

        self.drain(record, pumps).await;
        let event = outcome?;
        tracing::info!(build = %record.id, outcome = event.name(), "Build script finished");
        Ok(event)
    }

    async fn cancel_child(
        &self,
        record: &BuildRecord,
        child: &mut Child,
    ) -> Result<BuildEvent, SupervisorError> {
        // The script may have exited between the request and now
        if let Ok(Some(status)) = child.try_wait() {
            tracing::info!(build = %record.id, "Cancel requested after exit, keeping exit status");
            return Ok(exit_event(status));
        }

        match child.id() {
            Some(pid) => kill_process_group(pid)?,
            None => {
                let status = child.wait().await.map_err(SupervisorError::Wait)?;
                return Ok(exit_event(status));
            }
        }
        tracing::info!(build = %record.id, "Build process group killed");
        child.wait().await.map_err(SupervisorError::Wait)?;
        Ok(BuildEvent::Canceled)
    }

    /// Wait for both pumps to hit EOF under one deadline. A process that left
    /// the script's group can still hold the pipes open.
    async fn drain(&self, record: &BuildRecord, pumps: [Option<JoinHandle<()>>; 2]) {
        let pumps: Vec<JoinHandle<()>> = pumps.into_iter().flatten().collect();
        let aborts: Vec<_> = pumps.iter().map(JoinHandle::abort_handle).collect();
        if tokio::time::timeout(self.drain_timeout, join_all(pumps))
            .await
            .is_err()
        {
            tracing::warn!(
                build = %record.id,
                timeout_secs = self.drain_timeout.as_secs(),
                "Output still open after script exit, detaching"
            );
            for abort in aborts {
                abort.abort();
            }
        }
    }
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

fn spawn_script(record: &BuildRecord, script: &Path) -> Result<Child, SupervisorError> {
    let mut command = Command::new(script);
    command
        .current_dir(&record.path)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .env("CI", "true")
        .env("SEA_BUILD_ID", record.id.to_string())
        .env("SEA_REVISION", &record.commit.revision)
        .env("SEA_REF", &record.commit.ref_name)
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);

    command.spawn().map_err(|source| SupervisorError::Spawn {
        script: script.to_path_buf(),
        source,
    })
}

fn pump<R>(mut reader: R, output: OutputStream) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; 8192];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => output.write(&buf[..n]),
                Err(e) => {
                    tracing::warn!("Reading build output failed: {e}");
                    break;
                }
            }
        }
    })
}

/// Map an exit status to its terminal event.
fn exit_event(status: ExitStatus) -> BuildEvent {
    match status.code() {
        Some(0) => BuildEvent::Succeeded,
        Some(code) => BuildEvent::Failed { return_code: code },
        None => BuildEvent::Failed {
            return_code: signal_return_code(&status),
        },
    }
}

#[cfg(unix)]
fn signal_return_code(status: &ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    128 + status.signal().unwrap_or(0)
}

#[cfg(not(unix))]
fn signal_return_code(_status: &ExitStatus) -> i32 {
    -1
}

/// SIGKILL the whole process group led by `pid`. A group that is already
/// gone counts as killed.
#[cfg(unix)]
fn kill_process_group(pid: u32) -> Result<(), SupervisorError> {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    // Spawned with process_group(0): the child's pid is its group id
    match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(errno) => Err(SupervisorError::Kill {
            pgid: pid,
            source: io::Error::from(errno),
        }),
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: u32) -> Result<(), SupervisorError> {
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    use tokio::time::timeout;

    use super::*;
    use crate::models::build::{BuildId, CommitInfo};

    const WAIT: Duration = Duration::from_secs(10);

    fn write_script(dir: &Path, body: &str) {
        let path = dir.join("Seafile");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn running_record(dir: &Path) -> BuildRecord {
        let mut record = BuildRecord::new(
            BuildId::new(1, 1),
            CommitInfo::new("abc", "refs/heads/main"),
            dir.to_path_buf(),
            PathBuf::from("Seafile"),
        );
        record.apply(BuildEvent::Started).unwrap();
        record
    }

    fn supervisor() -> ProcessSupervisor {
        ProcessSupervisor::new(Duration::from_secs(2))
    }

    #[tokio::test]
    async fn successful_script_streams_output() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "echo step1\nsleep 0.2\necho step2\nexit 0");
        let mut record = running_record(dir.path());
        let output = OutputStream::new();
        let cancel = CancelControl::new();

        let reader = output.open_reader();
        let reader = tokio::spawn(async move {
            let mut reader = reader;
            reader.read_to_end().await
        });

        let state = timeout(WAIT, supervisor().execute(&mut record, &output, &cancel))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(state, BuildState::Success);
        assert_eq!(record.return_code(), Some(0));
        assert_eq!(record.output(), b"step1\nstep2\n");
        assert_eq!(timeout(WAIT, reader).await.unwrap().unwrap(), b"step1\nstep2\n");
        assert!(output.is_done());
        assert!(record.finished_at().is_some());
    }

    #[tokio::test]
    async fn stderr_is_captured_and_exit_code_kept() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "echo oops >&2\nexit 3");
        let mut record = running_record(dir.path());
        let output = OutputStream::new();

        let state = supervisor()
            .execute(&mut record, &output, &CancelControl::new())
            .await
            .unwrap();

        assert_eq!(state, BuildState::Failed);
        assert_eq!(record.return_code(), Some(3));
        assert_eq!(record.output(), b"oops\n");
    }

    #[tokio::test]
    async fn killed_by_signal_is_failed() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "kill -9 $$");
        let mut record = running_record(dir.path());

        let state = supervisor()
            .execute(&mut record, &OutputStream::new(), &CancelControl::new())
            .await
            .unwrap();

        assert_eq!(state, BuildState::Failed);
        assert_eq!(record.return_code(), Some(128 + 9));
    }

    #[tokio::test]
    async fn cancel_kills_sleeping_script() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "echo partial\nsleep 600");
        let mut record = running_record(dir.path());
        let output = OutputStream::new();
        let cancel = CancelControl::new();

        let canceller = {
            let cancel = cancel.clone();
            let output = output.clone();
            tokio::spawn(async move {
                // Wait for the first line so the partial output is deterministic
                let mut reader = output.open_reader();
                reader.read().await;
                tokio::time::sleep(Duration::from_millis(100)).await;
                cancel.cancel()
            })
        };

        let state = timeout(WAIT, supervisor().execute(&mut record, &output, &cancel))
            .await
            .expect("canceled build must finish promptly")
            .unwrap();

        assert_eq!(canceller.await.unwrap(), Ok(()));
        assert_eq!(state, BuildState::Canceled);
        assert_eq!(record.output(), b"partial\n");

        // A reader attached after cancellation still gets the backlog
        let mut late = output.open_reader();
        assert_eq!(late.read_to_end().await, b"partial\n");
        assert!(cancel.cancel().is_err());
    }

    #[tokio::test]
    async fn cancel_kills_forked_grandchildren() {
        let dir = tempfile::tempdir().unwrap();
        // The background sleep inherits stdout; if it survived the kill the
        // pipe would stay open and execute() would sit out the drain timeout.
        write_script(dir.path(), "sleep 600 &\necho started\nwait");
        let mut record = running_record(dir.path());
        let output = OutputStream::new();
        let cancel = CancelControl::new();

        {
            let cancel = cancel.clone();
            let output = output.clone();
            tokio::spawn(async move {
                output.open_reader().read().await;
                cancel.cancel()
            });
        }

        let slow_drain = ProcessSupervisor::new(Duration::from_secs(60));
        let started = Instant::now();
        let state = timeout(WAIT, slow_drain.execute(&mut record, &output, &cancel))
            .await
            .expect("grandchild kept the output pipe open")
            .unwrap();
        assert_eq!(state, BuildState::Canceled);
        assert!(started.elapsed() < WAIT);
        assert_eq!(record.output(), b"started\n");
    }

    /// Alive unless gone from /proc or a zombie waiting to be reaped.
    #[cfg(target_os = "linux")]
    fn process_alive(pid: u32) -> bool {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            // Field 3, after the parenthesized command name, is the state
            Ok(stat) => stat
                .rsplit_once(')')
                .and_then(|(_, rest)| rest.split_whitespace().next())
                .is_some_and(|state| state != "Z" && state != "X"),
            Err(_) => false,
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn natural_exit_kills_background_jobs() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "sleep 300 >/dev/null 2>&1 &\necho $!\nexit 0");
        let mut record = running_record(dir.path());
        let output = OutputStream::new();

        let state = timeout(WAIT, supervisor().execute(&mut record, &output, &CancelControl::new()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state, BuildState::Success);

        let pid: u32 = String::from_utf8_lossy(record.output())
            .trim()
            .parse()
            .expect("script prints the background pid");
        let gone = timeout(WAIT, async {
            while process_alive(pid) {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        assert!(gone.is_ok(), "background job {pid} outlived its build");
    }

    #[tokio::test]
    async fn natural_exit_does_not_wait_for_background_output() {
        let dir = tempfile::tempdir().unwrap();
        // The background sleep keeps stdout open until the group is killed
        write_script(dir.path(), "sleep 300 &\necho done");
        let mut record = running_record(dir.path());
        let output = OutputStream::new();

        let slow_drain = ProcessSupervisor::new(Duration::from_secs(60));
        let state = timeout(WAIT, slow_drain.execute(&mut record, &output, &CancelControl::new()))
            .await
            .expect("background job kept the output pipe open")
            .unwrap();
        assert_eq!(state, BuildState::Success);
        assert_eq!(record.output(), b"done\n");
    }

    #[tokio::test]
    async fn drain_deadline_covers_both_pipes() {
        let has_setsid = std::process::Command::new("sh")
            .args(["-c", "command -v setsid"])
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false);
        if !has_setsid {
            eprintln!("setsid not installed, skipping");
            return;
        }

        let dir = tempfile::tempdir().unwrap();
        // A new session escapes the group kill and holds stdout and stderr
        write_script(dir.path(), "setsid sleep 5 &\necho left");
        let mut record = running_record(dir.path());
        let output = OutputStream::new();

        let drain = Duration::from_secs(2);
        let started = Instant::now();
        let state = ProcessSupervisor::new(drain)
            .execute(&mut record, &output, &CancelControl::new())
            .await
            .unwrap();
        let elapsed = started.elapsed();

        assert_eq!(state, BuildState::Success);
        assert_eq!(record.output(), b"left\n");
        assert!(elapsed >= drain, "returned before the drain deadline");
        assert!(elapsed < drain * 2, "pipes drained one after the other: {elapsed:?}");
    }

    #[tokio::test]
    async fn cancel_after_exit_keeps_natural_state() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "echo done");
        let mut record = running_record(dir.path());
        let output = OutputStream::new();
        let cancel = CancelControl::new();

        let state = supervisor()
            .execute(&mut record, &output, &cancel)
            .await
            .unwrap();
        assert_eq!(state, BuildState::Success);
        assert!(cancel.cancel().is_err());
        assert_eq!(record.state(), BuildState::Success);
    }

    #[tokio::test]
    async fn concurrent_cancels_take_effect_once() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "echo go\nsleep 600");
        let mut record = running_record(dir.path());
        let output = OutputStream::new();
        let cancel = CancelControl::new();

        let cancellers: Vec<_> = (0..8)
            .map(|_| {
                let cancel = cancel.clone();
                let output = output.clone();
                tokio::spawn(async move {
                    output.open_reader().read().await;
                    cancel.cancel().is_ok()
                })
            })
            .collect();

        let state = timeout(WAIT, supervisor().execute(&mut record, &output, &cancel))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state, BuildState::Canceled);

        let mut winners = 0;
        for c in cancellers {
            if c.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn missing_script_is_an_infrastructure_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut record = running_record(dir.path());
        let output = OutputStream::new();

        let err = supervisor()
            .execute(&mut record, &output, &CancelControl::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::MissingScript(_)));
        assert_eq!(record.state(), BuildState::Running);
        assert!(output.is_done());
    }

    #[tokio::test]
    async fn non_executable_script_fails_to_spawn() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Seafile"), "echo hi\n").unwrap();
        let mut record = running_record(dir.path());

        let err = supervisor()
            .execute(&mut record, &OutputStream::new(), &CancelControl::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::Spawn { .. }));
        assert_eq!(record.state(), BuildState::Running);
    }

    #[tokio::test]
    async fn refuses_records_that_are_not_running() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "exit 0");
        let mut record = BuildRecord::new(
            BuildId::new(1, 2),
            CommitInfo::default(),
            dir.path().to_path_buf(),
            PathBuf::from("Seafile"),
        );
        let err = supervisor()
            .execute(&mut record, &OutputStream::new(), &CancelControl::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::NotRunning(BuildState::Waiting)));
    }
}
