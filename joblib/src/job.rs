//! A supervised command: its cgroup, its captured output, and its status
//! history.

use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::SystemTime;

use nix::fcntl::OFlag;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{pipe2, Pid};
use tokio::task::{self, JoinHandle};
use uuid::Uuid;

use crate::cgroup::{CgroupController, ResourceLimits};
use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::output::{OutputReader, OutputStore};
use crate::spawn;

/// Worker-level knobs shared by every job it runs.
#[derive(Clone, Debug)]
pub struct WorkerSettings {
    /// Identity used in the cgroup path: jobs live under
    /// `<cgroup_root>/<worker_name>/<job_id>`.
    pub worker_name: String,
    pub cgroup_root: PathBuf,
    /// Directory holding the `<job_id>-stdout` / `<job_id>-stderr` spools.
    pub spool_dir: PathBuf,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            worker_name: "jobworker".to_string(),
            cgroup_root: PathBuf::from("/sys/fs/cgroup"),
            spool_dir: PathBuf::from("/tmp"),
        }
    }
}

/// Executable path plus ordered arguments; immutable once the job exists.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    Ready,
    Running,
    Succeeded,
    Failed,
    Stopped,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Succeeded | Status::Failed | Status::Stopped)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Status::Ready => "ready",
            Status::Running => "running",
            Status::Succeeded => "succeeded",
            Status::Failed => "failed",
            Status::Stopped => "stopped",
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StatusChange {
    pub status: Status,
    pub changed_at: SystemTime,
}

/// Read-only snapshot of a job's visible state.
#[derive(Clone, Debug)]
pub struct Observation {
    pub id: Uuid,
    pub status: Status,
    pub history: Vec<StatusChange>,
    pub command: CommandSpec,
    pub created: SystemTime,
    pub limits: ResourceLimits,
}

/// Which captured stream to read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputKind {
    Stdout,
    Stderr,
}

struct JobState {
    history: Vec<StatusChange>,
    stop_requested: bool,
    pid: Option<Pid>,
}

impl JobState {
    fn current(&self) -> Status {
        // the Ready entry is written at construction, so history is never empty
        self.history.last().map(|change| change.status).unwrap_or(Status::Ready)
    }

    fn transition(&mut self, status: Status, at: SystemTime) {
        debug_assert!(
            matches!(
                (self.current(), status),
                (Status::Ready, Status::Running)
                    | (Status::Ready, Status::Failed)
                    | (Status::Running, Status::Succeeded)
                    | (Status::Running, Status::Failed)
                    | (Status::Running, Status::Stopped)
            ),
            "illegal status transition {} -> {}",
            self.current(),
            status,
        );
        self.history.push(StatusChange { status, changed_at: at });
    }
}

struct JobOutput {
    stdout: Arc<OutputStore>,
    stderr: Arc<OutputStore>,
}

/// Shared between RPC handlers and the per-job reaper task via `Arc`. The
/// state mutex is held only across status transitions and the
/// configure-and-spawn window of `start`.
pub struct Job {
    id: Uuid,
    command: CommandSpec,
    limits: ResourceLimits,
    created: SystemTime,
    clock: Arc<dyn Clock>,
    cgroup: CgroupController,
    spool_dir: PathBuf,
    output: OnceLock<JobOutput>,
    state: Mutex<JobState>,
}

impl Job {
    /// Construct a job and its cgroup. Nothing is launched yet.
    pub fn new(
        settings: &WorkerSettings,
        clock: Arc<dyn Clock>,
        limits: ResourceLimits,
        command: CommandSpec,
    ) -> Result<Arc<Self>> {
        let id = Uuid::new_v4();
        tracing::debug!(%id, program = %command.program, ?limits, "creating job");

        let cgroup =
            CgroupController::new(&settings.cgroup_root, &settings.worker_name, &id.to_string())?;

        let created = clock.now();
        Ok(Arc::new(Self {
            id,
            command,
            limits,
            created,
            clock,
            cgroup,
            spool_dir: settings.spool_dir.clone(),
            output: OnceLock::new(),
            state: Mutex::new(JobState {
                history: vec![StatusChange { status: Status::Ready, changed_at: created }],
                stop_requested: false,
                pid: None,
            }),
        }))
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Configure the cgroup and launch the command. Atomic with respect to
    /// concurrent starts; must run inside a tokio runtime, which hosts the
    /// reaper and capture pumps.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let current = state.current();
        if current != Status::Ready {
            return Err(Error::InvalidState(current));
        }

        if let Err(err) = self.cgroup.configure(&self.limits) {
            state.transition(Status::Failed, self.clock.now());
            self.cgroup.cleanup();
            return Err(err);
        }

        let (pid, pumps) = match self.launch() {
            Ok(launched) => launched,
            Err(err) => {
                state.transition(Status::Failed, self.clock.now());
                self.cgroup.cleanup();
                return Err(err);
            }
        };

        state.pid = Some(pid);
        state.transition(Status::Running, self.clock.now());
        drop(state);

        tracing::info!(id = %self.id, %pid, program = %self.command.program, "job running");

        let job = Arc::clone(self);
        tokio::spawn(async move { job.reap(pid, pumps).await });

        Ok(())
    }

    /// Record the stop intent and SIGKILL the job's process group. The
    /// reaper performs the terminal transition.
    pub fn stop(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let current = state.current();
        if current != Status::Running {
            return Err(Error::InvalidState(current));
        }
        let pid = state
            .pid
            .ok_or_else(|| Error::Internal("running job has no recorded pid".to_string()))?;
        state.stop_requested = true;
        drop(state);

        tracing::info!(id = %self.id, %pid, "stopping job");
        match signal::killpg(pid, Signal::SIGKILL) {
            Ok(()) => Ok(()),
            // lost the race against a natural exit; the reaper settles it
            Err(nix::errno::Errno::ESRCH) => Ok(()),
            Err(err) => Err(Error::Io(err.into())),
        }
    }

    /// Non-blocking snapshot; safe in any state.
    pub fn observe(&self) -> Observation {
        let state = self.state.lock().unwrap();
        Observation {
            id: self.id,
            status: state.current(),
            history: state.history.clone(),
            command: self.command.clone(),
            created: self.created,
            limits: self.limits,
        }
    }

    /// A fresh reader over a captured stream, starting from the first byte.
    pub fn open_output(&self, kind: OutputKind) -> Result<OutputReader> {
        let Some(output) = self.output.get() else {
            // stores only exist once start has spawned the child
            return Err(Error::InvalidState(Status::Ready));
        };
        let store = match kind {
            OutputKind::Stdout => &output.stdout,
            OutputKind::Stderr => &output.stderr,
        };
        Ok(store.open_reader()?)
    }

    /// Create the spool stores and pipes, clone the child into the cgroup,
    /// and start the capture pumps. Called with the state lock held so the
    /// stores are published before anyone can observe `Running`.
    fn launch(&self) -> Result<(Pid, Vec<JoinHandle<()>>)> {
        let stdout_store = OutputStore::create(&self.spool_path("stdout"))?;
        let stderr_store = OutputStore::create(&self.spool_path("stderr"))?;

        // O_CLOEXEC keeps one job's pipe ends from leaking into a sibling's
        // child and holding its stream open past exit
        let (stdout_rx, stdout_tx) =
            pipe2(OFlag::O_CLOEXEC).map_err(|err| Error::SpawnFailed(err.into()))?;
        let (stderr_rx, stderr_tx) =
            pipe2(OFlag::O_CLOEXEC).map_err(|err| Error::SpawnFailed(err.into()))?;

        let pid =
            spawn::spawn_into_cgroup(&self.command, self.cgroup.dir_fd(), stdout_tx, stderr_tx)
                .map_err(Error::SpawnFailed)?;

        let pumps = vec![
            spawn_pump(stdout_rx, Arc::clone(&stdout_store)),
            spawn_pump(stderr_rx, Arc::clone(&stderr_store)),
        ];

        let _ = self.output.set(JobOutput { stdout: stdout_store, stderr: stderr_store });

        Ok((pid, pumps))
    }

    /// Waits out the child, joins the capture pumps, and performs the
    /// terminal transition, store close, and cgroup cleanup exactly once.
    async fn reap(self: Arc<Self>, pid: Pid, pumps: Vec<JoinHandle<()>>) {
        let wait = task::spawn_blocking(move || waitpid(pid, None)).await;

        // the pid namespace dies with the child, so the pipes hit
        // end-of-file and the pumps finish on their own
        for pump in pumps {
            let _ = pump.await;
        }

        let mut state = self.state.lock().unwrap();
        let outcome = match wait {
            Ok(Ok(WaitStatus::Exited(_, 0))) => Status::Succeeded,
            Ok(Ok(WaitStatus::Exited(_, code))) => {
                tracing::debug!(id = %self.id, code, "job exited non-zero");
                Status::Failed
            }
            Ok(Ok(WaitStatus::Signaled(_, sig, _))) => {
                if state.stop_requested && sig == Signal::SIGKILL {
                    Status::Stopped
                } else {
                    tracing::debug!(id = %self.id, signal = %sig, "job killed by signal");
                    Status::Failed
                }
            }
            Ok(Ok(other)) => {
                tracing::error!(id = %self.id, ?other, "unexpected wait status");
                Status::Failed
            }
            Ok(Err(err)) => {
                tracing::error!(id = %self.id, %err, "wait on child failed");
                Status::Failed
            }
            Err(err) => {
                tracing::error!(id = %self.id, %err, "reaper task join failed");
                Status::Failed
            }
        };
        state.transition(outcome, self.clock.now());
        drop(state);

        if let Some(output) = self.output.get() {
            output.stdout.close();
            output.stderr.close();
        }
        self.cgroup.cleanup();

        tracing::info!(id = %self.id, status = %outcome, "job finished");
    }

    fn spool_path(&self, stream: &str) -> PathBuf {
        self.spool_dir.join(format!("{}-{}", self.id, stream))
    }
}

/// Capture pump: drains one pipe into its store until the write side dies
/// with the child.
fn spawn_pump(pipe: std::os::fd::OwnedFd, store: Arc<OutputStore>) -> JoinHandle<()> {
    task::spawn_blocking(move || {
        let mut file = File::from(pipe);
        let mut buf = [0u8; 8192];
        loop {
            match file.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if let Err(err) = store.append(&buf[..n]) {
                        tracing::error!(%err, "dropping captured output");
                        break;
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    tracing::error!(%err, "output capture read failed");
                    break;
                }
            }
        }
    })
}
