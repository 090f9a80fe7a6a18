use std::io;
use std::sync::Arc;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cgroup::ResourceController;
use crate::config::WorkerConfig;
use crate::error::{Result, WorkerError};
use crate::tail::{OutputMode, TailHandle, TailReader};

/// Cgroup v2 limits applied to a job at spawn time.
#[derive(Debug, Clone, Copy)]
pub struct JobOpts {
    /// `cpu.weight`, in [1, 10000].
    pub cpu_weight: i32,
    /// `io.weight`, in [1, 10000].
    pub io_weight: i32,
    /// `memory.high` in bytes.
    pub mem_limit: u64,
}

impl JobOpts {
    pub fn new(cpu_weight: i32, io_weight: i32, mem_limit: u64) -> Self {
        Self {
            cpu_weight,
            io_weight,
            mem_limit,
        }
    }

    pub fn validate(&self) -> Result<()> {
        for (name, weight) in [("cpu_weight", self.cpu_weight), ("io_weight", self.io_weight)] {
            if !(1..=10_000).contains(&weight) {
                return Err(WorkerError::InvalidArgument(format!(
                    "{name} must be in [1, 10000], got {weight}"
                )));
            }
        }
        Ok(())
    }
}

/// Parse a memory-limit string into bytes.
///
/// Accepts a decimal integer with an optional `K`, `M`, or `G` suffix
/// (base-2 multipliers); an unsuffixed value is raw bytes.
pub fn parse_mem_limit(value: &str) -> Result<u64> {
    let value = value.trim();
    let (digits, multiplier) = if let Some(d) = value.strip_suffix('K') {
        (d, 1024u64)
    } else if let Some(d) = value.strip_suffix('M') {
        (d, 1024 * 1024)
    } else if let Some(d) = value.strip_suffix('G') {
        (d, 1024 * 1024 * 1024)
    } else {
        (value, 1)
    };
    let n: u64 = digits
        .parse()
        .map_err(|_| WorkerError::InvalidArgument(format!("invalid memory limit {value:?}")))?;
    n.checked_mul(multiplier)
        .ok_or_else(|| WorkerError::InvalidArgument(format!("memory limit {value:?} overflows")))
}

/// Point-in-time projection of a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStatus {
    pub id: String,
    pub pid: u32,
    pub running: bool,
    pub exit_code: i32,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Job Status\n  ID: {}\n  PID: {}\n  Running: {}\n  Exit Code: {}",
            self.id, self.pid, self.running, self.exit_code
        )
    }
}

/// Mutable job state, guarded by the job lock.
struct JobState {
    running: bool,
    exit_code: i32,
    readers: Vec<TailHandle>,
}

/// A supervised child process.
///
/// Constructed running by `JobWorker::start`; the reaper task flips
/// `running` exactly once when the child exits and raises `done` after it.
/// The cgroup directory and log file exist from successful start until the
/// end of `stop`.
pub struct Job {
    id: Uuid,
    pid: u32,
    pgid: i32,
    state: RwLock<JobState>,
    done: CancellationToken,
    controller: Arc<dyn ResourceController>,
    config: Arc<WorkerConfig>,
}

impl Job {
    pub(crate) fn new(
        id: Uuid,
        pid: u32,
        pgid: i32,
        controller: Arc<dyn ResourceController>,
        config: Arc<WorkerConfig>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            pid,
            pgid,
            state: RwLock::new(JobState {
                running: true,
                exit_code: 0,
                readers: Vec::new(),
            }),
            done: CancellationToken::new(),
            controller,
            config,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Pid recorded at spawn; zero if the child never started.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub async fn running(&self) -> bool {
        self.state.read().await.running
    }

    /// Resolves once the reaper has observed the child's exit.
    pub async fn wait(&self) {
        self.done.cancelled().await;
    }

    /// Snapshot of the job. `exit_code` is zero while the job runs.
    pub async fn status(&self) -> JobStatus {
        let state = self.state.read().await;
        JobStatus {
            id: self.id.to_string(),
            pid: self.pid,
            running: state.running,
            exit_code: if state.running { 0 } else { state.exit_code },
        }
    }

    /// Open a tail reader over the job's log and register it so the reaper
    /// closes it when the child exits.
    ///
    /// A reader opened after the reaper has already swept the list is not
    /// closed by the supervisor; callers must be prepared to close from
    /// their side (dropping the reader suffices).
    pub async fn output(&self, mode: OutputMode) -> Result<TailReader> {
        let reader = TailReader::open(
            self.config.log_path(&self.id.to_string()),
            mode,
            self.config.tail_poll_interval,
        )?;
        let mut state = self.state.write().await;
        state.readers.push(reader.handle());
        Ok(reader)
    }

    /// Terminate the job and release its kernel state.
    ///
    /// SIGTERM is broadcast to the whole process group; if the job does not
    /// exit within the configured grace period it is SIGKILLed. `deadline`
    /// bounds how long the caller waits; when it elapses the result is
    /// `DeadlineElapsed`, but the log file and cgroup are removed on every
    /// path regardless.
    pub async fn stop(&self, deadline: Duration) -> Result<()> {
        let result = self.terminate(deadline).await;

        let log_path = self.config.log_path(&self.id.to_string());
        if let Err(e) = std::fs::remove_file(&log_path) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(id = %self.id, error = %e, "failed to remove job log");
            }
        }
        if let Err(e) = self.controller.delete_group(&self.id.to_string()) {
            tracing::warn!(id = %self.id, error = %e, "failed to delete job cgroup");
        }

        result
    }

    async fn terminate(&self, deadline: Duration) -> Result<()> {
        match self.signal_group(Signal::SIGTERM) {
            // The group has already been fully reaped; nothing to deliver.
            Err(WorkerError::SignalFailed {
                source: Errno::ESRCH,
                ..
            }) => {}
            other => other?,
        }

        if !self.running().await {
            return Ok(());
        }

        let grace = self.config.stop_grace_period;
        tokio::select! {
            _ = self.done.cancelled() => Ok(()),
            _ = tokio::time::sleep(grace) => self.signal_group(Signal::SIGKILL),
            _ = tokio::time::sleep(deadline) => Err(WorkerError::DeadlineElapsed),
        }
    }

    /// Broadcast a signal to the job's process group, covering shells and
    /// their descendants.
    fn signal_group(&self, signal: Signal) -> Result<()> {
        killpg(Pid::from_raw(self.pgid), signal).map_err(|source| WorkerError::SignalFailed {
            pgid: self.pgid,
            source,
        })
    }

    /// Reaper bookkeeping: record the exit under the job lock.
    pub(crate) async fn mark_exited(&self, exit_code: i32) {
        let mut state = self.state.write().await;
        state.running = false;
        state.exit_code = exit_code;
    }

    pub(crate) fn raise_done(&self) {
        self.done.cancel();
    }

    /// Close every reader registered so far, unblocking follow-mode reads.
    pub(crate) async fn close_readers(&self) {
        let mut state = self.state.write().await;
        for reader in state.readers.drain(..) {
            reader.close();
        }
    }
}
