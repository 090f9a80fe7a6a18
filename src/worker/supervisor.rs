use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;
use std::sync::Arc;

use nix::unistd::{getpgid, Pid};
use tokio::process::Command;
use uuid::Uuid;

use crate::cgroup::{Cgroup, ResourceController};
use crate::config::WorkerConfig;
use crate::error::{Result, WorkerError};
use crate::worker::job::{Job, JobOpts};

/// The job supervisor: spawns resource-controlled children and hands out
/// `Job` handles for the rest of their lifecycle.
///
/// One instance is shared by all RPC handlers; the controller decides
/// whether jobs actually land in cgroups (`Cgroup`) or run unlimited
/// (`NullController`).
pub struct JobWorker {
    config: Arc<WorkerConfig>,
    controller: Arc<dyn ResourceController>,
}

impl JobWorker {
    pub fn new(config: Arc<WorkerConfig>, controller: Arc<dyn ResourceController>) -> Self {
        Self { config, controller }
    }

    /// Production construction: cgroup v2 at the configured root.
    pub fn with_cgroup(config: Arc<WorkerConfig>) -> Self {
        let controller = Arc::new(Cgroup::new(config.cgroup_root.clone()));
        Self::new(config, controller)
    }

    pub fn config(&self) -> &Arc<WorkerConfig> {
        &self.config
    }

    /// Launch `command` with `args` as a new supervised job.
    ///
    /// All-or-nothing: the cgroup is created and configured, the log file
    /// opened, and the child spawned directly into its group; any failure
    /// tears down whatever was already created before the error surfaces.
    pub async fn start(&self, opts: JobOpts, command: &str, args: &[String]) -> Result<Arc<Job>> {
        if command.is_empty() {
            return Err(WorkerError::InvalidArgument(
                "command cannot be empty".to_string(),
            ));
        }
        opts.validate()?;

        let id = Uuid::new_v4();
        let name = id.to_string();

        self.controller.create_group(&name)?;

        match self.spawn_supervised(id, &name, &opts, command, args) {
            Ok(job) => {
                tracing::info!(id = %id, command, pid = job.pid(), "job started");
                Ok(job)
            }
            Err(err) => {
                if let Err(e) = std::fs::remove_file(self.config.log_path(&name)) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        tracing::warn!(id = %id, error = %e, "failed to remove log after aborted start");
                    }
                }
                if let Err(e) = self.controller.delete_group(&name) {
                    tracing::warn!(id = %id, error = %e, "failed to delete cgroup after aborted start");
                }
                Err(err)
            }
        }
    }

    fn spawn_supervised(
        &self,
        id: Uuid,
        name: &str,
        opts: &JobOpts,
        command: &str,
        args: &[String],
    ) -> Result<Arc<Job>> {
        self.controller.configure(name, opts)?;

        // The child writes stdout and stderr into the same log file; the
        // parent keeps its own handle for the reaper to release.
        let log = OpenOptions::new()
            .write(true)
            .create(true)
            .mode(0o644)
            .open(self.config.log_path(name))?;

        let mut cmd = Command::new(command);
        cmd.args(args)
            .env_clear()
            .stdout(Stdio::from(log.try_clone()?))
            .stderr(Stdio::from(log.try_clone()?))
            // New process group so stop can broadcast to descendants.
            .process_group(0);

        // Jobs must not run with the supervisor's privileges when a worker
        // user is configured.
        if self.config.drops_privileges() {
            cmd.uid(self.config.worker_uid as u32)
                .gid(self.config.worker_gid as u32);
        }

        // Spawn-time placement: the cgroup descriptor is consumed by a
        // pre-exec hook, so the command never runs outside its limits.
        self.controller.attach(name, &mut cmd)?;

        let mut child = cmd.spawn().map_err(WorkerError::SpawnFailed)?;
        let pid = child.id().unwrap_or(0);
        let pgid = getpgid(Some(Pid::from_raw(pid as i32)))
            .map_err(|e| WorkerError::Io(std::io::Error::from_raw_os_error(e as i32)))?
            .as_raw();

        let job = Job::new(id, pid, pgid, self.controller.clone(), self.config.clone());

        // Reaper: wait for the child, then publish the exit in a fixed
        // order: running flag, done signal, parent log handle, readers.
        let reaper_job = job.clone();
        tokio::spawn(async move {
            let exit_code = match child.wait().await {
                Ok(status) => status
                    .code()
                    .unwrap_or_else(|| status.signal().map(|s| -s).unwrap_or(-1)),
                Err(e) => {
                    tracing::warn!(id = %id, error = %e, "wait on child failed");
                    -1
                }
            };
            reaper_job.mark_exited(exit_code).await;
            reaper_job.raise_done();
            drop(log);
            reaper_job.close_readers().await;
            tracing::debug!(id = %id, exit_code, "job reaped");
        });

        Ok(job)
    }
}
