//! cgroup v2 resource control for supervised jobs.
//!
//! Each job gets its own group directory under the configured root
//! (`/sys/fs/cgroup/<job-id>/` in production). Limits are plain decimal
//! writes into the group's interface files, and the job's process is placed
//! into the group between fork and exec so the command never runs outside
//! its limits.

use std::ffi::CStr;
use std::fs::{DirBuilder, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use tokio::process::Command;

use crate::error::WorkerError;
use crate::worker::JobOpts;

/// Resource control surface for new processes.
///
/// The production implementation manipulates the cgroup v2 filesystem;
/// `NullController` stubs it out for tests and for hosts without cgroup
/// delegation.
pub trait ResourceController: Send + Sync {
    /// Create the named group. Fails if the name collides, the caller lacks
    /// rights to the root, or the hierarchy is missing.
    fn create_group(&self, name: &str) -> Result<(), WorkerError>;

    /// Write the resource limits into the group's interface files.
    /// The group is left in place on failure; the caller owns cleanup.
    fn configure(&self, name: &str, opts: &JobOpts) -> Result<(), WorkerError>;

    /// Arrange for the next process spawned via `cmd` to start inside the
    /// named group.
    fn attach(&self, name: &str, cmd: &mut Command) -> Result<(), WorkerError>;

    /// Remove the group. Deleting a group that does not exist is success,
    /// so teardown paths can call this unconditionally.
    fn delete_group(&self, name: &str) -> Result<(), WorkerError>;
}

/// Interface files written by `configure`, in write order.
const CPU_WEIGHT: &str = "cpu.weight";
const MEMORY_HIGH: &str = "memory.high";
const IO_WEIGHT: &str = "io.weight";

const CGROUP_PROCS: &CStr = c"cgroup.procs";

/// cgroup v2 controller rooted at a hierarchy path.
pub struct Cgroup {
    root: PathBuf,
}

impl Cgroup {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn group_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn write_controller(
        &self,
        name: &str,
        controller: &'static str,
        value: &str,
    ) -> Result<(), WorkerError> {
        let path = self.group_path(name).join(controller);
        let map_err = |source| WorkerError::ControllerFailed {
            group: name.to_string(),
            controller,
            source,
        };
        let mut file = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&path)
            .map_err(map_err)?;
        file.write_all(value.as_bytes()).map_err(map_err)
    }
}

impl ResourceController for Cgroup {
    fn create_group(&self, name: &str) -> Result<(), WorkerError> {
        let path = self.group_path(name);
        DirBuilder::new()
            .mode(0o755)
            .create(&path)
            .map_err(|e| match e.kind() {
                io::ErrorKind::AlreadyExists => WorkerError::AlreadyExists(name.to_string()),
                io::ErrorKind::PermissionDenied => WorkerError::Permission(self.root.clone()),
                io::ErrorKind::NotFound => WorkerError::Unavailable(self.root.clone()),
                _ => WorkerError::Io(e),
            })
    }

    fn configure(&self, name: &str, opts: &JobOpts) -> Result<(), WorkerError> {
        self.write_controller(name, CPU_WEIGHT, &opts.cpu_weight.to_string())?;
        self.write_controller(name, MEMORY_HIGH, &opts.mem_limit.to_string())?;
        self.write_controller(name, IO_WEIGHT, &opts.io_weight.to_string())
    }

    fn attach(&self, name: &str, cmd: &mut Command) -> Result<(), WorkerError> {
        // Hold the group directory open with O_PATH; the hook below uses it
        // as the anchor for openat so the placement cannot race a concurrent
        // rename of the group.
        let dir = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_PATH | libc::O_DIRECTORY)
            .open(self.group_path(name))
            .map_err(|source| WorkerError::AttachFailed {
                group: name.to_string(),
                source,
            })?;

        // Runs in the child between fork and exec, so only async-signal-safe
        // calls are allowed; raw syscalls through libc, no allocation.
        // Writing "0" to cgroup.procs moves the calling process into the
        // group, so the command starts already limited.
        unsafe {
            cmd.pre_exec(move || {
                let dirfd = dir.as_raw_fd();
                let fd = libc::openat(dirfd, CGROUP_PROCS.as_ptr(), libc::O_WRONLY);
                if fd < 0 {
                    return Err(io::Error::last_os_error());
                }
                let wrote = libc::write(fd, b"0".as_ptr().cast(), 1);
                let write_err = io::Error::last_os_error();
                libc::close(fd);
                if wrote != 1 {
                    return Err(write_err);
                }
                Ok(())
            });
        }
        Ok(())
    }

    fn delete_group(&self, name: &str) -> Result<(), WorkerError> {
        match remove_group_tree(&self.group_path(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(WorkerError::Io(e)),
        }
    }
}

/// Depth-first rmdir. cgroupfs only supports removing directories (the
/// interface files vanish with them), so a plain recursive unlink is wrong
/// here.
fn remove_group_tree(dir: &Path) -> io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            remove_group_tree(&entry.path())?;
        }
    }
    std::fs::remove_dir(dir)
}

/// Controller with no side effects: jobs run unlimited. Used by the test
/// suite and usable on hosts without cgroup v2 delegation.
pub struct NullController;

impl ResourceController for NullController {
    fn create_group(&self, _name: &str) -> Result<(), WorkerError> {
        Ok(())
    }

    fn configure(&self, _name: &str, _opts: &JobOpts) -> Result<(), WorkerError> {
        Ok(())
    }

    fn attach(&self, _name: &str, _cmd: &mut Command) -> Result<(), WorkerError> {
        Ok(())
    }

    fn delete_group(&self, _name: &str) -> Result<(), WorkerError> {
        Ok(())
    }
}
