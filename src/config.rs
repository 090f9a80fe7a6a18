use std::path::{Path, PathBuf};
use std::time::Duration;

/// Process-wide tunables for the job worker.
///
/// Read once at startup (defaults, then environment, then CLI flags) and
/// threaded through the supervisor at construction; values are never
/// reloaded.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Root of the cgroup v2 hierarchy; per-job groups are created under it.
    pub cgroup_root: PathBuf,
    /// Directory holding per-job log files (`<log_root>/<id>.log`).
    pub log_root: PathBuf,
    /// How long a follow-mode tail reader sleeps between polls at EOF.
    pub tail_poll_interval: Duration,
    /// How long stop waits after SIGTERM before escalating to SIGKILL.
    pub stop_grace_period: Duration,
    /// Server-side bound on a single stop call. Must exceed the grace
    /// period, otherwise the SIGKILL escalation can never fire before the
    /// call gives up.
    pub stop_deadline: Duration,
    /// Poll cadence for callers waiting on a stopping job.
    pub stop_poll_interval: Duration,
    /// Client-side timeout for unary RPCs.
    pub unary_timeout: Duration,
    /// Client-side timeout for the output stream.
    pub stream_timeout: Duration,
    /// Uid the child is switched to before exec; negative disables the drop.
    pub worker_uid: i64,
    /// Gid the child is switched to before exec; negative disables the drop.
    pub worker_gid: i64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            cgroup_root: PathBuf::from("/sys/fs/cgroup"),
            log_root: PathBuf::from("/tmp"),
            tail_poll_interval: Duration::from_millis(500),
            stop_grace_period: Duration::from_secs(60),
            stop_deadline: Duration::from_secs(90),
            stop_poll_interval: Duration::from_secs(1),
            unary_timeout: Duration::from_secs(10),
            stream_timeout: Duration::from_secs(600),
            worker_uid: -1,
            worker_gid: -1,
        }
    }
}

impl WorkerConfig {
    /// Build a config from defaults overridden by `JOBWORKER_*` environment
    /// variables. Unparsable values fall back to the default; the flags on
    /// the binaries are the authoritative override path.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(path) = env_var("JOBWORKER_CGROUP_ROOT") {
            config.cgroup_root = PathBuf::from(path);
        }
        if let Some(path) = env_var("JOBWORKER_LOG_ROOT") {
            config.log_root = PathBuf::from(path);
        }
        if let Some(ms) = env_parse::<u64>("JOBWORKER_TAIL_POLL_MS") {
            config.tail_poll_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = env_parse::<u64>("JOBWORKER_STOP_GRACE_SECS") {
            config.stop_grace_period = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("JOBWORKER_STOP_DEADLINE_SECS") {
            config.stop_deadline = Duration::from_secs(secs);
        }
        if let Some(ms) = env_parse::<u64>("JOBWORKER_STOP_POLL_MS") {
            config.stop_poll_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = env_parse::<u64>("JOBWORKER_UNARY_TIMEOUT_SECS") {
            config.unary_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("JOBWORKER_STREAM_TIMEOUT_SECS") {
            config.stream_timeout = Duration::from_secs(secs);
        }
        if let Some(uid) = env_parse::<i64>("JOBWORKER_UID") {
            config.worker_uid = uid;
        }
        if let Some(gid) = env_parse::<i64>("JOBWORKER_GID") {
            config.worker_gid = gid;
        }
        config
    }

    /// Path of a job's log file.
    pub fn log_path(&self, id: &str) -> PathBuf {
        self.log_root.join(format!("{id}.log"))
    }

    /// True when both uid and gid are configured, enabling the privilege
    /// drop at spawn time.
    pub fn drops_privileges(&self) -> bool {
        self.worker_uid >= 0 && self.worker_gid >= 0
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_var(key).and_then(|v| v.trim().parse().ok())
}

/// File paths of the TLS material for one side of the mTLS connection.
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    /// CA certificate used to verify the peer.
    pub ca_cert_path: Option<PathBuf>,
    /// This side's certificate.
    pub cert_path: Option<PathBuf>,
    /// This side's private key.
    pub key_path: Option<PathBuf>,
}

impl TlsConfig {
    pub fn new(ca: impl AsRef<Path>, cert: impl AsRef<Path>, key: impl AsRef<Path>) -> Self {
        Self {
            ca_cert_path: Some(ca.as_ref().to_path_buf()),
            cert_path: Some(cert.as_ref().to_path_buf()),
            key_path: Some(key.as_ref().to_path_buf()),
        }
    }

    /// All three paths are configured.
    pub fn is_complete(&self) -> bool {
        self.ca_cert_path.is_some() && self.cert_path.is_some() && self.key_path.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_tunables_match_documented_values() {
        let config = WorkerConfig::default();
        assert_eq!(config.tail_poll_interval, Duration::from_millis(500));
        assert_eq!(config.stop_grace_period, Duration::from_secs(60));
        assert_eq!(config.stop_deadline, Duration::from_secs(90));
        assert_eq!(config.stop_poll_interval, Duration::from_secs(1));
        assert_eq!(config.unary_timeout, Duration::from_secs(10));
        assert_eq!(config.stream_timeout, Duration::from_secs(600));
        assert!(!config.drops_privileges());
    }

    #[test]
    fn default_stop_deadline_leaves_room_for_escalation() {
        // The SIGKILL escalation fires after the grace period; a deadline at
        // or below it would make that arm unreachable.
        let config = WorkerConfig::default();
        assert!(config.stop_deadline > config.stop_grace_period);
    }

    #[test]
    fn log_path_is_under_log_root() {
        let mut config = WorkerConfig::default();
        config.log_root = PathBuf::from("/var/log/jobs");
        assert_eq!(
            config.log_path("abc"),
            PathBuf::from("/var/log/jobs/abc.log")
        );
    }

    #[test]
    fn tls_config_is_complete() {
        let mut config = TlsConfig::default();
        assert!(!config.is_complete());

        config.ca_cert_path = Some(PathBuf::from("/tmp/ca.crt"));
        assert!(!config.is_complete());

        config.cert_path = Some(PathBuf::from("/tmp/node.crt"));
        assert!(!config.is_complete());

        config.key_path = Some(PathBuf::from("/tmp/node.key"));
        assert!(config.is_complete());
    }

    #[test]
    fn privilege_drop_requires_both_ids() {
        let mut config = WorkerConfig::default();
        config.worker_uid = 1000;
        assert!(!config.drops_privileges());
        config.worker_gid = 1000;
        assert!(config.drops_privileges());
    }
}
