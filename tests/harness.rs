//! Shared helpers for the integration suite.
//!
//! Jobs in these tests run under a `NullController` (no cgroup side
//! effects) with logs in a scratch directory and a short grace period so
//! stop paths stay fast.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use jobworker::cgroup::NullController;
use jobworker::config::WorkerConfig;
use jobworker::grpc::WorkerService;
use jobworker::registry::JobRegistry;
use jobworker::worker::{JobOpts, JobWorker};

/// A supervisor wired for tests; the scratch log root lives as long as the
/// struct.
pub struct TestWorker {
    pub worker: JobWorker,
    pub config: Arc<WorkerConfig>,
    _log_root: TempDir,
}

pub fn test_config(log_root: &TempDir) -> Arc<WorkerConfig> {
    let mut config = WorkerConfig::default();
    config.log_root = log_root.path().to_path_buf();
    config.tail_poll_interval = Duration::from_millis(20);
    // Shortened but keeping the production ordering: the stop deadline
    // stays above the grace period so escalation remains reachable.
    config.stop_grace_period = Duration::from_millis(300);
    config.stop_deadline = Duration::from_secs(5);
    Arc::new(config)
}

pub fn test_worker() -> TestWorker {
    let log_root = TempDir::new().expect("failed to create scratch log root");
    let config = test_config(&log_root);
    TestWorker {
        worker: JobWorker::new(config.clone(), Arc::new(NullController)),
        config,
        _log_root: log_root,
    }
}

/// A `WorkerService` over a test supervisor, with the registry shared out
/// so tests can inspect it.
pub struct TestService {
    pub service: WorkerService,
    pub registry: Arc<JobRegistry>,
    pub config: Arc<WorkerConfig>,
    _log_root: TempDir,
}

pub fn test_service() -> TestService {
    let log_root = TempDir::new().expect("failed to create scratch log root");
    let config = test_config(&log_root);
    let registry = Arc::new(JobRegistry::new());
    let worker = JobWorker::new(config.clone(), Arc::new(NullController));
    TestService {
        service: WorkerService::new(worker, registry.clone()),
        registry,
        config,
        _log_root: log_root,
    }
}

/// Default opts used across tests: weights 100, 50M memory.
pub fn test_opts() -> JobOpts {
    JobOpts::new(100, 100, 50 * 1024 * 1024)
}

/// `bash -c <script>` argv pair.
pub fn shell(script: &str) -> (String, Vec<String>) {
    (
        "bash".to_string(),
        vec!["-c".to_string(), script.to_string()],
    )
}

/// Wait for a condition to become true with timeout.
pub async fn wait_for<F, Fut>(condition: F, timeout: Duration, poll: Duration) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout {
        if condition().await {
            return true;
        }
        tokio::time::sleep(poll).await;
    }
    false
}

/// Assert a condition eventually becomes true.
pub async fn assert_eventually<F, Fut>(condition: F, timeout: Duration, message: &str)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = wait_for(condition, timeout, Duration::from_millis(20)).await;
    assert!(result, "{}", message);
}
