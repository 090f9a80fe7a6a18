use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use jobworker::config::{TlsConfig, WorkerConfig};
use jobworker::grpc::{GrpcServer, WorkerService};
use jobworker::registry::JobRegistry;
use jobworker::tls::TlsIdentity;
use jobworker::worker::JobWorker;

#[derive(Parser, Debug)]
#[command(name = "jobworkerd")]
#[command(about = "Remote job execution service: supervised commands under cgroup v2 limits")]
struct Args {
    /// Port to listen on for gRPC
    #[arg(long, default_value_t = 50051)]
    port: u16,

    /// CA certificate used to verify client certificates
    #[arg(long, default_value = "certs/root.pem")]
    ca_cert: PathBuf,

    /// Server certificate
    #[arg(long, default_value = "certs/server.pem")]
    cert: PathBuf,

    /// Server private key
    #[arg(long, default_value = "certs/server-key.pem")]
    key: PathBuf,

    /// Root of the cgroup v2 hierarchy
    #[arg(long)]
    cgroup_root: Option<PathBuf>,

    /// Directory for per-job log files
    #[arg(long)]
    log_root: Option<PathBuf>,

    /// Uid jobs are switched to at spawn; negative disables the drop
    #[arg(long)]
    worker_uid: Option<i64>,

    /// Gid jobs are switched to at spawn; negative disables the drop
    #[arg(long)]
    worker_gid: Option<i64>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = WorkerConfig::from_env();
    if let Some(root) = args.cgroup_root {
        config.cgroup_root = root;
    }
    if let Some(root) = args.log_root {
        config.log_root = root;
    }
    if let Some(uid) = args.worker_uid {
        config.worker_uid = uid;
    }
    if let Some(gid) = args.worker_gid {
        config.worker_gid = gid;
    }
    let config = Arc::new(config);

    let listen_addr: SocketAddr = format!("0.0.0.0:{}", args.port).parse()?;
    let tls = TlsIdentity::load(&TlsConfig::new(&args.ca_cert, &args.cert, &args.key)).await?;

    tracing::info!(
        addr = %listen_addr,
        cgroup_root = %config.cgroup_root.display(),
        log_root = %config.log_root.display(),
        drop_privileges = config.drops_privileges(),
        "starting jobworkerd"
    );

    let worker = JobWorker::with_cgroup(config);
    let service = WorkerService::new(worker, Arc::new(JobRegistry::new()));

    GrpcServer::new(listen_addr, tls, service).run().await?;

    Ok(())
}
