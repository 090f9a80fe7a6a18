use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::signal::unix::{signal, SignalKind};
use tonic::transport::Server;

use crate::grpc::service::{authenticate, WorkerService};
use crate::proto::worker_server::WorkerServer;
use crate::tls::TlsIdentity;

/// The service's transport: tonic over mutually authenticated TLS.
///
/// Client certificates are required and verified against the CA
/// (`TlsIdentity::server_tls_config`); the `authenticate` interceptor then
/// turns the verified certificate into the owner identity every handler
/// authorizes against.
pub struct GrpcServer {
    addr: SocketAddr,
    tls: TlsIdentity,
    service: WorkerService,
}

impl GrpcServer {
    pub fn new(addr: SocketAddr, tls: TlsIdentity, service: WorkerService) -> Self {
        Self { addr, tls, service }
    }

    /// Serve until SIGTERM or SIGINT, then drain: the service stops
    /// accepting new jobs, in-flight RPCs and open output streams finish,
    /// and the listener shuts down.
    pub async fn run(self) -> Result<(), tonic::transport::Error> {
        let draining = self.service.draining_flag();

        tracing::info!(addr = %self.addr, "starting gRPC server");

        Server::builder()
            .tls_config(self.tls.server_tls_config())?
            .add_service(WorkerServer::with_interceptor(self.service, authenticate))
            .serve_with_shutdown(self.addr, drain_on_signal(draining))
            .await
    }
}

/// Resolves once a termination signal arrives. The draining flag flips
/// before the listener starts shutting down, so a Start racing the signal
/// is refused rather than spawning a job the server no longer tracks to
/// completion.
async fn drain_on_signal(draining: Arc<AtomicBool>) {
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

    let received = tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    };

    draining.store(true, Ordering::SeqCst);
    tracing::info!(
        signal = received,
        "draining: refusing new jobs, finishing in-flight requests"
    );
}
