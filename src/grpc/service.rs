use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};

use crate::proto::worker_server::Worker;
use crate::proto::{
    Data, JobStatus as ProtoJobStatus, OutputRequest, StartRequest, StartResponse, StatusRequest,
    StatusResponse, StopRequest, StopResponse,
};
use crate::registry::JobRegistry;
use crate::tail::OutputMode;
use crate::worker::{parse_mem_limit, Job, JobOpts, JobWorker};

/// Owner identity extracted from the client certificate, attached to every
/// request by the `authenticate` interceptor.
#[derive(Debug, Clone)]
pub struct Owner(pub String);

/// Authentication interceptor: the verified peer certificate's Common Name
/// becomes the request's owner identity.
///
/// Runs before every handler; a connection without a certificate or whose
/// certificate carries no CN is rejected here. Per-job authorization stays
/// in the handlers, which have the job id.
pub fn authenticate(mut request: Request<()>) -> Result<Request<()>, Status> {
    let certs = request
        .peer_certs()
        .ok_or_else(|| Status::unauthenticated("no client certificate presented"))?;
    let leaf = certs
        .first()
        .ok_or_else(|| Status::unauthenticated("no client certificate presented"))?;
    let cn = common_name(leaf.as_ref())
        .ok_or_else(|| Status::unauthenticated("no common name in client certificate"))?;
    request.extensions_mut().insert(Owner(cn));
    Ok(request)
}

fn common_name(der: &[u8]) -> Option<String> {
    let (_, cert) = x509_parser::parse_x509_certificate(der).ok()?;
    let cn = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_string);
    cn
}

/// gRPC implementation of the `Worker` service.
pub struct WorkerService {
    worker: JobWorker,
    registry: Arc<JobRegistry>,
    draining: Arc<AtomicBool>,
}

impl WorkerService {
    pub fn new(worker: JobWorker, registry: Arc<JobRegistry>) -> Self {
        Self {
            worker,
            registry,
            draining: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Drain flag shared with the transport: once set, Start is refused
    /// while Stop, Status, and Output keep serving existing jobs.
    pub fn draining_flag(&self) -> Arc<AtomicBool> {
        self.draining.clone()
    }

    fn owner<T>(request: &Request<T>) -> Result<String, Status> {
        request
            .extensions()
            .get::<Owner>()
            .map(|owner| owner.0.clone())
            .ok_or_else(|| Status::unauthenticated("no owner identity on request"))
    }

    /// Resolve a job the caller is allowed to operate on. The same error is
    /// returned whether the id is unknown or owned by someone else, so a
    /// caller cannot probe for other owners' job ids.
    async fn authorized(&self, owner: &str, id: &str) -> Result<Arc<Job>, Status> {
        self.registry
            .get(owner, id)
            .await
            .ok_or_else(|| Status::unauthenticated("invalid job id"))
    }
}

#[tonic::async_trait]
impl Worker for WorkerService {
    async fn start(
        &self,
        request: Request<StartRequest>,
    ) -> Result<Response<StartResponse>, Status> {
        if self.draining.load(Ordering::SeqCst) {
            return Err(Status::unavailable("draining, not accepting new jobs"));
        }
        let owner = Self::owner(&request)?;
        let req = request.into_inner();

        let opts = req
            .opts
            .ok_or_else(|| Status::invalid_argument("missing job opts"))?;
        let mem_limit = parse_mem_limit(&opts.mem_limit).map_err(Status::from)?;
        let opts = JobOpts::new(opts.cpu_weight, opts.io_weight, mem_limit);

        let job = self
            .worker
            .start(opts, &req.command, &req.args)
            .await
            .map_err(Status::from)?;
        let id = job.id().to_string();

        self.registry.upsert(&owner, job).await;
        tracing::info!(owner = %owner, id = %id, "job registered");

        Ok(Response::new(StartResponse { id }))
    }

    async fn stop(&self, request: Request<StopRequest>) -> Result<Response<StopResponse>, Status> {
        let owner = Self::owner(&request)?;
        let req = request.into_inner();
        let job = self.authorized(&owner, &req.id).await?;

        tracing::info!(owner = %owner, id = %req.id, "stop requested");

        // Runs on its own task: a caller that disconnects mid-stop must not
        // abort the termination protocol or the cleanup behind it. The
        // deadline is the dedicated stop bound, which exceeds the grace
        // period so the SIGKILL escalation stays reachable.
        let deadline = self.worker.config().stop_deadline;
        tokio::spawn(async move { job.stop(deadline).await })
            .await
            .map_err(|e| Status::internal(format!("stop task failed: {e}")))?
            .map_err(Status::from)?;

        // The job stays registered so its owner can keep querying status.
        Ok(Response::new(StopResponse {}))
    }

    async fn status(
        &self,
        request: Request<StatusRequest>,
    ) -> Result<Response<StatusResponse>, Status> {
        let owner = Self::owner(&request)?;
        let req = request.into_inner();
        let job = self.authorized(&owner, &req.id).await?;

        let status = job.status().await;
        Ok(Response::new(StatusResponse {
            job_status: Some(ProtoJobStatus {
                id: status.id,
                pid: status.pid as i32,
                running: status.running,
                exit_code: status.exit_code,
            }),
        }))
    }

    type OutputStream = ReceiverStream<Result<Data, Status>>;

    async fn output(
        &self,
        request: Request<OutputRequest>,
    ) -> Result<Response<Self::OutputStream>, Status> {
        let owner = Self::owner(&request)?;
        let req = request.into_inner();
        let job = self.authorized(&owner, &req.id).await?;

        let mode = if req.follow {
            OutputMode::Follow
        } else {
            OutputMode::NoFollow
        };
        let mut reader = job.output(mode).await.map_err(Status::from)?;
        tracing::info!(owner = %owner, id = %req.id, follow = req.follow, "output stream opened");

        // One frame per log line. The reader is registered on the job, so
        // the reaper unblocks this task when the child exits; a departed
        // client shows up as a send failure and ends it from the other side.
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let mut framer = LineFramer::new();
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        for line in framer.push(&buf[..n]) {
                            if tx.send(Ok(Data { bytes: line })).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Err(Status::internal(e.to_string()))).await;
                        return;
                    }
                }
            }
            if let Some(rest) = framer.take_remainder() {
                let _ = tx.send(Ok(Data { bytes: rest })).await;
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

/// Splits a byte stream into newline-terminated frames, buffering partial
/// lines across reads.
struct LineFramer {
    pending: Vec<u8>,
}

impl LineFramer {
    fn new() -> Self {
        Self {
            pending: Vec::new(),
        }
    }

    fn push(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
            line.pop();
            lines.push(line);
        }
        lines
    }

    /// Whatever is left after the final read; a trailing line without a
    /// newline still reaches the client.
    fn take_remainder(&mut self) -> Option<Vec<u8>> {
        if self.pending.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.pending))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authenticate_rejects_requests_without_peer_certs() {
        // No TLS connect info on the request, as with a plaintext probe.
        let result = authenticate(Request::new(()));
        assert_eq!(result.unwrap_err().code(), tonic::Code::Unauthenticated);
    }

    #[test]
    fn framer_splits_complete_lines() {
        let mut framer = LineFramer::new();
        let lines = framer.push(b"a\nb\nc\n");
        assert_eq!(lines, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
        assert!(framer.take_remainder().is_none());
    }

    #[test]
    fn framer_buffers_partial_lines_across_reads() {
        let mut framer = LineFramer::new();
        assert!(framer.push(b"hel").is_empty());
        let lines = framer.push(b"lo\nwor");
        assert_eq!(lines, vec![b"hello".to_vec()]);
        assert_eq!(framer.take_remainder(), Some(b"wor".to_vec()));
        assert!(framer.take_remainder().is_none());
    }

    #[test]
    fn framer_keeps_empty_lines() {
        let mut framer = LineFramer::new();
        let lines = framer.push(b"\n\nx\n");
        assert_eq!(lines, vec![Vec::new(), Vec::new(), b"x".to_vec()]);
    }
}
