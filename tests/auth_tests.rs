//! Per-owner authorization at the service layer.
//!
//! The transport guarantees an authenticated owner identity on every
//! request (the interceptor rejects connections without a verified client
//! certificate); these tests exercise the rules downstream of it by
//! attaching the `Owner` extension directly.

mod harness;

use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio_stream::StreamExt;
use tonic::{Code, Request};

use harness::{test_service, TestService};
use jobworker::grpc::Owner;
use jobworker::proto::worker_server::Worker;
use jobworker::proto::{JobOpts, OutputRequest, StartRequest, StatusRequest, StopRequest};

fn request_as<T>(owner: &str, message: T) -> Request<T> {
    let mut request = Request::new(message);
    request.extensions_mut().insert(Owner(owner.to_string()));
    request
}

fn start_request(script: &str) -> StartRequest {
    StartRequest {
        command: "bash".to_string(),
        args: vec!["-c".to_string(), script.to_string()],
        opts: Some(JobOpts {
            cpu_weight: 100,
            io_weight: 100,
            mem_limit: "100M".to_string(),
        }),
    }
}

async fn start_job(ts: &TestService, owner: &str, script: &str) -> String {
    ts.service
        .start(request_as(owner, start_request(script)))
        .await
        .expect("start failed")
        .into_inner()
        .id
}

#[tokio::test]
async fn start_records_the_job_under_the_caller() {
    let ts = test_service();
    let id = start_job(&ts, "alice", "sleep 5").await;

    let job = ts.registry.get("alice", &id).await;
    assert!(job.is_some());

    job.unwrap().stop(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn cross_owner_operations_are_unauthenticated() {
    let ts = test_service();
    let id = start_job(&ts, "alice", "sleep 5").await;

    // Bob cannot stop, query, or tail Alice's job; every miss looks the
    // same as an unknown id.
    let err = ts
        .service
        .stop(request_as("bob", StopRequest { id: id.clone() }))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Unauthenticated);

    let err = ts
        .service
        .status(request_as("bob", StatusRequest { id: id.clone() }))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Unauthenticated);

    let err = ts
        .service
        .output(request_as(
            "bob",
            OutputRequest {
                id: id.clone(),
                follow: false,
            },
        ))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Unauthenticated);

    // No side effects on the job: it is still running and Alice can still
    // operate on it.
    let status = ts
        .service
        .status(request_as("alice", StatusRequest { id: id.clone() }))
        .await
        .unwrap()
        .into_inner()
        .job_status
        .unwrap();
    assert!(status.running);

    ts.service
        .stop(request_as("alice", StopRequest { id }))
        .await
        .unwrap();
}

#[tokio::test]
async fn unknown_job_id_is_unauthenticated() {
    let ts = test_service();
    let err = ts
        .service
        .status(request_as(
            "alice",
            StatusRequest {
                id: "not-a-job".to_string(),
            },
        ))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Unauthenticated);
}

#[tokio::test]
async fn request_without_owner_identity_is_rejected() {
    let ts = test_service();
    let err = ts
        .service
        .status(Request::new(StatusRequest {
            id: "anything".to_string(),
        }))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Unauthenticated);
}

#[tokio::test]
async fn start_rejects_invalid_memory_limit() {
    let ts = test_service();
    let mut request = start_request("echo hello");
    request.opts.as_mut().unwrap().mem_limit = "10X".to_string();

    let err = ts
        .service
        .start(request_as("alice", request))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
}

#[tokio::test]
async fn start_rejects_missing_opts() {
    let ts = test_service();
    let mut request = start_request("echo hello");
    request.opts = None;

    let err = ts
        .service
        .start(request_as("alice", request))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
}

#[tokio::test]
async fn start_rejects_empty_command() {
    let ts = test_service();
    let mut request = start_request("echo hello");
    request.command = String::new();

    let err = ts
        .service
        .start(request_as("alice", request))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
}

#[tokio::test]
async fn output_streams_one_frame_per_line() {
    let ts = test_service();
    let id = start_job(
        &ts,
        "alice",
        "for i in 1 2 3 4 5; do echo ${i}: hello; sleep 0.01; done",
    )
    .await;

    let job = ts.registry.get("alice", &id).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), job.wait())
        .await
        .expect("job did not exit");

    let mut stream = ts
        .service
        .output(request_as("alice", OutputRequest { id, follow: false }))
        .await
        .unwrap()
        .into_inner();

    let mut frames = Vec::new();
    while let Some(frame) = stream.next().await {
        frames.push(String::from_utf8(frame.unwrap().bytes).unwrap());
    }
    assert_eq!(
        frames,
        vec!["1: hello", "2: hello", "3: hello", "4: hello", "5: hello"]
    );
}

#[tokio::test]
async fn draining_refuses_new_jobs_but_serves_existing_ones() {
    let ts = test_service();
    let id = start_job(&ts, "alice", "sleep 5").await;

    ts.service.draining_flag().store(true, Ordering::SeqCst);

    // No new work once draining.
    let err = ts
        .service
        .start(request_as("alice", start_request("echo hello")))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Unavailable);

    // Existing jobs can still be queried and stopped.
    let status = ts
        .service
        .status(request_as("alice", StatusRequest { id: id.clone() }))
        .await
        .unwrap()
        .into_inner()
        .job_status
        .unwrap();
    assert!(status.running);

    ts.service
        .stop(request_as("alice", StopRequest { id }))
        .await
        .unwrap();
}

#[tokio::test]
async fn stopped_jobs_remain_queryable_by_their_owner() {
    let ts = test_service();
    let id = start_job(&ts, "alice", "sleep 5").await;

    ts.service
        .stop(request_as("alice", StopRequest { id: id.clone() }))
        .await
        .unwrap();

    // Stop does not remove the job from the registry.
    let status = ts
        .service
        .status(request_as("alice", StatusRequest { id }))
        .await
        .unwrap()
        .into_inner()
        .job_status
        .unwrap();
    assert!(!status.running);
}
