pub mod cgroup;
pub mod config;
pub mod error;
pub mod grpc;
pub mod registry;
pub mod tail;
pub mod tls;
pub mod worker;

// Re-export generated protobuf types
pub mod proto {
    tonic::include_proto!("jobworker");
}
