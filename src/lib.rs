pub mod config;
pub mod error;
pub mod grpc;
pub mod node;
pub mod raft;
pub mod shutdown;
pub mod storage;

// Re-export generated protobuf types
pub mod proto {
    tonic::include_proto!("replog");
}
