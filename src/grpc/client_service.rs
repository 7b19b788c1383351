use std::sync::Arc;
use tonic::{Request, Response, Status};

use crate::error::ReplogError;
use crate::proto::log_service_server::LogService;
use crate::proto::{
    GetLeaderRequest, GetLeaderResponse, SubmitCommandRequest, SubmitCommandResponse, SubmitStatus,
};
use crate::raft::node::RaftMessage;
use crate::raft::RaftNode;

/// Leader id reported to clients when no leader is known.
const UNKNOWN_LEADER: &str = "unknown";

/// gRPC service for the client-facing API.
///
/// Outcomes are encoded in the response payload (`OK` / `REDIRECT` /
/// `ERROR`); gRPC-level errors are reserved for transport and internal
/// faults.
pub struct ClientService {
    raft_node: Arc<RaftNode>,
}

impl ClientService {
    pub fn new(raft_node: Arc<RaftNode>) -> Self {
        Self { raft_node }
    }

    async fn known_leader(&self) -> String {
        self.raft_node
            .get_leader_id()
            .await
            .unwrap_or_else(|| UNKNOWN_LEADER.to_string())
    }
}

#[tonic::async_trait]
impl LogService for ClientService {
    async fn submit_command(
        &self,
        request: Request<SubmitCommandRequest>,
    ) -> Result<Response<SubmitCommandResponse>, Status> {
        let req = request.into_inner();

        if req.command.trim().is_empty() {
            return Ok(Response::new(SubmitCommandResponse {
                status: SubmitStatus::Error as i32,
                message: "Empty command".to_string(),
                leader: String::new(),
            }));
        }

        if !self.raft_node.is_leader().await {
            return Ok(Response::new(SubmitCommandResponse {
                status: SubmitStatus::Redirect as i32,
                message: "This node is not the leader".to_string(),
                leader: self.known_leader().await,
            }));
        }

        let (tx, rx) = tokio::sync::oneshot::channel();
        self.raft_node
            .message_sender()
            .send(RaftMessage::AppendCommand {
                command: req.command.clone(),
                response_tx: tx,
            })
            .await
            .map_err(|_| Status::internal("Failed to send command to Raft"))?;

        match rx.await {
            Ok(Ok(index)) => {
                tracing::info!(index, command = %req.command, "Command accepted");
                Ok(Response::new(SubmitCommandResponse {
                    status: SubmitStatus::Ok as i32,
                    message: format!("Command accepted at index {}", index),
                    leader: String::new(),
                }))
            }
            // Lost leadership between the role check and the append
            Ok(Err(ReplogError::NotLeader(leader))) => Ok(Response::new(SubmitCommandResponse {
                status: SubmitStatus::Redirect as i32,
                message: "This node is not the leader".to_string(),
                leader: leader.unwrap_or_else(|| UNKNOWN_LEADER.to_string()),
            })),
            Ok(Err(e)) => Ok(Response::new(SubmitCommandResponse {
                status: SubmitStatus::Error as i32,
                message: e.to_string(),
                leader: String::new(),
            })),
            Err(_) => Err(Status::internal("Failed to receive Raft response")),
        }
    }

    async fn get_leader(
        &self,
        _request: Request<GetLeaderRequest>,
    ) -> Result<Response<GetLeaderResponse>, Status> {
        Ok(Response::new(GetLeaderResponse {
            leader_id: self.known_leader().await,
        }))
    }
}
