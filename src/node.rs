use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::NodeConfig;
use crate::error::Result;
use crate::grpc::GrpcServer;
use crate::raft::node::RaftMessage;
use crate::raft::RaftNode;
use crate::storage::StateFile;

/// Main node that wires the consensus core to its durable state and the
/// gRPC surface.
pub struct Node {
    pub config: NodeConfig,
    pub raft_node: Arc<RaftNode>,
}

impl Node {
    /// Build a node, opening (and recovering from) its state file when a
    /// data directory is configured.
    pub fn new(config: NodeConfig) -> Result<(Self, tokio::sync::mpsc::Receiver<RaftMessage>)> {
        let storage = config
            .data_dir
            .as_ref()
            .map(|dir| StateFile::new(dir, &config.node_id))
            .transpose()?;

        let (raft_node, raft_rx) = RaftNode::new(config.clone(), storage)?;

        let node = Self {
            config,
            raft_node: Arc::new(raft_node),
        };

        Ok((node, raft_rx))
    }

    /// Run the node until `shutdown` is cancelled:
    /// 1. Connects to peer nodes for Raft communication
    /// 2. Spawns the Raft event loop (leader election, log replication)
    /// 3. Runs the gRPC server (blocking)
    pub async fn run(
        self,
        raft_rx: tokio::sync::mpsc::Receiver<RaftMessage>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        self.raft_node.connect_to_peers().await;

        let raft_node = self.raft_node.clone();
        let raft_shutdown = shutdown.clone();
        tokio::spawn(async move {
            raft_node.run(raft_rx, raft_shutdown).await;
        });

        let server = GrpcServer::new(self.config.listen_addr, self.raft_node.clone());
        server.run(shutdown).await?;
        Ok(())
    }
}
