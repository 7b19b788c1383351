use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_id: String,
    pub listen_addr: SocketAddr,
    pub peers: Vec<PeerConfig>,
    /// Directory for the durable state file. `None` keeps all state in
    /// memory, which is only appropriate for tests.
    pub data_dir: Option<PathBuf>,
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    pub heartbeat_interval_ms: u64,
}

#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub node_id: String,
    pub addr: String, // host:port format, supports both IP and hostnames
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: "node1".to_string(),
            // SAFETY: This is a hardcoded valid address that will always parse
            listen_addr: "127.0.0.1:7201"
                .parse()
                .expect("default listen address is valid"),
            peers: Vec::new(),
            data_dir: None,
            election_timeout_min_ms: 150,
            election_timeout_max_ms: 300,
            heartbeat_interval_ms: 500,
        }
    }
}

impl NodeConfig {
    pub fn new(node_id: impl Into<String>, listen_addr: SocketAddr) -> Self {
        Self {
            node_id: node_id.into(),
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_peer(mut self, node_id: impl Into<String>, addr: String) -> Self {
        self.peers.push(PeerConfig {
            node_id: node_id.into(),
            addr,
        });
        self
    }

    /// Total number of participants, this node included.
    pub fn cluster_size(&self) -> u64 {
        self.peers.len() as u64 + 1
    }

    /// Votes required to win an election: a strict majority of the cluster.
    pub fn majority(&self) -> u64 {
        self.cluster_size() / 2 + 1
    }
}
