use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_id: u64,
    /// Address the Raft gRPC server binds to.
    pub listen_addr: SocketAddr,
    /// Address the client-facing HTTP API binds to.
    pub api_addr: SocketAddr,
    /// Directory holding current_term, voted_for and the log.
    pub data_dir: PathBuf,
    pub peers: Vec<PeerConfig>,
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// Per-call deadline for outbound Raft RPCs.
    pub rpc_timeout_ms: u64,
    /// How long a client write may wait for its quorum before failing.
    pub proposal_timeout_ms: u64,
}

#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub node_id: u64,
    pub addr: String, // host:port format, supports both IP and hostnames
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            listen_addr: "127.0.0.1:50051".parse().unwrap(),
            api_addr: "127.0.0.1:8080".parse().unwrap(),
            data_dir: PathBuf::from("./data"),
            peers: Vec::new(),
            election_timeout_min_ms: 150,
            election_timeout_max_ms: 300,
            heartbeat_interval_ms: 50,
            rpc_timeout_ms: 100,
            proposal_timeout_ms: 2000,
        }
    }
}

impl NodeConfig {
    pub fn new(node_id: u64, listen_addr: SocketAddr) -> Self {
        Self {
            node_id,
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_peer(mut self, node_id: u64, addr: String) -> Self {
        self.peers.push(PeerConfig { node_id, addr });
        self
    }

    /// Total number of replicas, this node included.
    pub fn cluster_size(&self) -> usize {
        self.peers.len() + 1
    }

    /// Votes or acknowledgements needed for a quorum.
    pub fn majority(&self) -> usize {
        self.cluster_size() / 2 + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_majority() {
        let mut config = NodeConfig::default();
        assert_eq!(config.cluster_size(), 1);
        assert_eq!(config.majority(), 1);

        config = config
            .with_peer(2, "127.0.0.1:50052".to_string())
            .with_peer(3, "127.0.0.1:50053".to_string());
        assert_eq!(config.cluster_size(), 3);
        assert_eq!(config.majority(), 2);

        config = config
            .with_peer(4, "127.0.0.1:50054".to_string())
            .with_peer(5, "127.0.0.1:50055".to_string());
        assert_eq!(config.cluster_size(), 5);
        assert_eq!(config.majority(), 3);
    }
}
