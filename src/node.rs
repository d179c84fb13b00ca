use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use crate::api::{run_api, ApiState};
use crate::config::NodeConfig;
use crate::error::Result;
use crate::grpc::GrpcServer;
use crate::kv::KvStore;
use crate::raft::node::RaftMessage;
use crate::raft::RaftNode;

/// One replica: the consensus node, the key-value state machine, the
/// apply loop between them, and the two server surfaces.
pub struct Node {
    pub config: NodeConfig,
    pub raft_node: Arc<RaftNode>,
    pub kv: Arc<RwLock<KvStore>>,
    shutdown: CancellationToken,
}

impl Node {
    pub fn new(
        config: NodeConfig,
        shutdown: CancellationToken,
    ) -> Result<(Self, mpsc::Receiver<RaftMessage>)> {
        let (raft_node, raft_rx) = RaftNode::new(config.clone(), shutdown.clone())?;

        let node = Self {
            config,
            raft_node: Arc::new(raft_node),
            kv: Arc::new(RwLock::new(KvStore::new())),
            shutdown,
        };

        Ok((node, raft_rx))
    }

    /// Run the node: registers peers, spawns the Raft event loop, the
    /// apply loop and the HTTP API, then blocks on the gRPC server until
    /// shutdown.
    pub async fn run(self, raft_rx: mpsc::Receiver<RaftMessage>) -> Result<()> {
        self.raft_node.connect_to_peers().await;

        let raft_node = self.raft_node.clone();
        tokio::spawn(async move {
            raft_node.run(raft_rx).await;
        });

        let apply_raft = self.raft_node.clone();
        let apply_kv = self.kv.clone();
        let apply_shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            Self::apply_loop(apply_raft, apply_kv, apply_shutdown).await;
        });

        let api_state = ApiState {
            raft_node: self.raft_node.clone(),
            kv: self.kv.clone(),
        };
        let api_addr = self.config.api_addr;
        let api_shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            run_api(api_addr, api_state, api_shutdown).await;
        });

        let server = GrpcServer::new(self.config.listen_addr, self.raft_node.clone());
        server.run(self.shutdown.clone()).await?;

        Ok(())
    }

    /// Deliver committed entries to the state machine in index order.
    /// Wakes whenever the commit index moves; on restart the recovered
    /// log replays through the same path as the cluster re-commits it.
    async fn apply_loop(
        raft_node: Arc<RaftNode>,
        kv: Arc<RwLock<KvStore>>,
        shutdown: CancellationToken,
    ) {
        let mut commit_rx = raft_node.subscribe_commits();

        loop {
            let entries = raft_node.get_committed_entries().await;
            if !entries.is_empty() {
                let mut store = kv.write().await;
                for (index, entry) in entries {
                    store.apply(index, &entry.command);
                    tracing::trace!(index, "applied entry");
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                changed = commit_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
    }
}
