use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tonic::{Request, Response, Status};

use crate::error::Result;
use crate::proto::raft_service_server::RaftService;
use crate::proto::{AppendEntriesRequest, AppendEntriesResponse, VoteRequest, VoteResponse};
use crate::raft::RaftNode;

/// gRPC service for internal Raft communication
pub struct ClusterService {
    raft_node: Arc<RaftNode>,
}

impl ClusterService {
    pub fn new(raft_node: Arc<RaftNode>) -> Self {
        Self { raft_node }
    }
}

/// Run a consensus handler with panic isolation: a bug in the handler
/// must fail the one RPC, never the transport serving every peer.
async fn isolate<T, F>(name: &str, handler: F) -> std::result::Result<Response<T>, Status>
where
    F: Future<Output = Result<T>>,
{
    match AssertUnwindSafe(handler).catch_unwind().await {
        Ok(Ok(response)) => Ok(Response::new(response)),
        Ok(Err(e)) => Err(Status::internal(format!("{name} failed: {e}"))),
        Err(_) => {
            tracing::error!(handler = name, "consensus handler panicked");
            Err(Status::internal(format!("{name} panicked")))
        }
    }
}

#[tonic::async_trait]
impl RaftService for ClusterService {
    async fn request_vote(
        &self,
        request: Request<VoteRequest>,
    ) -> std::result::Result<Response<VoteResponse>, Status> {
        let req = request.into_inner();
        tracing::debug!(
            candidate = req.candidate_id,
            term = req.term,
            "vote request received"
        );

        isolate("RequestVote", self.raft_node.handle_vote_request(req)).await
    }

    async fn append_entries(
        &self,
        request: Request<AppendEntriesRequest>,
    ) -> std::result::Result<Response<AppendEntriesResponse>, Status> {
        let req = request.into_inner();
        tracing::trace!(
            leader = req.leader_id,
            term = req.term,
            entries = req.entries.len(),
            "append entries received"
        );

        isolate("AppendEntries", self.raft_node.handle_append_entries(req)).await
    }
}
