use async_trait::async_trait;
use schema::{ShardEndpoint, ShardWriteRequest, ShardWriteResponse, Status};

/// One sub-batch addressed to one shard endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct ShardRequest {
    pub endpoint: ShardEndpoint,
    pub payload: ShardWriteRequest,
}

/// Sends sub-batches to shards. An `Err` is a transport-level failure (the
/// shard never produced a response); command and item errors arrive inside
/// an `Ok` response.
///
/// Requests to different endpoints may be in flight at the same time and
/// complete in any order.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn submit(&self, request: &ShardRequest) -> Result<ShardWriteResponse, Status>;
}
