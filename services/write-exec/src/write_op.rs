use std::collections::BTreeMap;

use schema::{ShardEndpoint, ShardId, ShardVersion, StaleRoutingInfo, Status, WriteItem};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOpState {
    /// Waiting to be targeted in the next round.
    Ready,
    /// Sent to one or more endpoints; responses outstanding.
    Pending,
    /// Every targeted endpoint acknowledged the write.
    Completed,
    /// Terminal failure; see [`WriteOp::error`].
    Error,
}

/// Outcome of one op at one shard endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointState {
    Pending(ShardVersion),
    Acknowledged,
    /// The shard rejected the routing version; the endpoint is re-targeted.
    Stale(StaleRoutingInfo),
    /// The shard did not attempt the write (an earlier item of an ordered
    /// sub-batch failed); the endpoint is re-targeted.
    Cancelled,
    Failed(Status),
}

/// One item of the client batch, tracked across rounds.
///
/// Acknowledgements are kept per shard, so re-targeting after a partial
/// failure only sends the item to endpoints that have not applied it yet.
#[derive(Debug, Clone)]
pub struct WriteOp {
    index: usize,
    item: WriteItem,
    estimated_size: usize,
    state: WriteOpState,
    endpoints: BTreeMap<ShardId, EndpointState>,
    error: Option<Status>,
}

impl WriteOp {
    pub fn new(index: usize, item: WriteItem) -> Self {
        let estimated_size = item.estimated_size();
        Self {
            index,
            item,
            estimated_size,
            state: WriteOpState::Ready,
            endpoints: BTreeMap::new(),
            error: None,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn item(&self) -> &WriteItem {
        &self.item
    }

    pub fn estimated_size(&self) -> usize {
        self.estimated_size
    }

    pub fn state(&self) -> WriteOpState {
        self.state
    }

    pub fn error(&self) -> Option<&Status> {
        self.error.as_ref()
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state, WriteOpState::Completed | WriteOpState::Error)
    }

    pub fn endpoint_state(&self, shard_id: &ShardId) -> Option<&EndpointState> {
        self.endpoints.get(shard_id)
    }

    /// Drop endpoints that already acknowledged this op.
    pub fn unacknowledged(&self, endpoints: Vec<ShardEndpoint>) -> Vec<ShardEndpoint> {
        endpoints
            .into_iter()
            .filter(|endpoint| {
                !matches!(
                    self.endpoints.get(&endpoint.shard_id),
                    Some(EndpointState::Acknowledged)
                )
            })
            .collect()
    }

    /// Ready -> Pending against `endpoints`. Targeting only endpoints that have
    /// all acknowledged already completes the op.
    pub fn target(&mut self, endpoints: &[ShardEndpoint]) {
        if self.state != WriteOpState::Ready {
            return;
        }
        for endpoint in endpoints {
            if matches!(
                self.endpoints.get(&endpoint.shard_id),
                Some(EndpointState::Acknowledged)
            ) {
                continue;
            }
            self.endpoints.insert(
                endpoint.shard_id.clone(),
                EndpointState::Pending(endpoint.version),
            );
        }
        self.state = WriteOpState::Pending;
        self.settle();
    }

    pub fn note_response(&mut self, shard_id: &ShardId) {
        self.resolve_endpoint(shard_id, EndpointState::Acknowledged);
    }

    pub fn note_stale_response(&mut self, shard_id: &ShardId, info: StaleRoutingInfo) {
        self.resolve_endpoint(shard_id, EndpointState::Stale(info));
    }

    pub fn note_endpoint_error(&mut self, shard_id: &ShardId, status: Status) {
        self.resolve_endpoint(shard_id, EndpointState::Failed(status));
    }

    pub fn cancel_endpoint(&mut self, shard_id: &ShardId) {
        self.resolve_endpoint(shard_id, EndpointState::Cancelled);
    }

    /// Terminal failure regardless of outstanding endpoints. Completed ops keep
    /// their outcome.
    pub fn note_error(&mut self, status: Status) {
        if self.state == WriteOpState::Completed {
            return;
        }
        for state in self.endpoints.values_mut() {
            if matches!(state, EndpointState::Pending(_)) {
                *state = EndpointState::Failed(status.clone());
            }
        }
        self.state = WriteOpState::Error;
        self.error = Some(status);
    }

    fn resolve_endpoint(&mut self, shard_id: &ShardId, outcome: EndpointState) {
        if self.state != WriteOpState::Pending {
            return;
        }
        let Some(state) = self.endpoints.get_mut(shard_id) else {
            return;
        };
        if !matches!(state, EndpointState::Pending(_)) {
            return;
        }
        *state = outcome;
        self.settle();
    }

    /// Once nothing is outstanding, fold endpoint outcomes into the op state:
    /// any failure is terminal, any stale or cancelled endpoint sends the op
    /// back to Ready, otherwise the op is complete.
    fn settle(&mut self) {
        if self
            .endpoints
            .values()
            .any(|state| matches!(state, EndpointState::Pending(_)))
        {
            return;
        }
        let failure = self.endpoints.values().find_map(|state| match state {
            EndpointState::Failed(status) => Some(status.clone()),
            _ => None,
        });
        if let Some(status) = failure {
            self.state = WriteOpState::Error;
            self.error = Some(status);
            return;
        }
        let retarget = self
            .endpoints
            .values()
            .any(|state| matches!(state, EndpointState::Stale(_) | EndpointState::Cancelled));
        if retarget {
            self.endpoints
                .retain(|_, state| matches!(state, EndpointState::Acknowledged));
            self.state = WriteOpState::Ready;
        } else {
            self.state = WriteOpState::Completed;
        }
    }
}
