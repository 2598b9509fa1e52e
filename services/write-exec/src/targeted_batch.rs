use schema::ShardEndpoint;

/// Per-command caps a sub-batch must stay within.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLimits {
    pub max_items: usize,
    pub max_bytes: usize,
}

/// The ops of one round addressed to one shard endpoint, in original order.
/// Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetedWriteBatch {
    endpoint: ShardEndpoint,
    op_indices: Vec<usize>,
    estimated_bytes: usize,
}

impl TargetedWriteBatch {
    pub fn endpoint(&self) -> &ShardEndpoint {
        &self.endpoint
    }

    /// Global op indices; position in this slice is the shard-local index.
    pub fn op_indices(&self) -> &[usize] {
        &self.op_indices
    }

    pub fn len(&self) -> usize {
        self.op_indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.op_indices.is_empty()
    }

    pub fn estimated_bytes(&self) -> usize {
        self.estimated_bytes
    }

    pub fn global_index(&self, local_index: usize) -> Option<usize> {
        self.op_indices.get(local_index).copied()
    }
}

#[derive(Debug, Clone)]
pub(crate) struct TargetedBatchBuilder {
    endpoint: ShardEndpoint,
    op_indices: Vec<usize>,
    estimated_bytes: usize,
}

impl TargetedBatchBuilder {
    pub(crate) fn new(endpoint: ShardEndpoint) -> Self {
        Self {
            endpoint,
            op_indices: Vec::new(),
            estimated_bytes: 0,
        }
    }

    pub(crate) fn endpoint(&self) -> &ShardEndpoint {
        &self.endpoint
    }

    /// An empty builder accepts any op, so an oversized item still goes out
    /// alone instead of stalling the batch.
    pub(crate) fn fits(&self, limits: &BatchLimits, op_bytes: usize) -> bool {
        if self.op_indices.is_empty() {
            return true;
        }
        self.op_indices.len() < limits.max_items
            && self.estimated_bytes.saturating_add(op_bytes) <= limits.max_bytes
    }

    pub(crate) fn push(&mut self, op_index: usize, op_bytes: usize) {
        self.op_indices.push(op_index);
        self.estimated_bytes = self.estimated_bytes.saturating_add(op_bytes);
    }

    pub(crate) fn build(self) -> TargetedWriteBatch {
        TargetedWriteBatch {
            endpoint: self.endpoint,
            op_indices: self.op_indices,
            estimated_bytes: self.estimated_bytes,
        }
    }
}
