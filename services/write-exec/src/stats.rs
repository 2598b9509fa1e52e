use std::collections::BTreeSet;

use schema::ShardId;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchWriteExecStats {
    pub num_rounds: u32,
    pub num_target_errors: u32,
    /// Shard responses (not rounds) that reported stale routing metadata.
    pub num_stale_batches: u32,
    pub num_dispatch_retries: u32,
    written_shards: BTreeSet<ShardId>,
}

impl BatchWriteExecStats {
    pub fn note_write_at(&mut self, shard_id: &ShardId) {
        if !self.written_shards.contains(shard_id) {
            self.written_shards.insert(shard_id.clone());
        }
    }

    /// Shards that acknowledged at least one command, e.g. for a follow-up
    /// write-concern wait.
    pub fn written_shards(&self) -> impl Iterator<Item = &ShardId> {
        self.written_shards.iter()
    }

    pub fn metrics_text(&self) -> String {
        format!(
            "# TYPE dash_router_write_rounds gauge\n\
dash_router_write_rounds {}\n\
# TYPE dash_router_write_target_errors gauge\n\
dash_router_write_target_errors {}\n\
# TYPE dash_router_write_stale_batches gauge\n\
dash_router_write_stale_batches {}\n\
# TYPE dash_router_write_dispatch_retries gauge\n\
dash_router_write_dispatch_retries {}\n\
# TYPE dash_router_write_shards_written gauge\n\
dash_router_write_shards_written {}\n",
            self.num_rounds,
            self.num_target_errors,
            self.num_stale_batches,
            self.num_dispatch_retries,
            self.written_shards.len(),
        )
    }
}
