use std::collections::BTreeMap;

use metadata_router::Targeter;
use schema::{
    BatchedCommandRequest, BatchedCommandResponse, ErrorCode, Namespace, RetryIdentity,
    ShardEndpoint, ShardId, ShardWriteError, ShardWriteRequest, ShardWriteResponse,
    StaleRoutingInfo, Status, UpsertedId, WriteErrorDetail,
};
use serde_json::Value;

use crate::{
    context::OperationContext,
    dispatcher::ShardRequest,
    targeted_batch::{BatchLimits, TargetedBatchBuilder, TargetedWriteBatch},
    write_op::{WriteOp, WriteOpState},
};

/// All ops of one client write command plus the counters folded in from
/// shard responses. Owned by a single `execute_batch` call.
#[derive(Debug)]
pub struct BatchWriteOp {
    namespace: Namespace,
    ordered: bool,
    in_transaction: bool,
    retryable_write: bool,
    retry_identity: Option<RetryIdentity>,
    write_concern: Option<Value>,
    bypass_document_validation: bool,
    ops: Vec<WriteOp>,
    n: u64,
    n_modified: u64,
    upserted: Vec<UpsertedId>,
    write_concern_errors: Vec<(ShardId, Status)>,
}

impl BatchWriteOp {
    pub fn new(request: &BatchedCommandRequest, ctx: &OperationContext) -> Self {
        Self {
            namespace: request.namespace.clone(),
            ordered: request.ordered,
            in_transaction: ctx.is_in_transaction(),
            retryable_write: ctx.is_retryable_write(),
            retry_identity: ctx.retry_identity().copied(),
            write_concern: request.write_concern.clone(),
            bypass_document_validation: request.bypass_document_validation,
            ops: request
                .items
                .iter()
                .cloned()
                .enumerate()
                .map(|(index, item)| WriteOp::new(index, item))
                .collect(),
            n: 0,
            n_modified: 0,
            upserted: Vec::new(),
            write_concern_errors: Vec::new(),
        }
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    pub fn is_ordered(&self) -> bool {
        self.ordered
    }

    /// Group the Ready ops into per-endpoint sub-batches for one round.
    ///
    /// With `record_target_errors` unset the first targeting failure abandons
    /// the whole round and is returned, so the caller can refresh routing
    /// before any op is marked failed. Ops are only moved to Pending once the
    /// round's plan is final.
    pub fn target_batch<T: Targeter + ?Sized>(
        &mut self,
        targeter: &T,
        limits: &BatchLimits,
        record_target_errors: bool,
    ) -> Result<Vec<TargetedWriteBatch>, Status> {
        let mut builders: BTreeMap<ShardId, TargetedBatchBuilder> = BTreeMap::new();
        let mut planned: Vec<(usize, Vec<ShardEndpoint>)> = Vec::new();

        for index in 0..self.ops.len() {
            match self.ops[index].state() {
                WriteOpState::Ready => {}
                WriteOpState::Error if self.ordered => break,
                _ => continue,
            }

            let targeted = targeter
                .target_operation(self.ops[index].item())
                .and_then(|endpoints| {
                    if endpoints.is_empty() {
                        Err(Status::new(
                            ErrorCode::ShardNotFound,
                            format!("no shard found for write op {index} in {}", self.namespace),
                        ))
                    } else {
                        Ok(endpoints)
                    }
                });
            let endpoints = match targeted {
                Ok(endpoints) => self.ops[index].unacknowledged(endpoints),
                Err(status) => {
                    if !record_target_errors {
                        return Err(status);
                    }
                    if self.ordered && !planned.is_empty() {
                        // Send what is planned first; an earlier op may still fail.
                        break;
                    }
                    self.ops[index].note_error(status);
                    if self.ordered {
                        break;
                    }
                    continue;
                }
            };

            // Ordered commands go to one endpoint set per round.
            if self.ordered
                && !planned.is_empty()
                && endpoints
                    .iter()
                    .any(|endpoint| !builders.contains_key(&endpoint.shard_id))
            {
                break;
            }
            let version_conflict = endpoints.iter().any(|endpoint| {
                builders
                    .get(&endpoint.shard_id)
                    .is_some_and(|builder| builder.endpoint().version != endpoint.version)
            });
            if version_conflict {
                break;
            }
            let op_bytes = self.ops[index].estimated_size();
            let too_big = endpoints.iter().any(|endpoint| {
                builders
                    .get(&endpoint.shard_id)
                    .is_some_and(|builder| !builder.fits(limits, op_bytes))
            });
            if too_big {
                break;
            }

            for endpoint in &endpoints {
                builders
                    .entry(endpoint.shard_id.clone())
                    .or_insert_with(|| TargetedBatchBuilder::new(endpoint.clone()))
                    .push(index, op_bytes);
            }
            planned.push((index, endpoints));
        }

        for (index, endpoints) in planned {
            self.ops[index].target(&endpoints);
        }
        Ok(builders
            .into_values()
            .map(TargetedBatchBuilder::build)
            .collect())
    }

    pub fn build_shard_request(&self, batch: &TargetedWriteBatch) -> ShardRequest {
        let items = batch
            .op_indices()
            .iter()
            .map(|index| self.ops[*index].item().clone())
            .collect();
        ShardRequest {
            endpoint: batch.endpoint().clone(),
            payload: ShardWriteRequest {
                namespace: self.namespace.clone(),
                items,
                ordered: self.ordered,
                shard_version: batch.endpoint().version,
                statement_ids: batch.op_indices().to_vec(),
                write_concern: self.write_concern.clone(),
                bypass_document_validation: self.bypass_document_validation,
                retry_identity: self.retry_identity,
                in_transaction: self.in_transaction,
            },
        }
    }

    /// Fold one shard response into the ops of `batch`. Returns the stale
    /// routing reports the response carried; the caller forwards them to the
    /// targeter.
    pub fn note_batch_response(
        &mut self,
        batch: &TargetedWriteBatch,
        response: &ShardWriteResponse,
    ) -> Vec<StaleRoutingInfo> {
        let shard_id = batch.endpoint().shard_id.clone();

        if let Some(status) = &response.status {
            if status.code.is_stale_shard_version() && !self.in_transaction {
                let info = StaleRoutingInfo {
                    namespace: self.namespace.clone(),
                    received: batch.endpoint().version,
                    wanted: None,
                };
                for index in batch.op_indices() {
                    self.ops[*index].note_stale_response(&shard_id, info.clone());
                }
                return vec![info];
            }
            self.note_batch_error(
                batch,
                status.with_context(format!("write results unavailable from {shard_id}")),
            );
            return Vec::new();
        }

        self.n += response.n;
        self.n_modified += response.n_modified;
        for upserted in &response.upserted {
            if let Some(index) = batch.global_index(upserted.index) {
                self.upserted.push(UpsertedId {
                    index,
                    id: upserted.id.clone(),
                });
            }
        }
        if let Some(status) = &response.write_concern_error {
            self.write_concern_errors
                .push((shard_id.clone(), status.clone()));
        }

        let mut item_errors: Vec<&ShardWriteError> = response
            .write_errors
            .iter()
            .filter(|error| error.index < batch.len())
            .collect();
        item_errors.sort_by_key(|error| error.index);
        item_errors.dedup_by_key(|error| error.index);

        if self.in_transaction
            && let Some(first) = item_errors.first()
        {
            // Any statement failure aborts the transaction; nothing is retried.
            self.abort_batch(first.status.clone());
            return Vec::new();
        }

        let mut errors = item_errors.into_iter().peekable();
        let mut stale_infos = Vec::new();
        let mut failed_earlier = false;
        for (local_index, op_index) in batch.op_indices().iter().enumerate() {
            let op = &mut self.ops[*op_index];
            let error = errors.next_if(|error| error.index == local_index);
            match error {
                None if self.ordered && failed_earlier => op.cancel_endpoint(&shard_id),
                None => op.note_response(&shard_id),
                Some(error) => {
                    failed_earlier = true;
                    if error.status.code.is_stale_shard_version() {
                        let info = error.stale_info.clone().unwrap_or_else(|| StaleRoutingInfo {
                            namespace: self.namespace.clone(),
                            received: batch.endpoint().version,
                            wanted: None,
                        });
                        op.note_stale_response(&shard_id, info.clone());
                        stale_infos.push(info);
                    } else if error.status.code.is_stale_epoch() {
                        // The collection was dropped or recreated; terminal.
                        op.note_endpoint_error(&shard_id, error.status.clone());
                    } else if self.retryable_write && error.status.code.is_retryable_write_error()
                    {
                        op.cancel_endpoint(&shard_id);
                    } else {
                        op.note_endpoint_error(&shard_id, error.status.clone());
                    }
                }
            }
        }
        stale_infos
    }

    /// The whole sub-batch failed without a usable response. Ordered commands
    /// only fail their first op; the rest go back to Ready.
    pub fn note_batch_error(&mut self, batch: &TargetedWriteBatch, status: Status) {
        if self.in_transaction {
            self.abort_batch(status);
            return;
        }
        let shard_id = batch.endpoint().shard_id.clone();
        for (local_index, op_index) in batch.op_indices().iter().enumerate() {
            let op = &mut self.ops[*op_index];
            if self.ordered && local_index > 0 {
                op.cancel_endpoint(&shard_id);
            } else {
                op.note_endpoint_error(&shard_id, status.clone());
            }
        }
    }

    /// Fail every op that has not finished yet.
    pub fn abort_batch(&mut self, status: Status) {
        for op in &mut self.ops {
            if !op.is_finished() {
                op.note_error(status.clone());
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        for op in &self.ops {
            if self.ordered && op.state() == WriteOpState::Error {
                return true;
            }
            if !op.is_finished() {
                return false;
            }
        }
        true
    }

    pub fn num_write_ops_in(&self, state: WriteOpState) -> usize {
        self.ops.iter().filter(|op| op.state() == state).count()
    }

    pub fn build_client_response(&self) -> BatchedCommandResponse {
        let mut write_errors = Vec::new();
        for op in &self.ops {
            if let Some(status) = op.error() {
                write_errors.push(WriteErrorDetail {
                    index: op.index(),
                    status: status.clone(),
                });
                if self.ordered {
                    break;
                }
            }
        }

        let mut upserted = self.upserted.clone();
        upserted.sort_by_key(|entry| entry.index);

        BatchedCommandResponse {
            ok: true,
            n: self.n,
            n_modified: self.n_modified,
            upserted,
            write_errors,
            write_concern_error: merge_write_concern_errors(&self.write_concern_errors),
        }
    }
}

fn merge_write_concern_errors(errors: &[(ShardId, Status)]) -> Option<Status> {
    match errors {
        [] => None,
        [(_, status)] => Some(status.clone()),
        [(_, first), ..] => {
            let reason = errors
                .iter()
                .map(|(shard_id, status)| format!("{shard_id}: {}", status.reason))
                .collect::<Vec<_>>()
                .join(" :: and :: ");
            Some(Status::new(
                first.code,
                format!("multiple errors reported : {reason}"),
            ))
        }
    }
}

/// Status applied to every unfinished op when rounds stop making progress.
pub(crate) fn no_progress_status(namespace: &Namespace, rounds: u32, completed: usize) -> Status {
    Status::new(
        ErrorCode::NoProgressMade,
        format!(
            "no progress was made executing batch write op in {namespace} after {rounds} rounds ({completed} ops completed)"
        ),
    )
}
