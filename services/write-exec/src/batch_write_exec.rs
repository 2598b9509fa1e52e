use futures::{StreamExt, stream::FuturesUnordered};
use metadata_router::Targeter;
use schema::{
    BatchedCommandRequest, BatchedCommandResponse, ErrorCode, ErrorLabel, ShardWriteResponse,
    Status,
};

use crate::{
    batch_write_op::{BatchWriteOp, no_progress_status},
    config::WriteExecConfig,
    context::OperationContext,
    dispatcher::{Dispatcher, ShardRequest},
    error::WriteExecError,
    stats::BatchWriteExecStats,
    targeted_batch::TargetedWriteBatch,
    write_op::WriteOpState,
};

#[derive(Debug, Clone, PartialEq)]
pub struct BatchWriteResult {
    pub response: BatchedCommandResponse,
    pub stats: BatchWriteExecStats,
}

/// Drives a client write command to completion across shards in rounds.
///
/// Each round targets the Ready ops, sends one sub-batch per endpoint
/// concurrently and applies every response before the next round starts.
/// Stale routing triggers a targeter refresh between rounds; rounds that
/// neither complete an op nor change routing count towards the no-progress
/// limit.
#[derive(Debug, Clone, Default)]
pub struct BatchWriteExec {
    config: WriteExecConfig,
}

struct DispatchedBatch {
    batch: TargetedWriteBatch,
    result: Result<ShardWriteResponse, Status>,
    retries: u32,
}

enum RoundOutcome {
    Applied,
    Interrupted,
}

impl BatchWriteExec {
    pub fn new(config: WriteExecConfig) -> Self {
        Self { config }
    }

    pub fn from_env() -> Self {
        Self::new(WriteExecConfig::from_env())
    }

    pub fn config(&self) -> &WriteExecConfig {
        &self.config
    }

    /// Execute `request` against the shards `targeter` resolves to.
    ///
    /// Item failures are reported in the response's write errors. `Err` is
    /// only returned for malformed requests and aborted transactions.
    #[tracing::instrument(
        skip_all,
        fields(namespace = %request.namespace, items = request.len(), ordered = request.ordered)
    )]
    pub async fn execute_batch<T, D>(
        &self,
        ctx: &OperationContext,
        targeter: &T,
        dispatcher: &D,
        request: &BatchedCommandRequest,
    ) -> Result<BatchWriteResult, WriteExecError>
    where
        T: Targeter + ?Sized,
        D: Dispatcher + ?Sized,
    {
        request.validate()?;
        if targeter.namespace() != &request.namespace {
            return Err(WriteExecError::NamespaceMismatch {
                request: request.namespace.clone(),
                targeter: targeter.namespace().clone(),
            });
        }

        let limits = self.config.batch_limits();
        let mut batch_op = BatchWriteOp::new(request, ctx);
        let mut stats = BatchWriteExecStats::default();
        let mut refreshed_targeter = false;
        let mut rounds_without_progress = 0u32;

        while !batch_op.is_finished() {
            if let Some(status) = ctx.check_for_interrupt() {
                tracing::debug!(code = %status.code, "write interrupted between rounds");
                batch_op.abort_batch(status);
                break;
            }

            stats.num_rounds += 1;
            let completed_before = batch_op.num_write_ops_in(WriteOpState::Completed);

            let batches = match batch_op.target_batch(targeter, &limits, refreshed_targeter) {
                Ok(batches) => batches,
                Err(status) => {
                    tracing::debug!(
                        round = stats.num_rounds,
                        error = %status,
                        "could not target write batch, refreshing routing info"
                    );
                    targeter.note_could_not_target();
                    refreshed_targeter = true;
                    stats.num_target_errors += 1;
                    Vec::new()
                }
            };
            tracing::debug!(
                round = stats.num_rounds,
                batches = batches.len(),
                "dispatching write round"
            );

            let outcome = self
                .dispatch_round(ctx, targeter, dispatcher, &mut batch_op, &mut stats, batches)
                .await?;
            if matches!(outcome, RoundOutcome::Interrupted) || batch_op.is_finished() {
                break;
            }

            let routing_changed = match targeter.refresh_routing_info().await {
                Ok(changed) => changed,
                Err(status) => {
                    tracing::warn!(error = %status, "failed to refresh routing info");
                    false
                }
            };
            let completed_after = batch_op.num_write_ops_in(WriteOpState::Completed);
            if !routing_changed && completed_after == completed_before {
                rounds_without_progress += 1;
            } else {
                rounds_without_progress = 0;
            }

            if rounds_without_progress > self.config.max_rounds_without_progress {
                tracing::warn!(
                    rounds = stats.num_rounds,
                    completed = completed_after,
                    "no progress made executing write batch"
                );
                batch_op.abort_batch(no_progress_status(
                    &request.namespace,
                    stats.num_rounds,
                    completed_after,
                ));
                break;
            }
        }

        let response = batch_op.build_client_response();
        tracing::debug!(
            rounds = stats.num_rounds,
            stale_batches = stats.num_stale_batches,
            n = response.n,
            write_errors = response.write_errors.len(),
            "finished write batch"
        );
        Ok(BatchWriteResult { response, stats })
    }

    async fn dispatch_round<T, D>(
        &self,
        ctx: &OperationContext,
        targeter: &T,
        dispatcher: &D,
        batch_op: &mut BatchWriteOp,
        stats: &mut BatchWriteExecStats,
        batches: Vec<TargetedWriteBatch>,
    ) -> Result<RoundOutcome, WriteExecError>
    where
        T: Targeter + ?Sized,
        D: Dispatcher + ?Sized,
    {
        let mut in_flight = FuturesUnordered::new();
        for batch in batches {
            let request = batch_op.build_shard_request(&batch);
            in_flight.push(self.submit_with_retries(ctx, dispatcher, batch, request));
        }

        loop {
            tokio::select! {
                biased;
                status = ctx.interrupted() => {
                    tracing::debug!(
                        code = %status.code,
                        in_flight = in_flight.len(),
                        "write interrupted during dispatch"
                    );
                    batch_op.abort_batch(status);
                    return Ok(RoundOutcome::Interrupted);
                }
                next = in_flight.next() => match next {
                    Some(dispatched) => {
                        self.apply_dispatched(ctx, targeter, batch_op, stats, dispatched)?
                    }
                    None => return Ok(RoundOutcome::Applied),
                },
            }
        }
    }

    /// Send one sub-batch, re-sending it within the round while the shard
    /// answers with a retryable error and the write may be safely repeated.
    async fn submit_with_retries<D>(
        &self,
        ctx: &OperationContext,
        dispatcher: &D,
        batch: TargetedWriteBatch,
        request: ShardRequest,
    ) -> DispatchedBatch
    where
        D: Dispatcher + ?Sized,
    {
        let mut attempt = 1u32;
        loop {
            let result = dispatcher.submit(&request).await;
            let retryable = match &result {
                Ok(response) => response.status.as_ref().is_some_and(|status| {
                    status.code.is_retryable_write_error()
                        || response.has_label(ErrorLabel::RetryableWriteError)
                }),
                Err(status) => status.code.is_retryable_write_error(),
            };
            if !retryable
                || !ctx.is_retryable_write()
                || attempt >= self.config.max_dispatch_attempts
            {
                return DispatchedBatch {
                    batch,
                    result,
                    retries: attempt - 1,
                };
            }
            tracing::debug!(
                shard = %request.endpoint.shard_id,
                attempt,
                "retrying write batch after retryable error"
            );
            attempt += 1;
        }
    }

    fn apply_dispatched<T>(
        &self,
        ctx: &OperationContext,
        targeter: &T,
        batch_op: &mut BatchWriteOp,
        stats: &mut BatchWriteExecStats,
        dispatched: DispatchedBatch,
    ) -> Result<(), WriteExecError>
    where
        T: Targeter + ?Sized,
    {
        let DispatchedBatch {
            batch,
            result,
            retries,
        } = dispatched;
        stats.num_dispatch_retries += retries;
        let shard_id = &batch.endpoint().shard_id;

        match result {
            Ok(response) => {
                if ctx.is_in_transaction()
                    && response.has_label(ErrorLabel::TransientTransactionError)
                {
                    return Err(WriteExecError::TransactionAborted(transient_status(
                        &response,
                    )));
                }
                if response.status.is_none() {
                    stats.note_write_at(shard_id);
                }
                let stale = batch_op.note_batch_response(&batch, &response);
                if !stale.is_empty() {
                    stats.num_stale_batches += 1;
                    for info in &stale {
                        targeter.note_stale_response(batch.endpoint(), info);
                    }
                }
            }
            Err(status) => {
                if ctx.is_in_transaction() && status.code.is_transaction_fatal_dispatch_error() {
                    return Err(WriteExecError::TransactionAborted(status));
                }
                tracing::warn!(
                    shard = %shard_id,
                    error = %status,
                    "failed to dispatch write batch"
                );
                batch_op.note_batch_error(
                    &batch,
                    status.with_context(format!("write results unavailable from {shard_id}")),
                );
            }
        }
        Ok(())
    }
}

fn transient_status(response: &ShardWriteResponse) -> Status {
    response
        .status
        .clone()
        .or_else(|| response.write_errors.first().map(|error| error.status.clone()))
        .unwrap_or_else(|| {
            Status::new(
                ErrorCode::NoSuchTransaction,
                "shard reported a transient transaction error",
            )
        })
}
