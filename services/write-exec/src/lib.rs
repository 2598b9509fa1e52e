//! Sharded write execution: splits a client write command into per-shard
//! sub-batches, dispatches them in rounds and folds the shard responses back
//! into one client response.

pub mod batch_write_exec;
pub mod batch_write_op;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod stats;
pub mod targeted_batch;
pub mod write_op;

pub use batch_write_exec::{BatchWriteExec, BatchWriteResult};
pub use batch_write_op::BatchWriteOp;
pub use config::WriteExecConfig;
pub use context::OperationContext;
pub use dispatcher::{Dispatcher, ShardRequest};
pub use error::WriteExecError;
pub use stats::BatchWriteExecStats;
pub use targeted_batch::{BatchLimits, TargetedWriteBatch};
pub use write_op::{EndpointState, WriteOp, WriteOpState};
