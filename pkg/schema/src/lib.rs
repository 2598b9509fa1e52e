use std::{fmt, io};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Fixed per-element cost of an item inside a command's write array
/// (element type byte, array index key, terminator).
pub const WRITE_ITEM_OVERHEAD_BYTES: usize = 8;

/// Flag bytes carried next to an update/delete statement (`multi`, `upsert`).
const STATEMENT_FLAG_BYTES: usize = 16;

// ---------------------------------------------------------------------------
// Namespaces
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Namespace {
    pub db: String,
    pub collection: String,
}

impl Namespace {
    pub fn new(db: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            db: db.into(),
            collection: collection.into(),
        }
    }

    /// Parse a `db.collection` string. The collection part may itself contain dots.
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        let (db, collection) = raw
            .split_once('.')
            .ok_or_else(|| ValidationError::InvalidNamespace(raw.to_string()))?;
        if db.trim().is_empty() || collection.trim().is_empty() {
            return Err(ValidationError::InvalidNamespace(raw.to_string()));
        }
        Ok(Self::new(db, collection))
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.db, self.collection)
    }
}

// ---------------------------------------------------------------------------
// Write items
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteKind {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for WriteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WriteKind::Insert => "insert",
            WriteKind::Update => "update",
            WriteKind::Delete => "delete",
        };
        f.write_str(name)
    }
}

/// One item of a client write batch. Documents are opaque to the router.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WriteItem {
    Insert {
        document: Value,
    },
    Update {
        query: Value,
        update: Value,
        multi: bool,
        upsert: bool,
    },
    Delete {
        query: Value,
        multi: bool,
    },
}

impl WriteItem {
    pub fn insert(document: Value) -> Self {
        WriteItem::Insert { document }
    }

    pub fn update(query: Value, update: Value) -> Self {
        WriteItem::Update {
            query,
            update,
            multi: false,
            upsert: false,
        }
    }

    pub fn delete(query: Value) -> Self {
        WriteItem::Delete { query, multi: false }
    }

    pub fn kind(&self) -> WriteKind {
        match self {
            WriteItem::Insert { .. } => WriteKind::Insert,
            WriteItem::Update { .. } => WriteKind::Update,
            WriteItem::Delete { .. } => WriteKind::Delete,
        }
    }

    /// Serialized size of the item as it would appear inside a shard command.
    pub fn estimated_size(&self) -> usize {
        let body = match self {
            WriteItem::Insert { document } => encoded_len(document),
            WriteItem::Update { query, update, .. } => {
                encoded_len(query) + encoded_len(update) + STATEMENT_FLAG_BYTES
            }
            WriteItem::Delete { query, .. } => encoded_len(query) + STATEMENT_FLAG_BYTES,
        };
        body + WRITE_ITEM_OVERHEAD_BYTES
    }

    /// Equality value of `field` in the inserted document or the statement query.
    ///
    /// Operator expressions such as `{"$gt": 5}` do not pin a single value and
    /// yield `None`.
    pub fn shard_key_value(&self, field: &str) -> Option<&Value> {
        let source = match self {
            WriteItem::Insert { document } => document,
            WriteItem::Update { query, .. } | WriteItem::Delete { query, .. } => query,
        };
        let value = source.get(field)?;
        if let Value::Object(map) = value
            && map.keys().any(|key| key.starts_with('$'))
        {
            return None;
        }
        Some(value)
    }
}

struct ByteCounter(usize);

impl io::Write for ByteCounter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0 += buf.len();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn encoded_len(value: &Value) -> usize {
    let mut counter = ByteCounter(0);
    // Writing a Value into an infallible sink cannot fail.
    let _ = serde_json::to_writer(&mut counter, value);
    counter.0
}

// ---------------------------------------------------------------------------
// Client write command
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchedCommandRequest {
    pub namespace: Namespace,
    pub items: Vec<WriteItem>,
    pub ordered: bool,
    pub write_concern: Option<Value>,
    pub bypass_document_validation: bool,
}

impl BatchedCommandRequest {
    /// Write commands are ordered unless the client says otherwise.
    pub fn new(namespace: Namespace, items: Vec<WriteItem>) -> Self {
        Self {
            namespace,
            items,
            ordered: true,
            write_concern: None,
            bypass_document_validation: false,
        }
    }

    pub fn with_ordered(mut self, ordered: bool) -> Self {
        self.ordered = ordered;
        self
    }

    pub fn with_write_concern(mut self, write_concern: Value) -> Self {
        self.write_concern = Some(write_concern);
        self
    }

    pub fn kind(&self) -> Option<WriteKind> {
        self.items.first().map(WriteItem::kind)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_request(self)
    }
}

// ---------------------------------------------------------------------------
// Routing metadata
// ---------------------------------------------------------------------------

/// Identity of one incarnation of a collection. A new epoch means the
/// collection was dropped/recreated or resharded.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Epoch(pub u64);

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Revision of the chunk distribution a command was targeted against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShardVersion {
    pub major: u32,
    pub minor: u32,
    pub epoch: Epoch,
}

impl ShardVersion {
    pub fn new(major: u32, minor: u32, epoch: Epoch) -> Self {
        Self {
            major,
            minor,
            epoch,
        }
    }

    pub fn is_same_epoch(&self, other: &ShardVersion) -> bool {
        self.epoch == other.epoch
    }

    /// Versions from different epochs are not comparable.
    pub fn is_older_than(&self, other: &ShardVersion) -> bool {
        self.is_same_epoch(other) && (self.major, self.minor) < (other.major, other.minor)
    }
}

impl fmt::Display for ShardVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}||{}", self.major, self.minor, self.epoch)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardId(pub String);

impl ShardId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ShardId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShardEndpoint {
    pub shard_id: ShardId,
    pub version: ShardVersion,
}

impl ShardEndpoint {
    pub fn new(shard_id: impl Into<ShardId>, version: ShardVersion) -> Self {
        Self {
            shard_id: shard_id.into(),
            version,
        }
    }
}

/// Attached by a shard to a stale-routing error: the version the command
/// carried and, when known, the version the shard holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaleRoutingInfo {
    pub namespace: Namespace,
    pub received: ShardVersion,
    pub wanted: Option<ShardVersion>,
}

// ---------------------------------------------------------------------------
// Error codes and status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    BadValue,
    HostUnreachable,
    UnknownError,
    ExceededTimeLimit,
    ShardKeyNotFound,
    StaleShardVersion,
    ShardNotFound,
    NoProgressMade,
    NetworkTimeout,
    CallbackCanceled,
    ShutdownInProgress,
    WriteConflict,
    StaleEpoch,
    PrimarySteppedDown,
    NoSuchTransaction,
    DuplicateKey,
    NotPrimary,
    InterruptedAtShutdown,
    Interrupted,
    InterruptedDueToReplStateChange,
    NotPrimaryNoSecondaryOk,
}

const ERROR_CODE_TABLE: &[(ErrorCode, i32, &str)] = &[
    (ErrorCode::BadValue, 2, "BadValue"),
    (ErrorCode::HostUnreachable, 6, "HostUnreachable"),
    (ErrorCode::UnknownError, 8, "UnknownError"),
    (ErrorCode::ExceededTimeLimit, 50, "ExceededTimeLimit"),
    (ErrorCode::ShardKeyNotFound, 61, "ShardKeyNotFound"),
    (ErrorCode::StaleShardVersion, 63, "StaleShardVersion"),
    (ErrorCode::ShardNotFound, 70, "ShardNotFound"),
    (ErrorCode::NoProgressMade, 82, "NoProgressMade"),
    (ErrorCode::NetworkTimeout, 89, "NetworkTimeout"),
    (ErrorCode::CallbackCanceled, 90, "CallbackCanceled"),
    (ErrorCode::ShutdownInProgress, 91, "ShutdownInProgress"),
    (ErrorCode::WriteConflict, 112, "WriteConflict"),
    (ErrorCode::StaleEpoch, 150, "StaleEpoch"),
    (ErrorCode::PrimarySteppedDown, 189, "PrimarySteppedDown"),
    (ErrorCode::NoSuchTransaction, 251, "NoSuchTransaction"),
    (ErrorCode::DuplicateKey, 11000, "DuplicateKey"),
    (ErrorCode::NotPrimary, 10107, "NotWritablePrimary"),
    (ErrorCode::InterruptedAtShutdown, 11600, "InterruptedAtShutdown"),
    (ErrorCode::Interrupted, 11601, "Interrupted"),
    (
        ErrorCode::InterruptedDueToReplStateChange,
        11602,
        "InterruptedDueToReplStateChange",
    ),
    (
        ErrorCode::NotPrimaryNoSecondaryOk,
        13435,
        "NotPrimaryNoSecondaryOk",
    ),
];

impl ErrorCode {
    pub fn code(self) -> i32 {
        ERROR_CODE_TABLE
            .iter()
            .find(|(code, _, _)| *code == self)
            .map(|(_, value, _)| *value)
            .unwrap_or(8)
    }

    pub fn name(self) -> &'static str {
        ERROR_CODE_TABLE
            .iter()
            .find(|(code, _, _)| *code == self)
            .map(|(_, _, name)| *name)
            .unwrap_or("UnknownError")
    }

    pub fn from_code(value: i32) -> Option<Self> {
        ERROR_CODE_TABLE
            .iter()
            .find(|(_, code, _)| *code == value)
            .map(|(code, _, _)| *code)
    }

    pub fn is_stale_shard_version(self) -> bool {
        self == ErrorCode::StaleShardVersion
    }

    pub fn is_stale_epoch(self) -> bool {
        self == ErrorCode::StaleEpoch
    }

    pub fn is_not_primary_error(self) -> bool {
        matches!(
            self,
            ErrorCode::NotPrimary
                | ErrorCode::NotPrimaryNoSecondaryOk
                | ErrorCode::PrimarySteppedDown
                | ErrorCode::InterruptedDueToReplStateChange
        )
    }

    pub fn is_shutdown_error(self) -> bool {
        matches!(
            self,
            ErrorCode::ShutdownInProgress | ErrorCode::InterruptedAtShutdown
        )
    }

    pub fn is_network_error(self) -> bool {
        matches!(self, ErrorCode::HostUnreachable | ErrorCode::NetworkTimeout)
    }

    /// Errors after which re-sending the same statements is safe when the
    /// shard can deduplicate them by retry identity.
    pub fn is_retryable_write_error(self) -> bool {
        self.is_not_primary_error() || self.is_shutdown_error() || self.is_network_error()
    }

    /// Dispatch failures that leave a transaction participant in an unknown state.
    pub fn is_transaction_fatal_dispatch_error(self) -> bool {
        self.is_network_error() || self.is_shutdown_error()
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{code}: {reason}")]
pub struct Status {
    pub code: ErrorCode,
    pub reason: String,
}

impl Status {
    pub fn new(code: ErrorCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    pub fn with_context(&self, context: impl fmt::Display) -> Self {
        Self {
            code: self.code,
            reason: format!("{context} :: caused by :: {}", self.reason),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorLabel {
    TransientTransactionError,
    RetryableWriteError,
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Session plus transaction number; lets shards recognise a re-sent statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RetryIdentity {
    pub session_id: SessionId,
    pub txn_number: i64,
}

impl RetryIdentity {
    pub fn new(session_id: SessionId, txn_number: i64) -> Self {
        Self {
            session_id,
            txn_number,
        }
    }
}

// ---------------------------------------------------------------------------
// Shard sub-batch request/response
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardWriteRequest {
    pub namespace: Namespace,
    pub items: Vec<WriteItem>,
    pub ordered: bool,
    pub shard_version: ShardVersion,
    /// Original batch index of every item, used by shards to deduplicate
    /// re-sent statements of a retryable write.
    pub statement_ids: Vec<usize>,
    pub write_concern: Option<Value>,
    pub bypass_document_validation: bool,
    pub retry_identity: Option<RetryIdentity>,
    pub in_transaction: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpsertedId {
    pub index: usize,
    pub id: Value,
}

/// Item-level error reported by a shard. `index` is local to the sub-batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardWriteError {
    pub index: usize,
    pub status: Status,
    pub stale_info: Option<StaleRoutingInfo>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ShardWriteResponse {
    /// Command-level outcome; `None` means the command itself succeeded.
    pub status: Option<Status>,
    pub n: u64,
    pub n_modified: u64,
    pub upserted: Vec<UpsertedId>,
    pub write_errors: Vec<ShardWriteError>,
    pub write_concern_error: Option<Status>,
    pub error_labels: Vec<ErrorLabel>,
}

impl ShardWriteResponse {
    pub fn ok(n: u64) -> Self {
        Self {
            n,
            ..Self::default()
        }
    }

    pub fn modified(n: u64, n_modified: u64) -> Self {
        Self {
            n,
            n_modified,
            ..Self::default()
        }
    }

    pub fn command_error(status: Status) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn with_write_error(mut self, index: usize, status: Status) -> Self {
        self.write_errors.push(ShardWriteError {
            index,
            status,
            stale_info: None,
        });
        self
    }

    pub fn with_stale_error(mut self, index: usize, info: StaleRoutingInfo) -> Self {
        self.write_errors.push(ShardWriteError {
            index,
            status: Status::new(ErrorCode::StaleShardVersion, "stale shard version"),
            stale_info: Some(info),
        });
        self
    }

    pub fn with_upserted(mut self, index: usize, id: Value) -> Self {
        self.upserted.push(UpsertedId { index, id });
        self
    }

    pub fn with_write_concern_error(mut self, status: Status) -> Self {
        self.write_concern_error = Some(status);
        self
    }

    pub fn with_label(mut self, label: ErrorLabel) -> Self {
        self.error_labels.push(label);
        self
    }

    pub fn has_label(&self, label: ErrorLabel) -> bool {
        self.error_labels.contains(&label)
    }
}

// ---------------------------------------------------------------------------
// Client response
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteErrorDetail {
    pub index: usize,
    pub status: Status,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BatchedCommandResponse {
    pub ok: bool,
    pub n: u64,
    pub n_modified: u64,
    pub upserted: Vec<UpsertedId>,
    /// Sorted by original batch index.
    pub write_errors: Vec<WriteErrorDetail>,
    pub write_concern_error: Option<Status>,
}

impl BatchedCommandResponse {
    pub fn has_write_errors(&self) -> bool {
        !self.write_errors.is_empty()
    }

    pub fn write_error_at(&self, index: usize) -> Option<&WriteErrorDetail> {
        self.write_errors.iter().find(|error| error.index == index)
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("missing field: {0}")]
    MissingField(&'static str),
    #[error("value out of range: {0}")]
    InvalidRange(&'static str),
    #[error("invalid namespace '{0}'")]
    InvalidNamespace(String),
    #[error("write item {index} is an {found} but the command is an {expected}")]
    MixedWriteKinds {
        index: usize,
        expected: WriteKind,
        found: WriteKind,
    },
}

pub fn validate_request(request: &BatchedCommandRequest) -> Result<(), ValidationError> {
    if request.namespace.db.trim().is_empty() || request.namespace.collection.trim().is_empty() {
        return Err(ValidationError::InvalidNamespace(
            request.namespace.to_string(),
        ));
    }
    let Some(expected) = request.kind() else {
        return Err(ValidationError::MissingField("items"));
    };
    for (index, item) in request.items.iter().enumerate() {
        if item.kind() != expected {
            return Err(ValidationError::MixedWriteKinds {
                index,
                expected,
                found: item.kind(),
            });
        }
        if let WriteItem::Insert { document } = item
            && !document.is_object()
        {
            return Err(ValidationError::InvalidRange("items[].document"));
        }
    }
    Ok(())
}
