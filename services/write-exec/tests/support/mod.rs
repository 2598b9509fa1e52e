#![allow(dead_code)]

use std::{
    collections::{BTreeMap, VecDeque},
    sync::atomic::{AtomicU32, Ordering},
};

use async_trait::async_trait;
use metadata_router::Targeter;
use parking_lot::Mutex;
use schema::{
    Epoch, ErrorCode, Namespace, ShardEndpoint, ShardId, ShardVersion, ShardWriteResponse,
    StaleRoutingInfo, Status, WriteItem,
};
use serde_json::{Value, json};
use write_exec::{Dispatcher, ShardRequest};

pub const SHARD_1: &str = "shard-1";
pub const SHARD_2: &str = "shard-2";

pub fn namespace() -> Namespace {
    Namespace::new("foo", "bar")
}

pub fn version(major: u32) -> ShardVersion {
    ShardVersion::new(major, 200, Epoch(42))
}

pub fn endpoint(shard: &str, major: u32) -> ShardEndpoint {
    ShardEndpoint::new(shard, version(major))
}

pub fn stale_info(received: u32, wanted: u32) -> StaleRoutingInfo {
    StaleRoutingInfo {
        namespace: namespace(),
        received: version(received),
        wanted: Some(version(wanted)),
    }
}

/// Every item of `request` rejected as stale.
pub fn all_stale(request: &ShardRequest) -> ShardWriteResponse {
    let received = request.endpoint.version.major;
    (0..request.payload.items.len()).fold(ShardWriteResponse::ok(0), |response, index| {
        response.with_stale_error(index, stale_info(received, received + 1))
    })
}

pub fn all_ok(request: &ShardRequest) -> ShardWriteResponse {
    ShardWriteResponse::ok(request.payload.items.len() as u64)
}

pub fn status(code: ErrorCode, reason: &str) -> Status {
    Status::new(code, reason)
}

type Handler = Box<dyn FnOnce(&ShardRequest) -> Result<ShardWriteResponse, Status> + Send>;
type Fallback = Box<dyn Fn(&ShardRequest) -> Result<ShardWriteResponse, Status> + Send + Sync>;

enum Reply {
    Respond(Handler),
    Hang,
}

/// Dispatcher answering from per-shard scripts. Once a shard's script runs
/// out, the fallback answers (default: every item succeeds).
pub struct ScriptedDispatcher {
    scripts: Mutex<BTreeMap<ShardId, VecDeque<Reply>>>,
    fallback: Fallback,
    requests: Mutex<Vec<ShardRequest>>,
}

impl Default for ScriptedDispatcher {
    fn default() -> Self {
        Self::with_fallback(|request| Ok(all_ok(request)))
    }
}

impl ScriptedDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fallback(
        fallback: impl Fn(&ShardRequest) -> Result<ShardWriteResponse, Status> + Send + Sync + 'static,
    ) -> Self {
        Self {
            scripts: Mutex::new(BTreeMap::new()),
            fallback: Box::new(fallback),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn respond(
        &self,
        shard: &str,
        handler: impl FnOnce(&ShardRequest) -> Result<ShardWriteResponse, Status> + Send + 'static,
    ) -> &Self {
        self.push(shard, Reply::Respond(Box::new(handler)))
    }

    pub fn reply(&self, shard: &str, response: ShardWriteResponse) -> &Self {
        self.respond(shard, move |_| Ok(response))
    }

    pub fn fail(&self, shard: &str, status: Status) -> &Self {
        self.respond(shard, move |_| Err(status))
    }

    pub fn reply_times(&self, shard: &str, times: usize, response: ShardWriteResponse) -> &Self {
        for _ in 0..times {
            self.reply(shard, response.clone());
        }
        self
    }

    /// The next request to `shard` never completes.
    pub fn hang(&self, shard: &str) -> &Self {
        self.push(shard, Reply::Hang)
    }

    pub fn requests(&self) -> Vec<ShardRequest> {
        self.requests.lock().clone()
    }

    pub fn requests_to(&self, shard: &str) -> Vec<ShardRequest> {
        self.requests
            .lock()
            .iter()
            .filter(|request| request.endpoint.shard_id.as_str() == shard)
            .cloned()
            .collect()
    }

    fn push(&self, shard: &str, reply: Reply) -> &Self {
        self.scripts
            .lock()
            .entry(ShardId::new(shard))
            .or_default()
            .push_back(reply);
        self
    }
}

#[async_trait]
impl Dispatcher for ScriptedDispatcher {
    async fn submit(&self, request: &ShardRequest) -> Result<ShardWriteResponse, Status> {
        self.requests.lock().push(request.clone());
        let next = self
            .scripts
            .lock()
            .get_mut(&request.endpoint.shard_id)
            .and_then(VecDeque::pop_front);
        match next {
            Some(Reply::Respond(handler)) => handler(request),
            Some(Reply::Hang) => std::future::pending().await,
            None => (self.fallback)(request),
        }
    }
}

type Route = Box<dyn Fn(&WriteItem) -> Result<Vec<ShardEndpoint>, Status> + Send + Sync>;

/// Targeter with a fixed routing function. Refreshes report whatever
/// `refresh_changes` is set to.
pub struct MockTargeter {
    namespace: Namespace,
    route: Route,
    refresh_changes: bool,
    stale_notes: Mutex<Vec<(ShardEndpoint, StaleRoutingInfo)>>,
    could_not_target: AtomicU32,
    refreshes: AtomicU32,
}

impl MockTargeter {
    pub fn new(
        route: impl Fn(&WriteItem) -> Result<Vec<ShardEndpoint>, Status> + Send + Sync + 'static,
    ) -> Self {
        Self {
            namespace: namespace(),
            route: Box::new(route),
            refresh_changes: false,
            stale_notes: Mutex::new(Vec::new()),
            could_not_target: AtomicU32::new(0),
            refreshes: AtomicU32::new(0),
        }
    }

    pub fn single_shard() -> Self {
        Self::new(|_| Ok(vec![endpoint(SHARD_1, 100)]))
    }

    /// Every write goes to both shards.
    pub fn two_shards() -> Self {
        Self::new(|_| Ok(vec![endpoint(SHARD_1, 100), endpoint(SHARD_2, 101)]))
    }

    /// Routes on the `"shard"` field; documents without it cannot be targeted.
    pub fn by_shard_field() -> Self {
        Self::new(|item| match item.shard_key_value("shard").and_then(Value::as_str) {
            Some(shard) => Ok(vec![endpoint(shard, 100)]),
            None => Err(status(ErrorCode::ShardKeyNotFound, "no shard field")),
        })
    }

    pub fn with_refresh_changes(mut self, changes: bool) -> Self {
        self.refresh_changes = changes;
        self
    }

    pub fn stale_notes(&self) -> Vec<(ShardEndpoint, StaleRoutingInfo)> {
        self.stale_notes.lock().clone()
    }

    pub fn could_not_target_count(&self) -> u32 {
        self.could_not_target.load(Ordering::SeqCst)
    }

    pub fn refresh_count(&self) -> u32 {
        self.refreshes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Targeter for MockTargeter {
    fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    fn target_operation(&self, item: &WriteItem) -> Result<Vec<ShardEndpoint>, Status> {
        (self.route)(item)
    }

    fn note_stale_response(&self, endpoint: &ShardEndpoint, info: &StaleRoutingInfo) {
        self.stale_notes.lock().push((endpoint.clone(), info.clone()));
    }

    fn note_could_not_target(&self) {
        self.could_not_target.fetch_add(1, Ordering::SeqCst);
    }

    async fn refresh_routing_info(&self) -> Result<bool, Status> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        Ok(self.refresh_changes)
    }
}

pub fn insert_docs(count: usize) -> Vec<WriteItem> {
    (0..count)
        .map(|index| WriteItem::insert(json!({"x": index})))
        .collect()
}

pub fn insert_to(shards: &[&str]) -> Vec<WriteItem> {
    shards
        .iter()
        .enumerate()
        .map(|(index, shard)| WriteItem::insert(json!({"x": index, "shard": shard})))
        .collect()
}
