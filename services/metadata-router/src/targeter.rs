use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use schema::{
    ErrorCode, Namespace, ShardEndpoint, ShardId, ShardVersion, StaleRoutingInfo, Status,
    WriteItem,
};
use serde_json::Value;

use crate::{
    PlacementRouteError, RouterConfig, ShardPlacement, build_ring, env_with_fallback,
    load_shard_placements_csv, parse_shard_placements_csv, route_on_ring,
    shard_ids_from_placements,
};

/// Resolves writes against one namespace to the shard endpoints that own them.
///
/// Implementations are shared by every in-flight sub-batch of a round, so all
/// methods take `&self`.
#[async_trait]
pub trait Targeter: Send + Sync {
    fn namespace(&self) -> &Namespace;

    /// Endpoints a write must be sent to, tagged with the version the routing
    /// decision was made against.
    fn target_operation(&self, item: &WriteItem) -> Result<Vec<ShardEndpoint>, Status>;

    /// Record that `endpoint` rejected a command because its version was stale.
    fn note_stale_response(&self, endpoint: &ShardEndpoint, info: &StaleRoutingInfo);

    /// Record that the last targeting pass failed.
    fn note_could_not_target(&self);

    /// Best-effort reload of routing metadata. Returns whether anything changed;
    /// `Ok(false)` is a normal outcome.
    async fn refresh_routing_info(&self) -> Result<bool, Status>;
}

#[derive(Debug)]
struct PlacementTable {
    placements: BTreeMap<ShardId, ShardVersion>,
    ring: BTreeMap<u64, ShardId>,
}

#[derive(Debug, Default)]
struct PendingRefresh {
    stale: BTreeMap<ShardId, Option<ShardVersion>>,
    could_not_target: bool,
}

/// [`Targeter`] backed by the placement table and the consistent-hash ring.
#[derive(Debug)]
pub struct PlacementTargeter {
    namespace: Namespace,
    config: RouterConfig,
    table: RwLock<PlacementTable>,
    pending: Mutex<PendingRefresh>,
    placement_file: Option<PathBuf>,
}

impl PlacementTargeter {
    pub fn new(namespace: Namespace, config: RouterConfig, placements: &[ShardPlacement]) -> Self {
        let table = build_table(&namespace, &config, placements);
        Self {
            namespace,
            config,
            table: RwLock::new(table),
            pending: Mutex::new(PendingRefresh::default()),
            placement_file: None,
        }
    }

    pub fn from_placement_file(
        namespace: Namespace,
        config: RouterConfig,
        placement_file: &Path,
    ) -> Result<Self, String> {
        let placements = load_shard_placements_csv(placement_file)?;
        if !placements.iter().any(|placement| placement.namespace == namespace) {
            return Err(format!(
                "placement file '{}' has no placement records for '{namespace}'",
                placement_file.display()
            ));
        }
        let mut targeter = Self::new(namespace, config, &placements);
        targeter.placement_file = Some(placement_file.to_path_buf());
        Ok(targeter)
    }

    /// Build from `DASH_ROUTER_PLACEMENT_FILE`; `Ok(None)` when unset.
    pub fn from_env(namespace: Namespace) -> Result<Option<Self>, String> {
        let Some(placement_file) =
            env_with_fallback("DASH_ROUTER_PLACEMENT_FILE", "EME_ROUTER_PLACEMENT_FILE")
        else {
            return Ok(None);
        };
        Self::from_placement_file(namespace, RouterConfig::from_env(), Path::new(&placement_file))
            .map(Some)
    }

    /// Replace the cached placements. Returns whether any shard version changed.
    pub fn install_placements(&self, placements: &[ShardPlacement]) -> bool {
        let next = build_table(&self.namespace, &self.config, placements);
        let mut table = self.table.write();
        let changed = table.placements != next.placements;
        *table = next;
        changed
    }

    pub fn placements(&self) -> Vec<ShardPlacement> {
        self.table
            .read()
            .placements
            .iter()
            .map(|(shard_id, version)| ShardPlacement {
                namespace: self.namespace.clone(),
                shard_id: shard_id.clone(),
                version: *version,
            })
            .collect()
    }

    pub fn needs_refresh(&self) -> bool {
        let pending = self.pending.lock();
        pending.could_not_target || !pending.stale.is_empty()
    }

    fn endpoint_for(
        &self,
        table: &PlacementTable,
        shard_id: &ShardId,
    ) -> Result<ShardEndpoint, PlacementRouteError> {
        table
            .placements
            .get(shard_id)
            .map(|version| ShardEndpoint {
                shard_id: shard_id.clone(),
                version: *version,
            })
            .ok_or_else(|| PlacementRouteError::PlacementNotFound {
                namespace: self.namespace.clone(),
                shard_id: shard_id.clone(),
            })
    }
}

#[async_trait]
impl Targeter for PlacementTargeter {
    fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    fn target_operation(&self, item: &WriteItem) -> Result<Vec<ShardEndpoint>, Status> {
        let table = self.table.read();
        if table.placements.is_empty() {
            return Err(PlacementRouteError::NoShardsForNamespace {
                namespace: self.namespace.clone(),
            }
            .into());
        }

        if let Some(key) = item.shard_key_value(&self.config.shard_key_field) {
            let shard_id = route_on_ring(&table.ring, &self.namespace, &shard_key_string(key))
                .ok_or_else(|| PlacementRouteError::NoShardsForNamespace {
                    namespace: self.namespace.clone(),
                })?;
            return Ok(vec![self.endpoint_for(&table, &shard_id)?]);
        }

        if matches!(item, WriteItem::Insert { .. }) {
            return Err(PlacementRouteError::ShardKeyNotFound {
                namespace: self.namespace.clone(),
                field: self.config.shard_key_field.clone(),
            }
            .into());
        }

        // Statements that do not pin the shard key go to every owning shard.
        Ok(table
            .placements
            .iter()
            .map(|(shard_id, version)| ShardEndpoint {
                shard_id: shard_id.clone(),
                version: *version,
            })
            .collect())
    }

    fn note_stale_response(&self, endpoint: &ShardEndpoint, info: &StaleRoutingInfo) {
        tracing::debug!(
            namespace = %self.namespace,
            shard = %endpoint.shard_id,
            received = %info.received,
            wanted = ?info.wanted.map(|version| version.to_string()),
            "noted stale routing response"
        );
        self.pending
            .lock()
            .stale
            .insert(endpoint.shard_id.clone(), info.wanted);
    }

    fn note_could_not_target(&self) {
        self.pending.lock().could_not_target = true;
    }

    async fn refresh_routing_info(&self) -> Result<bool, Status> {
        if !self.needs_refresh() {
            return Ok(false);
        }
        let Some(placement_file) = self.placement_file.as_ref() else {
            *self.pending.lock() = PendingRefresh::default();
            return Ok(false);
        };

        let raw = tokio::fs::read_to_string(placement_file)
            .await
            .map_err(|err| {
                Status::new(
                    ErrorCode::UnknownError,
                    format!(
                        "failed to read placement file '{}': {err}",
                        placement_file.display()
                    ),
                )
            })?;
        let placements = parse_shard_placements_csv(&raw)
            .map_err(|reason| Status::new(ErrorCode::UnknownError, reason))?;
        // Notes stay pending until a reload succeeds.
        let pending = std::mem::take(&mut *self.pending.lock());
        let changed = self.install_placements(&placements);
        tracing::debug!(
            namespace = %self.namespace,
            changed,
            stale_shards = pending.stale.len(),
            "refreshed routing info"
        );
        Ok(changed)
    }
}

fn build_table(
    namespace: &Namespace,
    config: &RouterConfig,
    placements: &[ShardPlacement],
) -> PlacementTable {
    let owned: Vec<ShardPlacement> = placements
        .iter()
        .filter(|placement| &placement.namespace == namespace)
        .cloned()
        .collect();
    let ring = build_ring(&shard_ids_from_placements(&owned), config.virtual_nodes_per_shard);
    PlacementTable {
        placements: owned
            .into_iter()
            .map(|placement| (placement.shard_id, placement.version))
            .collect(),
        ring,
    }
}

fn shard_key_string(value: &Value) -> String {
    match value {
        Value::String(raw) => raw.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use schema::Epoch;
    use serde_json::json;

    use super::*;

    fn namespace() -> Namespace {
        Namespace::new("foo", "bar")
    }

    fn placement(shard: &str, major: u32) -> ShardPlacement {
        ShardPlacement {
            namespace: namespace(),
            shard_id: ShardId::new(shard),
            version: ShardVersion::new(major, 0, Epoch(7)),
        }
    }

    fn two_shard_targeter() -> PlacementTargeter {
        PlacementTargeter::new(
            namespace(),
            RouterConfig {
                shard_key_field: "sk".to_string(),
                virtual_nodes_per_shard: 16,
            },
            &[placement("shard-a", 1), placement("shard-b", 1)],
        )
    }

    #[test]
    fn targets_keyed_insert_to_single_shard() {
        let targeter = two_shard_targeter();
        let endpoints = targeter
            .target_operation(&WriteItem::insert(json!({"sk": 10, "x": 1})))
            .expect("insert should target");
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].version.major, 1);
    }

    #[test]
    fn broadcasts_statements_without_shard_key() {
        let targeter = two_shard_targeter();
        let endpoints = targeter
            .target_operation(&WriteItem::Update {
                query: json!({"x": {"$gt": 1}}),
                update: json!({"$set": {"y": 2}}),
                multi: true,
                upsert: false,
            })
            .expect("multi update should target");
        let shards: Vec<&str> = endpoints.iter().map(|e| e.shard_id.as_str()).collect();
        assert_eq!(shards, vec!["shard-a", "shard-b"]);
    }

    #[test]
    fn insert_without_shard_key_is_a_targeting_error() {
        let targeter = two_shard_targeter();
        let err = targeter
            .target_operation(&WriteItem::insert(json!({"x": 1})))
            .expect_err("insert without shard key should fail");
        assert_eq!(err.code, ErrorCode::ShardKeyNotFound);
    }

    #[test]
    fn targeting_fails_without_placements_for_namespace() {
        let targeter = PlacementTargeter::new(
            Namespace::new("other", "coll"),
            RouterConfig::default(),
            &[placement("shard-a", 1)],
        );
        let err = targeter
            .target_operation(&WriteItem::insert(json!({"_id": 1})))
            .expect_err("no placements for namespace");
        assert_eq!(err.code, ErrorCode::ShardNotFound);
    }

    #[test]
    fn install_placements_reports_version_changes() {
        let targeter = two_shard_targeter();
        assert!(!targeter.install_placements(&[placement("shard-a", 1), placement("shard-b", 1)]));
        assert!(targeter.install_placements(&[placement("shard-a", 2), placement("shard-b", 1)]));
        assert_eq!(targeter.placements()[0].version.major, 2);
    }

    #[tokio::test]
    async fn refresh_without_source_reports_no_change() {
        let targeter = two_shard_targeter();
        let endpoint = ShardEndpoint::new("shard-a", ShardVersion::new(1, 0, Epoch(7)));
        targeter.note_stale_response(
            &endpoint,
            &StaleRoutingInfo {
                namespace: namespace(),
                received: endpoint.version,
                wanted: Some(ShardVersion::new(2, 0, Epoch(7))),
            },
        );
        assert!(targeter.needs_refresh());
        assert!(!targeter.refresh_routing_info().await.expect("refresh"));
        assert!(!targeter.needs_refresh());
    }

    #[tokio::test]
    async fn refresh_reloads_placement_file_after_stale_note() {
        let mut path = std::env::temp_dir();
        path.push(format!("dash-router-placements-{}.csv", std::process::id()));
        std::fs::write(&path, "foo.bar,shard-a,7,1,0\nfoo.bar,shard-b,7,1,0\n")
            .expect("write placement file");
        let targeter =
            PlacementTargeter::from_placement_file(namespace(), RouterConfig::default(), &path)
                .expect("targeter should load");

        // Nothing stale yet: refresh is a no-op even though the file changed.
        std::fs::write(&path, "foo.bar,shard-a,7,2,0\nfoo.bar,shard-b,7,1,0\n")
            .expect("rewrite placement file");
        assert!(!targeter.refresh_routing_info().await.expect("refresh"));

        targeter.note_could_not_target();
        assert!(targeter.refresh_routing_info().await.expect("refresh"));
        assert_eq!(targeter.placements()[0].version.major, 2);
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn failed_reload_keeps_refresh_pending() {
        let mut path = std::env::temp_dir();
        path.push(format!("dash-router-placements-reload-{}.csv", std::process::id()));
        std::fs::write(&path, "foo.bar,shard-a,7,1,0\n").expect("write placement file");
        let targeter =
            PlacementTargeter::from_placement_file(namespace(), RouterConfig::default(), &path)
                .expect("targeter should load");
        targeter.note_could_not_target();

        std::fs::write(&path, "foo.bar,shard-a,not-an-epoch,1,0\n")
            .expect("rewrite placement file");
        assert!(targeter.refresh_routing_info().await.is_err());
        assert!(targeter.needs_refresh());

        std::fs::write(&path, "foo.bar,shard-a,7,2,0\n").expect("rewrite placement file");
        assert!(targeter.refresh_routing_info().await.expect("refresh"));
        assert!(!targeter.needs_refresh());
        let _ = std::fs::remove_file(&path);
    }
}
