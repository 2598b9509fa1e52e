mod targeter;

use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    path::Path,
    str::FromStr,
};

use schema::{Epoch, ErrorCode, Namespace, ShardId, ShardVersion, Status};

pub use targeter::{PlacementTargeter, Targeter};

const DEFAULT_VIRTUAL_NODES_PER_SHARD: u32 = 64;
const DEFAULT_SHARD_KEY_FIELD: &str = "_id";

/// Ownership record: which shard holds data for a namespace, at which version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardPlacement {
    pub namespace: Namespace,
    pub shard_id: ShardId,
    pub version: ShardVersion,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterConfig {
    pub shard_key_field: String,
    pub virtual_nodes_per_shard: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlacementRouteError {
    #[error("no placement for namespace '{namespace}' on shard '{shard_id}'")]
    PlacementNotFound {
        namespace: Namespace,
        shard_id: ShardId,
    },
    #[error("no shard owns namespace '{namespace}'")]
    NoShardsForNamespace { namespace: Namespace },
    #[error("write for '{namespace}' does not contain shard key field '{field}'")]
    ShardKeyNotFound { namespace: Namespace, field: String },
}

impl From<PlacementRouteError> for Status {
    fn from(value: PlacementRouteError) -> Self {
        let code = match &value {
            PlacementRouteError::ShardKeyNotFound { .. } => ErrorCode::ShardKeyNotFound,
            PlacementRouteError::PlacementNotFound { .. }
            | PlacementRouteError::NoShardsForNamespace { .. } => ErrorCode::ShardNotFound,
        };
        Status::new(code, value.to_string())
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            shard_key_field: DEFAULT_SHARD_KEY_FIELD.to_string(),
            virtual_nodes_per_shard: DEFAULT_VIRTUAL_NODES_PER_SHARD,
        }
    }
}

impl RouterConfig {
    pub fn from_env() -> Self {
        let shard_key_field = env_with_fallback(
            "DASH_ROUTER_SHARD_KEY_FIELD",
            "EME_ROUTER_SHARD_KEY_FIELD",
        )
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| DEFAULT_SHARD_KEY_FIELD.to_string());
        let virtual_nodes_per_shard = parse_env_first::<u32>(&[
            "DASH_ROUTER_VIRTUAL_NODES_PER_SHARD",
            "EME_ROUTER_VIRTUAL_NODES_PER_SHARD",
        ])
        .filter(|value| *value > 0)
        .unwrap_or(DEFAULT_VIRTUAL_NODES_PER_SHARD);
        Self {
            shard_key_field,
            virtual_nodes_per_shard,
        }
    }
}

/// Route a shard-key value onto the ring built from `shard_ids`.
pub fn route_to_shard(
    namespace: &Namespace,
    shard_key: &str,
    shard_ids: &[ShardId],
    virtual_nodes_per_shard: u32,
) -> Option<ShardId> {
    let ring = build_ring(shard_ids, virtual_nodes_per_shard);
    route_on_ring(&ring, namespace, shard_key)
}

pub(crate) fn route_on_ring(
    ring: &BTreeMap<u64, ShardId>,
    namespace: &Namespace,
    shard_key: &str,
) -> Option<ShardId> {
    let target = hash_key(&format!("{namespace}|{shard_key}"));
    ring.range(target..)
        .chain(ring.range(..target))
        .map(|(_, shard_id)| shard_id.clone())
        .next()
}

pub(crate) fn build_ring(shard_ids: &[ShardId], virtual_nodes_per_shard: u32) -> BTreeMap<u64, ShardId> {
    let mut ring = BTreeMap::new();
    let vnodes = virtual_nodes_per_shard.max(1);
    for shard_id in shard_ids {
        for vnode in 0..vnodes {
            let key = format!("shard:{shard_id}:vn:{vnode}");
            ring.insert(hash_key(&key), shard_id.clone());
        }
    }
    ring
}

pub fn load_shard_placements_csv(path: &Path) -> Result<Vec<ShardPlacement>, String> {
    let raw = fs::read_to_string(path)
        .map_err(|err| format!("failed to read placement file '{}': {err}", path.display()))?;
    parse_shard_placements_csv(&raw)
}

/// Parse `namespace,shard_id,epoch,major,minor` rows. Blank lines and `#`
/// comments are skipped. A shard may appear once per namespace and all rows
/// of a namespace must agree on the epoch.
pub fn parse_shard_placements_csv(input: &str) -> Result<Vec<ShardPlacement>, String> {
    let mut grouped: BTreeMap<(Namespace, ShardId), ShardPlacement> = BTreeMap::new();
    let mut epochs: BTreeMap<Namespace, Epoch> = BTreeMap::new();
    for (line_index, line) in input.lines().enumerate() {
        let line_no = line_index + 1;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let columns: Vec<&str> = line.split(',').map(str::trim).collect();
        if columns.len() != 5 {
            return Err(format!(
                "invalid placement CSV line {line_no}: expected 5 columns (namespace,shard_id,epoch,major,minor)"
            ));
        }
        let namespace = Namespace::parse(columns[0])
            .map_err(|err| format!("invalid placement CSV line {line_no}: {err}"))?;
        let shard_id = columns[1];
        if shard_id.is_empty() {
            return Err(format!(
                "invalid placement CSV line {line_no}: shard_id must not be empty"
            ));
        }
        let epoch = columns[2]
            .parse::<u64>()
            .map(Epoch)
            .map_err(|_| format!("invalid placement CSV line {line_no}: epoch must be a u64"))?;
        let major = columns[3]
            .parse::<u32>()
            .map_err(|_| format!("invalid placement CSV line {line_no}: major must be a u32"))?;
        let minor = columns[4]
            .parse::<u32>()
            .map_err(|_| format!("invalid placement CSV line {line_no}: minor must be a u32"))?;

        let known_epoch = *epochs.entry(namespace.clone()).or_insert(epoch);
        if known_epoch != epoch {
            return Err(format!(
                "invalid placement CSV line {line_no}: epoch mismatch for namespace '{namespace}'"
            ));
        }
        let key = (namespace.clone(), ShardId::new(shard_id));
        if grouped.contains_key(&key) {
            return Err(format!(
                "invalid placement CSV line {line_no}: duplicate shard '{shard_id}' for namespace '{namespace}'"
            ));
        }
        grouped.insert(
            key,
            ShardPlacement {
                namespace,
                shard_id: ShardId::new(shard_id),
                version: ShardVersion::new(major, minor, epoch),
            },
        );
    }
    Ok(grouped.into_values().collect())
}

pub fn shard_ids_from_placements(placements: &[ShardPlacement]) -> Vec<ShardId> {
    let mut shard_ids = BTreeSet::new();
    for placement in placements {
        shard_ids.insert(placement.shard_id.clone());
    }
    shard_ids.into_iter().collect()
}

fn hash_key(value: &str) -> u64 {
    let mut hash: u64 = 1469598103934665603;
    for byte in value.as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(1099511628211);
    }
    hash
}

pub(crate) fn env_with_fallback(primary: &str, fallback: &str) -> Option<String> {
    std::env::var(primary)
        .ok()
        .or_else(|| std::env::var(fallback).ok())
}

/// First of `keys` that is set and parses as `T`; unparseable values are skipped.
pub fn parse_env_first<T: FromStr>(keys: &[&str]) -> Option<T> {
    for key in keys {
        if let Ok(value) = std::env::var(key)
            && let Ok(parsed) = value.trim().parse::<T>()
        {
            return Some(parsed);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shards(ids: &[&str]) -> Vec<ShardId> {
        ids.iter().map(|id| ShardId::new(*id)).collect()
    }

    #[test]
    fn routing_is_deterministic_for_same_input() {
        let ns = Namespace::new("foo", "bar");
        let ids = shards(&["shard-a", "shard-b", "shard-c"]);
        let a = route_to_shard(&ns, "42", &ids, 32);
        let b = route_to_shard(&ns, "42", &ids, 32);
        assert_eq!(a, b);
        assert!(a.is_some());
    }

    #[test]
    fn routing_spreads_keys_across_shards() {
        let ns = Namespace::new("foo", "bar");
        let ids = shards(&["shard-a", "shard-b", "shard-c", "shard-d"]);
        let hit: BTreeSet<ShardId> = (0..200)
            .filter_map(|key| route_to_shard(&ns, &key.to_string(), &ids, 32))
            .collect();
        assert!(hit.len() > 1);
    }

    #[test]
    fn routing_without_shards_yields_none() {
        let ns = Namespace::new("foo", "bar");
        assert_eq!(route_to_shard(&ns, "1", &[], 16), None);
    }

    #[test]
    fn parse_shard_placements_csv_groups_by_namespace_and_shard() {
        let csv = r#"
            # namespace,shard_id,epoch,major,minor
            foo.bar,shard-a,7,100,200
            foo.bar,shard-b,7,101,200
            foo.baz,shard-a,9,1,0
        "#;
        let placements = parse_shard_placements_csv(csv).expect("csv should parse");
        assert_eq!(placements.len(), 3);
        assert_eq!(placements[0].namespace, Namespace::new("foo", "bar"));
        assert_eq!(placements[0].shard_id, ShardId::new("shard-a"));
        assert_eq!(placements[0].version, ShardVersion::new(100, 200, Epoch(7)));
        assert_eq!(placements[2].version.epoch, Epoch(9));
    }

    #[test]
    fn parse_shard_placements_csv_rejects_epoch_conflicts() {
        let csv = r#"
            foo.bar,shard-a,7,1,0
            foo.bar,shard-b,8,1,0
        "#;
        let err = parse_shard_placements_csv(csv).expect_err("csv should reject epoch conflicts");
        assert!(err.contains("epoch mismatch"));
    }

    #[test]
    fn parse_shard_placements_csv_rejects_duplicate_shards() {
        let csv = r#"
            foo.bar,shard-a,7,1,0
            foo.bar,shard-a,7,2,0
        "#;
        let err = parse_shard_placements_csv(csv).expect_err("csv should reject duplicates");
        assert!(err.contains("duplicate shard"));
    }

    #[test]
    fn shard_ids_from_placements_deduplicates_and_sorts() {
        let placements = parse_shard_placements_csv(
            "foo.bar,shard-b,1,1,0\nfoo.baz,shard-a,2,1,0\nfoo.qux,shard-b,3,1,0\n",
        )
        .expect("csv should parse");
        assert_eq!(
            shard_ids_from_placements(&placements),
            shards(&["shard-a", "shard-b"])
        );
    }

    #[test]
    fn route_errors_map_to_status_codes() {
        let status: Status = PlacementRouteError::ShardKeyNotFound {
            namespace: Namespace::new("foo", "bar"),
            field: "sk".to_string(),
        }
        .into();
        assert_eq!(status.code, ErrorCode::ShardKeyNotFound);
        assert!(status.reason.contains("sk"));
    }

    #[allow(unused_unsafe)]
    fn set_env_var_for_tests(key: &str, value: &str) {
        unsafe {
            std::env::set_var(key, value);
        }
    }

    #[test]
    fn parse_env_first_skips_unparseable_keys() {
        set_env_var_for_tests("DASH_ROUTER_TEST_BAD", "not-a-number");
        set_env_var_for_tests("DASH_ROUTER_TEST_GOOD", " 42 ");
        assert_eq!(
            parse_env_first::<usize>(&["DASH_ROUTER_TEST_BAD", "DASH_ROUTER_TEST_GOOD"]),
            Some(42)
        );
        assert_eq!(parse_env_first::<u32>(&["DASH_ROUTER_TEST_UNSET"]), None);
    }
}
