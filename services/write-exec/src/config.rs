use metadata_router::parse_env_first;

use crate::targeted_batch::BatchLimits;

pub const DEFAULT_MAX_BATCH_ITEMS: usize = 100_000;
pub const DEFAULT_MAX_BATCH_BYTES: usize = 16 * 1024 * 1024;
pub const DEFAULT_BATCH_ENVELOPE_RESERVE_BYTES: usize = 16 * 1024;
pub const DEFAULT_MAX_ROUNDS_WITHOUT_PROGRESS: u32 = 5;
pub const DEFAULT_MAX_DISPATCH_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteExecConfig {
    /// Upper bound on statements in one shard sub-batch.
    pub max_batch_items: usize,
    /// Wire size limit of one shard command.
    pub max_batch_bytes: usize,
    /// Part of `max_batch_bytes` kept free for the command envelope
    /// (namespace, shard version, write concern, session fields).
    pub batch_envelope_reserve_bytes: usize,
    /// Consecutive rounds with neither a completed op nor a routing change
    /// before the remaining ops fail with `NoProgressMade`.
    pub max_rounds_without_progress: u32,
    /// Total sends of one sub-batch within a round when the shard answers
    /// with a retryable error and the write carries a retry identity.
    pub max_dispatch_attempts: u32,
}

impl Default for WriteExecConfig {
    fn default() -> Self {
        Self {
            max_batch_items: DEFAULT_MAX_BATCH_ITEMS,
            max_batch_bytes: DEFAULT_MAX_BATCH_BYTES,
            batch_envelope_reserve_bytes: DEFAULT_BATCH_ENVELOPE_RESERVE_BYTES,
            max_rounds_without_progress: DEFAULT_MAX_ROUNDS_WITHOUT_PROGRESS,
            max_dispatch_attempts: DEFAULT_MAX_DISPATCH_ATTEMPTS,
        }
    }
}

impl WriteExecConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_batch_items: parse_env_first::<usize>(&[
                "DASH_ROUTER_WRITE_MAX_BATCH_ITEMS",
                "EME_ROUTER_WRITE_MAX_BATCH_ITEMS",
            ])
            .filter(|value| *value > 0)
            .unwrap_or(defaults.max_batch_items),
            max_batch_bytes: parse_env_first::<usize>(&[
                "DASH_ROUTER_WRITE_MAX_BATCH_BYTES",
                "EME_ROUTER_WRITE_MAX_BATCH_BYTES",
            ])
            .filter(|value| *value > 0)
            .unwrap_or(defaults.max_batch_bytes),
            batch_envelope_reserve_bytes: parse_env_first::<usize>(&[
                "DASH_ROUTER_WRITE_ENVELOPE_RESERVE_BYTES",
                "EME_ROUTER_WRITE_ENVELOPE_RESERVE_BYTES",
            ])
            .unwrap_or(defaults.batch_envelope_reserve_bytes),
            max_rounds_without_progress: parse_env_first::<u32>(&[
                "DASH_ROUTER_WRITE_MAX_ROUNDS_WITHOUT_PROGRESS",
                "EME_ROUTER_WRITE_MAX_ROUNDS_WITHOUT_PROGRESS",
            ])
            .unwrap_or(defaults.max_rounds_without_progress),
            max_dispatch_attempts: parse_env_first::<u32>(&[
                "DASH_ROUTER_WRITE_MAX_DISPATCH_ATTEMPTS",
                "EME_ROUTER_WRITE_MAX_DISPATCH_ATTEMPTS",
            ])
            .filter(|value| *value > 0)
            .unwrap_or(defaults.max_dispatch_attempts),
        }
    }

    pub fn batch_limits(&self) -> BatchLimits {
        BatchLimits {
            max_items: self.max_batch_items.max(1),
            max_bytes: self
                .max_batch_bytes
                .saturating_sub(self.batch_envelope_reserve_bytes)
                .max(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_limits_reserve_envelope_space() {
        let config = WriteExecConfig {
            max_batch_bytes: 1024,
            batch_envelope_reserve_bytes: 24,
            ..WriteExecConfig::default()
        };
        let limits = config.batch_limits();
        assert_eq!(limits.max_bytes, 1000);
        assert_eq!(limits.max_items, DEFAULT_MAX_BATCH_ITEMS);
    }

    #[test]
    fn batch_limits_never_drop_to_zero() {
        let config = WriteExecConfig {
            max_batch_items: 0,
            max_batch_bytes: 10,
            batch_envelope_reserve_bytes: 100,
            ..WriteExecConfig::default()
        };
        let limits = config.batch_limits();
        assert_eq!(limits.max_items, 1);
        assert_eq!(limits.max_bytes, 1);
    }
}
