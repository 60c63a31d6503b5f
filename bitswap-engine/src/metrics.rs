use std::fmt;

use prometheus_client::{metrics::counter::Counter, registry::Registry};

/// Counters kept by the engine.
///
/// Cloning is cheap, all clones share the same counters. Use [`Metrics::new`] to have them
/// exported through a registry, or [`Metrics::default`] to keep them local.
#[derive(Clone, Default)]
pub struct Metrics {
    pub wants_sent: Counter,
    pub cancels_sent: Counter,
    pub messages_sent: Counter,
    pub messages_failed: Counter,
    pub messages_received: Counter,
    pub blocks_received: Counter,
    pub bytes_received: Counter,
    pub dup_blocks_received: Counter,
    pub dup_bytes_received: Counter,
    pub blocks_sent: Counter,
    pub bytes_sent: Counter,
    pub haves_sent: Counter,
    pub dont_haves_sent: Counter,
    pub sessions_created: Counter,
    pub providers_probed: Counter,
    pub providers_added: Counter,
}

impl fmt::Debug for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bitswap Metrics").finish()
    }
}

impl Metrics {
    pub fn new(registry: &mut Registry) -> Self {
        let metrics = Self::default();
        let sub_registry = registry.sub_registry_with_prefix("bitswap");

        sub_registry.register(
            METRICS_CNT_WANTS_SENT,
            "Want-list entries sent to peers",
            metrics.wants_sent.clone(),
        );
        sub_registry.register(
            METRICS_CNT_CANCELS_SENT,
            "Cancel entries sent to peers",
            metrics.cancels_sent.clone(),
        );
        sub_registry.register(
            METRICS_CNT_MESSAGES_SENT,
            "Messages delivered to peers",
            metrics.messages_sent.clone(),
        );
        sub_registry.register(
            METRICS_CNT_MESSAGES_FAILED,
            "Messages that failed to be delivered",
            metrics.messages_failed.clone(),
        );
        sub_registry.register(
            METRICS_CNT_MESSAGES_RECEIVED,
            "Messages received from peers",
            metrics.messages_received.clone(),
        );
        sub_registry.register(
            METRICS_CNT_BLOCKS_RECEIVED,
            "Blocks received",
            metrics.blocks_received.clone(),
        );
        sub_registry.register(
            METRICS_CNT_BYTES_RECEIVED,
            "Block bytes received",
            metrics.bytes_received.clone(),
        );
        sub_registry.register(
            METRICS_CNT_DUP_BLOCKS_RECEIVED,
            "Blocks received that were not wanted",
            metrics.dup_blocks_received.clone(),
        );
        sub_registry.register(
            METRICS_CNT_DUP_BYTES_RECEIVED,
            "Block bytes received that were not wanted",
            metrics.dup_bytes_received.clone(),
        );
        sub_registry.register(
            METRICS_CNT_BLOCKS_SENT,
            "Blocks sent",
            metrics.blocks_sent.clone(),
        );
        sub_registry.register(
            METRICS_CNT_BYTES_SENT,
            "Block bytes sent",
            metrics.bytes_sent.clone(),
        );
        sub_registry.register(
            METRICS_CNT_HAVES_SENT,
            "HAVE presences sent",
            metrics.haves_sent.clone(),
        );
        sub_registry.register(
            METRICS_CNT_DONT_HAVES_SENT,
            "DONT_HAVE presences sent",
            metrics.dont_haves_sent.clone(),
        );
        sub_registry.register(
            METRICS_CNT_SESSIONS_CREATED,
            "Sessions created",
            metrics.sessions_created.clone(),
        );
        sub_registry.register(
            METRICS_CNT_PROVIDERS_PROBED,
            "Candidate providers probed by sessions",
            metrics.providers_probed.clone(),
        );
        sub_registry.register(
            METRICS_CNT_PROVIDERS_ADDED,
            "Providers added to sessions",
            metrics.providers_added.clone(),
        );

        metrics
    }
}

pub const METRICS_CNT_WANTS_SENT: &str = "wants_sent";
pub const METRICS_CNT_CANCELS_SENT: &str = "cancels_sent";
pub const METRICS_CNT_MESSAGES_SENT: &str = "messages_sent";
pub const METRICS_CNT_MESSAGES_FAILED: &str = "messages_failed";
pub const METRICS_CNT_MESSAGES_RECEIVED: &str = "messages_received";
pub const METRICS_CNT_BLOCKS_RECEIVED: &str = "blocks_received";
pub const METRICS_CNT_BYTES_RECEIVED: &str = "bytes_received";
pub const METRICS_CNT_DUP_BLOCKS_RECEIVED: &str = "dup_blocks_received";
pub const METRICS_CNT_DUP_BYTES_RECEIVED: &str = "dup_bytes_received";
pub const METRICS_CNT_BLOCKS_SENT: &str = "blocks_sent";
pub const METRICS_CNT_BYTES_SENT: &str = "bytes_sent";
pub const METRICS_CNT_HAVES_SENT: &str = "haves_sent";
pub const METRICS_CNT_DONT_HAVES_SENT: &str = "dont_haves_sent";
pub const METRICS_CNT_SESSIONS_CREATED: &str = "sessions_created";
pub const METRICS_CNT_PROVIDERS_PROBED: &str = "providers_probed";
pub const METRICS_CNT_PROVIDERS_ADDED: &str = "providers_added";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registered_counters_are_shared() {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        metrics.clone().blocks_sent.inc_by(3);
        assert_eq!(metrics.blocks_sent.get(), 3);

        let mut out = String::new();
        prometheus_client::encoding::text::encode(&mut out, &registry).unwrap();
        assert!(out.contains("bitswap_blocks_sent_total 3"), "{out}");
    }
}
