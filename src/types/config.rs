//! Engine configuration.
//!
//! Configuration is loaded from environment variables with documented
//! defaults. Every knob here is process-wide; per-node limits (timeouts,
//! retries) come from the node specification tables instead.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Global engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Max in-flight handlers per execution.
    pub max_concurrent_nodes: usize,

    /// Max parallel batch items within a sub-diagram.
    pub batch_max_concurrent: usize,

    /// Max concurrent child diagrams.
    pub sub_diagram_max_concurrent: usize,

    /// Per-execution event ring buffer capacity.
    pub event_ring_max_len: usize,

    /// Per-subscriber outbox capacity before backpressure detach.
    pub subscriber_outbox_max: usize,

    /// Strict envelope contracts. When false, legacy `{"results": [...]}`
    /// auto-wrapping of list bodies is applied at input resolution
    /// (compatibility only).
    pub strict_envelopes: bool,

    /// Interval between KeepAlive events.
    #[serde(with = "humantime_serde")]
    pub keepalive_interval: Duration,

    /// Grace period for in-flight handlers after cancellation.
    #[serde(with = "humantime_serde")]
    pub handler_cancel_grace: Duration,

    /// Base delay for exponential retry backoff (doubles per attempt,
    /// capped at `retry_backoff_cap`).
    #[serde(with = "humantime_serde")]
    pub retry_backoff_base: Duration,

    /// Upper bound on a single retry delay.
    #[serde(with = "humantime_serde")]
    pub retry_backoff_cap: Duration,

    /// Rendered prompt template LRU capacity.
    pub prompt_template_cache: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_nodes: 20,
            batch_max_concurrent: 10,
            sub_diagram_max_concurrent: 10,
            event_ring_max_len: 1024,
            subscriber_outbox_max: 256,
            strict_envelopes: true,
            keepalive_interval: Duration::from_secs(15),
            handler_cancel_grace: Duration::from_secs(5),
            retry_backoff_base: Duration::from_secs(1),
            retry_backoff_cap: Duration::from_secs(30),
            prompt_template_cache: 1000,
        }
    }
}

impl EngineConfig {
    /// Load configuration from the documented environment surface.
    ///
    /// Unset or unparseable variables fall back to defaults.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(v) = env_parse::<usize>("ENGINE_MAX_CONCURRENT") {
            cfg.max_concurrent_nodes = v.max(1);
        }
        if let Some(v) = env_parse::<usize>("BATCH_MAX_CONCURRENT") {
            cfg.batch_max_concurrent = v.max(1);
        }
        if let Some(v) = env_parse::<usize>("SUB_DIAGRAM_MAX_CONCURRENT") {
            cfg.sub_diagram_max_concurrent = v.max(1);
        }
        if let Some(v) = env_parse::<usize>("EVENT_RING_MAX_LEN") {
            cfg.event_ring_max_len = v.max(1);
        }
        if let Some(v) = env_parse::<usize>("SUBSCRIBER_OUTBOX_MAX") {
            cfg.subscriber_outbox_max = v.max(1);
        }
        if let Some(v) = env_parse::<u8>("STRICT_ENVELOPES") {
            cfg.strict_envelopes = v != 0;
        }
        if let Some(v) = env_parse::<u64>("KEEPALIVE_INTERVAL_S") {
            cfg.keepalive_interval = Duration::from_secs(v.max(1));
        }
        if let Some(v) = env_parse::<u64>("HANDLER_CANCEL_GRACE_S") {
            cfg.handler_cancel_grace = Duration::from_secs(v);
        }
        if let Some(v) = env_parse::<usize>("PROMPT_TEMPLATE_CACHE") {
            cfg.prompt_template_cache = v.max(1);
        }
        cfg
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.max_concurrent_nodes, 20);
        assert_eq!(cfg.batch_max_concurrent, 10);
        assert_eq!(cfg.sub_diagram_max_concurrent, 10);
        assert_eq!(cfg.event_ring_max_len, 1024);
        assert_eq!(cfg.subscriber_outbox_max, 256);
        assert!(cfg.strict_envelopes);
        assert_eq!(cfg.keepalive_interval, Duration::from_secs(15));
        assert_eq!(cfg.handler_cancel_grace, Duration::from_secs(5));
    }
}
