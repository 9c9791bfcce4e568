use std::env;
use std::time::Duration;

use dotenv::dotenv;
use tracing::info;

use crate::backpressure::OverflowPolicy;
use crate::event::EventContext;

const BUS_NODE_ID: &str = "BUS_NODE_ID";
const BUS_MAX_IN_FLIGHT: &str = "BUS_MAX_IN_FLIGHT";
const BUS_OVERFLOW_POLICY: &str = "BUS_OVERFLOW_POLICY";
const BUS_BLOCK_TIMEOUT_MS: &str = "BUS_BLOCK_TIMEOUT_MS";
const BUS_DISPATCH_BUFFER: &str = "BUS_DISPATCH_BUFFER";

/// Configuration for a bus instance.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Identifier of this node within a replication cluster
    pub node_id: String,
    /// Maximum admitted-but-not-terminal events before backpressure applies
    pub max_in_flight: usize,
    /// What to do with a publish that arrives at capacity
    pub overflow_policy: OverflowPolicy,
    /// How long a `Block`-policy publish may wait for capacity
    pub block_timeout: Duration,
    /// Capacity of the dispatch command channel
    pub dispatch_buffer: usize,
    /// Ambient context merged into every event by the transform chain;
    /// explicit publish-time context keys win
    pub ambient_context: EventContext,
}

impl BusConfig {
    /// Loads configuration from the environment, panicking on malformed
    /// values. Missing variables fall back to defaults.
    pub fn from_env() -> BusConfig {
        match Self::try_from_env() {
            Ok(config) => config,
            Err(err) => panic!("{}", err),
        }
    }

    pub fn try_from_env() -> Result<BusConfig, String> {
        // Load .env file
        dotenv().ok();

        let defaults = BusConfig::default();

        let node_id = env::var(BUS_NODE_ID).unwrap_or(defaults.node_id);

        let max_in_flight = match env::var(BUS_MAX_IN_FLIGHT) {
            Ok(raw) => raw
                .trim()
                .parse::<usize>()
                .map_err(|_| format!("failed to parse {} value: {}", BUS_MAX_IN_FLIGHT, raw))?,
            Err(_) => defaults.max_in_flight,
        };

        let overflow_policy = match env::var(BUS_OVERFLOW_POLICY) {
            Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
                "reject" => OverflowPolicy::Reject,
                "drop_oldest" => OverflowPolicy::DropOldest,
                "block" => OverflowPolicy::Block,
                other => {
                    return Err(format!(
                        "failed to parse {} value: {} (expected reject, drop_oldest or block)",
                        BUS_OVERFLOW_POLICY, other
                    ));
                }
            },
            Err(_) => defaults.overflow_policy,
        };

        let block_timeout = match env::var(BUS_BLOCK_TIMEOUT_MS) {
            Ok(raw) => {
                let millis = raw
                    .trim()
                    .parse::<u64>()
                    .map_err(|_| format!("failed to parse {} value: {}", BUS_BLOCK_TIMEOUT_MS, raw))?;
                Duration::from_millis(millis)
            }
            Err(_) => defaults.block_timeout,
        };

        let dispatch_buffer = match env::var(BUS_DISPATCH_BUFFER) {
            Ok(raw) => raw
                .trim()
                .parse::<usize>()
                .map_err(|_| format!("failed to parse {} value: {}", BUS_DISPATCH_BUFFER, raw))?,
            Err(_) => defaults.dispatch_buffer,
        };

        info!(
            node_id = %node_id,
            max_in_flight,
            ?overflow_policy,
            "loaded bus configuration from environment"
        );

        Ok(BusConfig {
            node_id,
            max_in_flight,
            overflow_policy,
            block_timeout,
            dispatch_buffer,
            ambient_context: EventContext::new(),
        })
    }
}

impl Default for BusConfig {
    fn default() -> BusConfig {
        BusConfig {
            node_id: "node-0".to_string(),
            max_in_flight: 1024,
            overflow_policy: OverflowPolicy::Reject,
            block_timeout: Duration::from_secs(5),
            dispatch_buffer: 256,
            ambient_context: EventContext::new(),
        }
    }
}
