//! Configuration for the satellite process.

use rand::Rng;
use satellite_protocol::{ProtocolVersion, ReplicaId, DEFAULT_MAX_FRAME_LEN};
use std::time::Duration;

/// Configuration for a satellite.
///
/// All values are plain data; building a configuration never touches the
/// network or the store.
#[derive(Debug, Clone)]
pub struct SatelliteConfig {
    /// Replica identity. When unset, the persisted identity is used, or a
    /// fresh one is generated on first open.
    pub replica_id: Option<ReplicaId>,
    /// Service endpoint (`host:port` for TCP).
    pub endpoint: String,
    /// Protocol version announced in `Hello`.
    pub protocol_version: ProtocolVersion,
    /// Maximum number of oplog entries sent in one batch.
    pub batch_size: usize,
    /// How long to wait for a batch to fill before sending it anyway.
    pub batch_window: Duration,
    /// Maximum number of sent but unacknowledged oplog entries.
    pub max_outbound_depth: usize,
    /// How long to wait for an `Ack` before resending.
    pub ack_timeout: Duration,
    /// Interval between liveness pings.
    pub ping_interval: Duration,
    /// Connection is considered dead after this long without inbound traffic.
    pub liveness_timeout: Duration,
    /// Timeout for connect, handshake and subscribe steps.
    pub connect_timeout: Duration,
    /// Bound on writing one frame; a peer that stops reading ends the session.
    pub write_timeout: Duration,
    /// How long tombstoned shadow rows are kept.
    pub tombstone_retention: Duration,
    /// Interval of the tombstone garbage collector.
    pub gc_interval: Duration,
    /// Maximum accepted frame length.
    pub max_frame_len: usize,
    /// Consecutive protocol violations tolerated before giving up.
    pub violation_budget: u32,
    /// Reconnect backoff.
    pub backoff: BackoffConfig,
}

impl SatelliteConfig {
    /// Creates a configuration for the given endpoint.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            replica_id: None,
            endpoint: endpoint.into(),
            protocol_version: ProtocolVersion::CURRENT,
            batch_size: 100,
            batch_window: Duration::from_millis(50),
            max_outbound_depth: 1_000,
            ack_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(15),
            liveness_timeout: Duration::from_secs(45),
            connect_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            tombstone_retention: Duration::from_secs(7 * 24 * 60 * 60),
            gc_interval: Duration::from_secs(60 * 60),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            violation_budget: 3,
            backoff: BackoffConfig::default(),
        }
    }

    /// Sets the replica identity.
    pub fn with_replica_id(mut self, replica_id: impl Into<ReplicaId>) -> Self {
        self.replica_id = Some(replica_id.into());
        self
    }

    /// Sets the announced protocol version.
    pub fn with_protocol_version(mut self, version: ProtocolVersion) -> Self {
        self.protocol_version = version;
        self
    }

    /// Sets the batch size.
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    /// Sets the batch window.
    pub fn with_batch_window(mut self, window: Duration) -> Self {
        self.batch_window = window;
        self
    }

    /// Sets the maximum outbound depth.
    pub fn with_max_outbound_depth(mut self, depth: usize) -> Self {
        self.max_outbound_depth = depth.max(1);
        self
    }

    /// Sets the ack timeout.
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    /// Sets the ping interval and liveness timeout.
    pub fn with_liveness(mut self, ping_interval: Duration, liveness_timeout: Duration) -> Self {
        self.ping_interval = ping_interval;
        self.liveness_timeout = liveness_timeout;
        self
    }

    /// Sets the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the write timeout.
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Sets the tombstone retention window and GC interval.
    pub fn with_tombstone_gc(mut self, retention: Duration, interval: Duration) -> Self {
        self.tombstone_retention = retention;
        self.gc_interval = interval;
        self
    }

    /// Sets the maximum frame length.
    pub fn with_max_frame_len(mut self, len: usize) -> Self {
        self.max_frame_len = len;
        self
    }

    /// Sets the protocol violation budget.
    pub fn with_violation_budget(mut self, budget: u32) -> Self {
        self.violation_budget = budget;
        self
    }

    /// Sets the reconnect backoff.
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }
}

impl Default for SatelliteConfig {
    fn default() -> Self {
        Self::new("127.0.0.1:5133")
    }
}

/// Reconnect backoff: exponential, capped, with jitter.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay before the first reconnect.
    pub initial_delay: Duration,
    /// Upper bound on any delay.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub multiplier: f64,
    /// Whether to add up to 25% random jitter.
    pub jitter: bool,
    /// An `Active` period at least this long resets the backoff.
    pub stability_threshold: Duration,
}

impl BackoffConfig {
    /// Creates the default backoff.
    pub fn new() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: true,
            stability_threshold: Duration::from_secs(30),
        }
    }

    /// Short, deterministic delays for tests.
    pub fn testing() -> Self {
        Self {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            multiplier: 2.0,
            jitter: false,
            stability_threshold: Duration::from_millis(200),
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the multiplier.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Sets the stability threshold.
    pub fn with_stability_threshold(mut self, threshold: Duration) -> Self {
        self.stability_threshold = threshold;
        self
    }

    /// Calculates the delay before reconnect attempt `attempt` (1-indexed).
    ///
    /// Attempt 0 has no delay.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = base.min(self.max_delay.as_secs_f64());

        if self.jitter {
            let jitter = capped * 0.25 * rand::thread_rng().gen::<f64>();
            Duration::from_secs_f64((capped + jitter).min(self.max_delay.as_secs_f64()))
        } else {
            Duration::from_secs_f64(capped)
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_builder() {
        let config = SatelliteConfig::new("sync.example.com:5133")
            .with_replica_id("r1")
            .with_batch_size(25)
            .with_max_outbound_depth(0)
            .with_ack_timeout(Duration::from_secs(3));

        assert_eq!(config.endpoint, "sync.example.com:5133");
        assert_eq!(config.replica_id, Some(ReplicaId::new("r1")));
        assert_eq!(config.batch_size, 25);
        assert_eq!(config.max_outbound_depth, 1);
        assert_eq!(config.ack_timeout, Duration::from_secs(3));
    }

    #[test]
    fn backoff_without_jitter_is_exponential() {
        let backoff = BackoffConfig::new()
            .with_initial_delay(Duration::from_millis(100))
            .with_jitter(false);

        assert_eq!(backoff.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(backoff.delay_for_attempt(3), Duration::from_millis(400));
    }

    #[test]
    fn backoff_jitter_bounds() {
        let backoff = BackoffConfig::new().with_initial_delay(Duration::from_millis(100));
        for _ in 0..32 {
            let delay = backoff.delay_for_attempt(1);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(125));
        }
    }

    #[test]
    fn backoff_respects_max() {
        let backoff = BackoffConfig::new()
            .with_initial_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(5))
            .with_multiplier(10.0);

        assert!(backoff.delay_for_attempt(5) <= Duration::from_secs(5));
        assert!(backoff.delay_for_attempt(u32::MAX) <= Duration::from_secs(5));
    }
}
