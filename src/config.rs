use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::time::Duration;

/// Port used by SenseME devices for both discovery and sessions
pub const DEFAULT_PORT: u16 = 31415;

/// Settings for a single device session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// TCP port of the device
    pub port: u16,
    /// How often the full state is re-requested
    #[serde(with = "secs")]
    pub refresh_interval: Duration,
    /// Bound of the random offset added to each refresh interval
    #[serde(with = "millis")]
    pub refresh_jitter: Duration,
    /// Cool-down after a failed connection attempt
    #[serde(with = "secs")]
    pub reconnect_delay: Duration,
    /// Pause after the device closed the connection
    #[serde(with = "millis")]
    pub disconnect_pause: Duration,
    /// Pause after a transport error while receiving
    #[serde(with = "millis")]
    pub error_pause: Duration,
    /// Transport errors tolerated before the session gives up
    pub max_errors: u32,
    /// Default wait for the first full update in [`crate::Device::update`]
    #[serde(with = "millis")]
    pub update_timeout: Duration,
    /// Bound on a short-lived query connection
    #[serde(with = "millis")]
    pub query_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            refresh_interval: Duration::from_secs(60),
            refresh_jitter: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(60),
            disconnect_pause: Duration::from_secs(1),
            error_pause: Duration::from_secs(1),
            max_errors: 10,
            update_timeout: Duration::from_secs(5),
            query_timeout: Duration::from_secs(5),
        }
    }
}

impl SessionConfig {
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    pub fn with_refresh_jitter(mut self, jitter: Duration) -> Self {
        self.refresh_jitter = jitter;
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn with_disconnect_pause(mut self, pause: Duration) -> Self {
        self.disconnect_pause = pause;
        self
    }

    pub fn with_error_pause(mut self, pause: Duration) -> Self {
        self.error_pause = pause;
        self
    }

    pub fn with_max_errors(mut self, max_errors: u32) -> Self {
        self.max_errors = max_errors;
        self
    }

    pub fn with_update_timeout(mut self, timeout: Duration) -> Self {
        self.update_timeout = timeout;
        self
    }

    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }
}

/// What discovery does with a device it has not seen before
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NewDevicePolicy {
    /// Start the session and wait for the first full update
    StartFirst,
    /// Only retrieve secondary info over a short-lived connection
    FillInfo,
}

/// Settings for the discovery coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Port discovery requests are sent to
    pub port: u16,
    /// Local UDP port every endpoint binds; `0` picks an ephemeral port
    pub local_port: u16,
    /// Destination of discovery requests
    pub broadcast_addr: Ipv4Addr,
    /// Explicit interface addresses; `None` enumerates non-loopback IPv4 interfaces
    pub interfaces: Option<Vec<Ipv4Addr>>,
    pub policy: NewDevicePolicy,
    /// Time between discovery cycles
    #[serde(with = "secs")]
    pub refresh_interval: Duration,
    #[serde(with = "millis")]
    pub refresh_jitter: Duration,
    /// How long to wait for a reply before re-broadcasting
    #[serde(with = "millis")]
    pub reply_window: Duration,
    /// How long a cycle keeps re-broadcasting before it gives up
    #[serde(with = "millis")]
    pub broadcast_window: Duration,
    /// Bound on starting or querying a newly found device
    #[serde(with = "millis")]
    pub device_timeout: Duration,
    /// Session settings handed to every device discovery creates
    pub session: SessionConfig,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            local_port: DEFAULT_PORT,
            broadcast_addr: Ipv4Addr::BROADCAST,
            interfaces: None,
            policy: NewDevicePolicy::StartFirst,
            refresh_interval: Duration::from_secs(5 * 60),
            refresh_jitter: Duration::from_secs(10),
            reply_window: Duration::from_secs(1),
            broadcast_window: Duration::from_secs(5),
            device_timeout: Duration::from_secs(10),
            session: SessionConfig::default(),
        }
    }
}

impl DiscoveryConfig {
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_local_port(mut self, port: u16) -> Self {
        self.local_port = port;
        self
    }

    pub fn with_broadcast_addr(mut self, addr: Ipv4Addr) -> Self {
        self.broadcast_addr = addr;
        self
    }

    pub fn with_interfaces(mut self, interfaces: Vec<Ipv4Addr>) -> Self {
        self.interfaces = Some(interfaces);
        self
    }

    pub fn with_policy(mut self, policy: NewDevicePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    pub fn with_refresh_jitter(mut self, jitter: Duration) -> Self {
        self.refresh_jitter = jitter;
        self
    }

    pub fn with_reply_window(mut self, window: Duration) -> Self {
        self.reply_window = window;
        self
    }

    pub fn with_broadcast_window(mut self, window: Duration) -> Self {
        self.broadcast_window = window;
        self
    }

    pub fn with_device_timeout(mut self, timeout: Duration) -> Self {
        self.device_timeout = timeout;
        self
    }

    pub fn with_session(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }
}

/// `base` plus a uniform random offset in `[-jitter, +jitter]`, never negative
pub(crate) fn jittered(base: Duration, jitter: Duration) -> Duration {
    use rand::Rng;

    let jitter = jitter.as_secs_f64();
    if jitter <= 0.0 {
        return base;
    }
    let offset = rand::thread_rng().gen_range(-jitter..=jitter);
    Duration::from_secs_f64((base.as_secs_f64() + offset).max(0.0))
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let millis = u64::try_from(value.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DiscoveryConfig::default();
        assert_eq!(config.port, 31415);
        assert_eq!(config.policy, NewDevicePolicy::StartFirst);
        assert_eq!(config.session.max_errors, 10);
        assert_eq!(config.session.refresh_interval, Duration::from_secs(60));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: SessionConfig =
            serde_json::from_str(r#"{"port": 4000, "reconnect_delay": 5, "error_pause": 250}"#)
                .unwrap();
        assert_eq!(config.port, 4000);
        assert_eq!(config.reconnect_delay, Duration::from_secs(5));
        assert_eq!(config.error_pause, Duration::from_millis(250));
        assert_eq!(config.max_errors, 10);
    }

    #[test]
    fn test_sub_second_jitter_survives_json() {
        let config = DiscoveryConfig::default()
            .with_refresh_jitter(Duration::from_millis(500))
            .with_session(SessionConfig::default().with_refresh_jitter(Duration::from_millis(1500)));
        let json = serde_json::to_string(&config).unwrap();
        let back: DiscoveryConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.refresh_jitter, Duration::from_millis(500));
        assert_eq!(back.session.refresh_jitter, Duration::from_millis(1500));
        assert_eq!(back, config);
    }

    #[test]
    fn test_jitter_bounds() {
        let base = Duration::from_secs(60);
        for _ in 0..100 {
            let value = jittered(base, Duration::from_secs(10));
            assert!(value >= Duration::from_secs(50) && value <= Duration::from_secs(70));
        }
        assert_eq!(jittered(base, Duration::ZERO), base);
        assert!(jittered(Duration::from_secs(1), Duration::from_secs(10)) <= Duration::from_secs(11));
    }
}
