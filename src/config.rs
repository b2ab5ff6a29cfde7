#![forbid(unsafe_code)]

// Run configuration, loaded from environment variables. Unparseable values
// are fatal at startup, before any sessions are created.

use crate::allocator::WorkerPartition;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value:?}")]
    Invalid { name: &'static str, value: String },
    #[error("no broker address configured (set MQTT_BROKER or BROKER_URL)")]
    MissingBroker,
    #[error("invalid broker URL {0:?} (expected mqtt://host[:port] or mqtts://host[:port])")]
    BadBrokerUrl(String),
    #[error("WORKER_INDEX ({index}) must be less than WORKER_COUNT ({count})")]
    BadWorkerIndex { index: u32, count: u32 },
    #[error("USER_POOL_SIZE ({pool}) must cover at least one identity per worker ({count})")]
    PoolTooSmall { pool: u64, count: u32 },
    #[error("{name} range is inverted ({min}s > {max}s)")]
    InvertedRange { name: &'static str, min: u64, max: u64 },
}

/// Which protocol stack drives a session's connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolStack {
    /// Connection lives on the background I/O loop; callers go through the bridge.
    Bridged,
    /// std TCP with one reader thread per connection.
    Blocking,
}

/// Load test configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub broker: String,
    pub port: u16,
    pub use_tls: bool,
    pub ca_cert_path: Option<String>,
    pub user_prefix: String,
    pub pool_size: u64,
    pub user_start: u64,
    pub worker_index: u32,
    pub worker_count: u32,
    pub users_per_worker: usize,
    pub churn_users: usize,
    pub connect_timeout: Duration,
    pub keepalive: Duration,
    pub wait_min: Duration,
    pub wait_max: Duration,
    pub churn_hold_min: Duration,
    pub churn_hold_max: Duration,
    pub ramp_up: Duration,
    pub run_duration: Duration,
    pub topic_pattern: String,
    pub expected_payload: String,
    pub stack: ProtocolStack,
    pub report_addr: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            broker: String::new(),
            port: 1883,
            use_tls: false,
            ca_cert_path: None,
            user_prefix: "user".to_string(),
            pool_size: 1_500_000,
            user_start: 1,
            worker_index: 0,
            worker_count: 1,
            users_per_worker: 10_000,
            churn_users: 0,
            connect_timeout: Duration::from_secs(30),
            keepalive: Duration::from_secs(60),
            wait_min: Duration::from_secs(30),
            wait_max: Duration::from_secs(60),
            churn_hold_min: Duration::from_secs(2),
            churn_hold_max: Duration::from_secs(5),
            ramp_up: Duration::from_secs(0),
            run_duration: Duration::from_secs(60),
            topic_pattern: "clients/{client_id}/alerts".to_string(),
            expected_payload: "ALERT".to_string(),
            stack: ProtocolStack::Bridged,
            report_addr: None,
        }
    }
}

impl Config {
    /// Load from environment variables on top of the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = Config::default();

        if let Some(broker) = env_string("MQTT_BROKER") {
            cfg.broker = broker;
        }
        cfg.use_tls = env_bool("USE_TLS", cfg.use_tls)?;
        cfg.ca_cert_path = env_string("CA_CERT_PATH");
        if let Some(prefix) = env_string("USER_PREFIX") {
            cfg.user_prefix = prefix;
        }
        cfg.pool_size = env_parse("USER_POOL_SIZE", cfg.pool_size)?;
        cfg.user_start = env_parse("USER_START", cfg.user_start)?;
        cfg.worker_index = env_parse("WORKER_INDEX", cfg.worker_index)?;
        cfg.worker_count = env_parse("WORKER_COUNT", cfg.worker_count)?;
        cfg.users_per_worker = env_parse("USERS_PER_WORKER", cfg.users_per_worker)?;
        cfg.churn_users = env_parse("CHURN_USERS", cfg.churn_users)?;
        cfg.connect_timeout = env_secs("CONNECT_TIMEOUT", cfg.connect_timeout)?;
        cfg.keepalive = env_secs("KEEPALIVE_SECS", cfg.keepalive)?;
        cfg.wait_min = env_secs("WAIT_MIN_SECS", cfg.wait_min)?;
        cfg.wait_max = env_secs("WAIT_MAX_SECS", cfg.wait_max)?;
        cfg.churn_hold_min = env_secs("CHURN_HOLD_MIN_SECS", cfg.churn_hold_min)?;
        cfg.churn_hold_max = env_secs("CHURN_HOLD_MAX_SECS", cfg.churn_hold_max)?;
        cfg.ramp_up = env_secs("RAMP_UP_SECS", cfg.ramp_up)?;
        cfg.run_duration = env_secs("RUN_DURATION_SECS", cfg.run_duration)?;
        if let Some(pattern) = env_string("TOPIC_PATTERN") {
            cfg.topic_pattern = pattern;
        }
        if let Some(payload) = env_string("EXPECTED_PAYLOAD") {
            cfg.expected_payload = payload;
        }
        cfg.report_addr = env_string("REPORT_ADDR");

        // Explicit MQTT_PORT wins; otherwise the scheme default.
        match env_string("MQTT_PORT") {
            Some(raw) => {
                cfg.port = raw.parse().map_err(|_| ConfigError::Invalid {
                    name: "MQTT_PORT",
                    value: raw,
                })?;
            }
            None => cfg.port = if cfg.use_tls { 8883 } else { 1883 },
        }

        if let Some(stack) = env_string("PROTOCOL_STACK") {
            cfg.stack = match stack.as_str() {
                "async" | "bridged" => ProtocolStack::Bridged,
                "blocking" | "threaded" => ProtocolStack::Blocking,
                _ => {
                    return Err(ConfigError::Invalid {
                        name: "PROTOCOL_STACK",
                        value: stack,
                    })
                }
            };
        }

        if let Some(url) = env_string("BROKER_URL") {
            cfg.apply_broker_url(&url)?;
        }

        Ok(cfg)
    }

    /// Parse an `mqtt://host[:port]` or `mqtts://host[:port]` URL into
    /// broker, port, and TLS mode.
    pub fn apply_broker_url(&mut self, url: &str) -> Result<(), ConfigError> {
        let (rest, tls) = if let Some(rest) = url.strip_prefix("mqtts://") {
            (rest, true)
        } else if let Some(rest) = url.strip_prefix("mqtt://") {
            (rest, false)
        } else {
            return Err(ConfigError::BadBrokerUrl(url.to_string()));
        };

        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port_str)) => {
                let port = port_str
                    .parse()
                    .map_err(|_| ConfigError::BadBrokerUrl(url.to_string()))?;
                (host, port)
            }
            None => (rest, if tls { 8883 } else { 1883 }),
        };
        if host.is_empty() {
            return Err(ConfigError::BadBrokerUrl(url.to_string()));
        }

        self.broker = host.to_string();
        self.port = port;
        self.use_tls = tls;
        Ok(())
    }

    /// Validate cross-field constraints. Called once after flags are applied.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.is_empty() {
            return Err(ConfigError::MissingBroker);
        }
        if self.worker_index >= self.worker_count {
            return Err(ConfigError::BadWorkerIndex {
                index: self.worker_index,
                count: self.worker_count,
            });
        }
        if self.pool_size < self.worker_count as u64 {
            return Err(ConfigError::PoolTooSmall {
                pool: self.pool_size,
                count: self.worker_count,
            });
        }
        if self.wait_min > self.wait_max {
            return Err(ConfigError::InvertedRange {
                name: "WAIT_MIN_SECS/WAIT_MAX_SECS",
                min: self.wait_min.as_secs(),
                max: self.wait_max.as_secs(),
            });
        }
        if self.churn_hold_min > self.churn_hold_max {
            return Err(ConfigError::InvertedRange {
                name: "CHURN_HOLD_MIN_SECS/CHURN_HOLD_MAX_SECS",
                min: self.churn_hold_min.as_secs(),
                max: self.churn_hold_max.as_secs(),
            });
        }
        Ok(())
    }

    /// This worker's slice of the identity space.
    pub fn partition(&self) -> WorkerPartition {
        WorkerPartition {
            index: self.worker_index,
            count: self.worker_count,
            pool_size: self.pool_size,
            start: self.user_start,
        }
    }

    /// Client identifier for an identity number.
    pub fn client_id(&self, identity: u64) -> String {
        format!("{}{}", self.user_prefix, identity)
    }

    /// Per-identity delivery topic.
    pub fn topic_for(&self, client_id: &str) -> String {
        self.topic_pattern.replace("{client_id}", client_id)
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env_string(name) {
        Some(raw) => raw
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value: raw }),
        None => Ok(default),
    }
}

fn env_secs(name: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    Ok(Duration::from_secs(env_parse(
        name,
        default.as_secs(),
    )?))
}

fn env_bool(name: &'static str, default: bool) -> Result<bool, ConfigError> {
    match env_string(name) {
        Some(raw) => match raw.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            _ => Err(ConfigError::Invalid { name, value: raw }),
        },
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_url_plain() {
        let mut cfg = Config::default();
        cfg.apply_broker_url("mqtt://broker.local:1884").unwrap();
        assert_eq!(cfg.broker, "broker.local");
        assert_eq!(cfg.port, 1884);
        assert!(!cfg.use_tls);
    }

    #[test]
    fn broker_url_tls_default_port() {
        let mut cfg = Config::default();
        cfg.apply_broker_url("mqtts://broker.local").unwrap();
        assert_eq!(cfg.broker, "broker.local");
        assert_eq!(cfg.port, 8883);
        assert!(cfg.use_tls);
    }

    #[test]
    fn broker_url_rejects_other_schemes() {
        let mut cfg = Config::default();
        assert!(cfg.apply_broker_url("http://broker.local").is_err());
        assert!(cfg.apply_broker_url("mqtt://").is_err());
        assert!(cfg.apply_broker_url("mqtt://host:notaport").is_err());
    }

    #[test]
    fn validate_rejects_bad_partition() {
        let mut cfg = Config {
            broker: "localhost".into(),
            ..Config::default()
        };
        cfg.worker_index = 3;
        cfg.worker_count = 3;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::BadWorkerIndex { .. })
        ));

        cfg.worker_index = 0;
        cfg.pool_size = 2;
        assert!(matches!(cfg.validate(), Err(ConfigError::PoolTooSmall { .. })));
    }

    #[test]
    fn validate_requires_broker() {
        let cfg = Config::default();
        assert!(matches!(cfg.validate(), Err(ConfigError::MissingBroker)));
    }

    #[test]
    fn topic_template_substitution() {
        let cfg = Config::default();
        assert_eq!(cfg.topic_for("user42"), "clients/user42/alerts");
        assert_eq!(cfg.client_id(42), "user42");
    }
}
