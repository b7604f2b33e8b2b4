//! # Client Configuration
//!
//! Endpoints, pool bounds, protocol choice, and deadlines for one client.
//! Loadable from JSON; durations are written as milliseconds.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use rkv_common::{ProtocolVersion, RkvError, RkvResult};

/// Configuration for the pool and dispatchers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Master addresses, e.g. "127.0.0.1:6379".
    pub masters: Vec<String>,
    /// Replica addresses; only used for reads when `read_from_replicas` is set.
    pub replicas: Vec<String>,
    /// Protocol to request at handshake.
    pub protocol: ProtocolVersion,
    /// Maximum idle connections kept per role.
    pub max_idle: usize,
    /// Maximum total connections (idle + in-use) per role.
    pub max_total: usize,
    #[serde(rename = "connect_timeout_ms", with = "millis")]
    pub connect_timeout: Duration,
    /// Deadline for one reply (or one pipeline of replies).
    #[serde(rename = "command_timeout_ms", with = "millis")]
    pub command_timeout: Duration,
    /// How long `checkout` waits when the role is at `max_total`.
    #[serde(rename = "checkout_timeout_ms", with = "millis")]
    pub checkout_timeout: Duration,
    /// Sent with `CLIENT SETNAME` after the handshake.
    pub client_name: Option<String>,
    pub read_from_replicas: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            masters: vec!["127.0.0.1:6379".to_string()],
            replicas: Vec::new(),
            protocol: ProtocolVersion::Resp2,
            max_idle: 8,
            max_total: 16,
            connect_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(5),
            checkout_timeout: Duration::from_secs(5),
            client_name: None,
            read_from_replicas: false,
        }
    }
}

impl ClientConfig {
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }

    /// Parses and validates a JSON document; missing fields take defaults.
    pub fn from_json(text: &str) -> RkvResult<Self> {
        let config: ClientConfig = serde_json::from_str(text)
            .map_err(|err| RkvError::Config(format!("invalid client config: {}", err)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> RkvResult<String> {
        serde_json::to_string_pretty(self).map_err(|err| RkvError::Config(err.to_string()))
    }

    pub fn validate(&self) -> RkvResult<()> {
        if self.masters.is_empty() {
            return Err(RkvError::Config("at least one master address is required".into()));
        }
        if self.max_total == 0 {
            return Err(RkvError::Config("max_total must be greater than zero".into()));
        }
        if self.max_idle > self.max_total {
            return Err(RkvError::Config(format!(
                "max_idle ({}) exceeds max_total ({})",
                self.max_idle, self.max_total
            )));
        }
        if self.read_from_replicas && self.replicas.is_empty() {
            return Err(RkvError::Config(
                "read_from_replicas is set but no replicas are configured".into(),
            ));
        }
        Ok(())
    }
}

/// Fluent builder over [`ClientConfig`]; `build` validates.
#[derive(Debug, Clone, Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
    masters_set: bool,
}

impl ClientConfigBuilder {
    /// Adds a master address. The first call replaces the default address.
    pub fn master(mut self, addr: impl Into<String>) -> Self {
        if !self.masters_set {
            self.config.masters.clear();
            self.masters_set = true;
        }
        self.config.masters.push(addr.into());
        self
    }

    pub fn replica(mut self, addr: impl Into<String>) -> Self {
        self.config.replicas.push(addr.into());
        self
    }

    pub fn protocol(mut self, protocol: ProtocolVersion) -> Self {
        self.config.protocol = protocol;
        self
    }

    pub fn max_idle(mut self, max_idle: usize) -> Self {
        self.config.max_idle = max_idle;
        self
    }

    pub fn max_total(mut self, max_total: usize) -> Self {
        self.config.max_total = max_total;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.config.command_timeout = timeout;
        self
    }

    pub fn checkout_timeout(mut self, timeout: Duration) -> Self {
        self.config.checkout_timeout = timeout;
        self
    }

    pub fn client_name(mut self, name: impl Into<String>) -> Self {
        self.config.client_name = Some(name.into());
        self
    }

    pub fn read_from_replicas(mut self, enabled: bool) -> Self {
        self.config.read_from_replicas = enabled;
        self
    }

    pub fn build(self) -> RkvResult<ClientConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
