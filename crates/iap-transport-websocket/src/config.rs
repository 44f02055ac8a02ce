//! WebSocket transport configuration

use iap_transport::{TransportError, TransportResult};
use std::time::Duration;
use url::Url;

pub const DEFAULT_PROXY_HOST: &str = "tunnel.cloudproxy.app";
pub const DEFAULT_PROXY_PATH: &str = "/v4/connect";
pub const DEFAULT_ORIGIN: &str = "bot:iap-tunneler";
pub const DEFAULT_SUBPROTOCOL: &str = "relay.tunnel.cloudproxy.app";

/// The backend the relay should connect the tunnel to
///
/// Empty fields are left out of the connect URL.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IapTarget {
    pub project: String,
    pub zone: String,
    pub instance: String,
    /// Network interface of the instance (e.g. "nic0")
    pub interface: String,
    pub port: String,
    pub network: String,
    pub region: String,
    /// Destination host when tunneling to a non-instance destination group
    pub host: String,
    /// Destination group name
    pub group: String,
}

impl IapTarget {
    /// Target a port on a VM instance
    pub fn instance(project: &str, zone: &str, instance: &str, port: u16) -> Self {
        Self {
            project: project.to_string(),
            zone: zone.to_string(),
            instance: instance.to_string(),
            interface: "nic0".to_string(),
            port: port.to_string(),
            ..Default::default()
        }
    }

    /// Target a host inside a destination group
    pub fn host(project: &str, region: &str, network: &str, host: &str, port: u16) -> Self {
        Self {
            project: project.to_string(),
            region: region.to_string(),
            network: network.to_string(),
            host: host.to_string(),
            port: port.to_string(),
            ..Default::default()
        }
    }

    pub fn with_interface(mut self, interface: &str) -> Self {
        self.interface = interface.to_string();
        self
    }

    pub fn with_group(mut self, group: &str) -> Self {
        self.group = group.to_string();
        self
    }

    /// Query parameters in key order, empty values dropped
    fn query_pairs(&self) -> Vec<(&'static str, &str)> {
        let mut pairs = vec![
            ("group", self.group.as_str()),
            ("host", self.host.as_str()),
            ("instance", self.instance.as_str()),
            ("interface", self.interface.as_str()),
            ("network", self.network.as_str()),
            ("port", self.port.as_str()),
            ("project", self.project.as_str()),
            ("region", self.region.as_str()),
            ("zone", self.zone.as_str()),
        ];
        pairs.retain(|(_, value)| !value.is_empty());
        pairs
    }

    pub fn validate(&self) -> TransportResult<()> {
        if self.project.is_empty() {
            return Err(TransportError::Configuration(
                "Target project is required".to_string(),
            ));
        }
        if self.port.is_empty() || self.port.parse::<u16>().is_err() {
            return Err(TransportError::Configuration(format!(
                "Invalid target port: '{}'",
                self.port
            )));
        }
        if self.instance.is_empty() && self.host.is_empty() {
            return Err(TransportError::Configuration(
                "Target needs either an instance or a host".to_string(),
            ));
        }
        Ok(())
    }
}

/// WebSocket-specific configuration
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Relay host name
    pub proxy_host: String,

    /// Relay connect path (e.g., "/v4/connect")
    pub proxy_path: String,

    /// Origin header sent with the upgrade request
    pub origin: String,

    /// WebSocket subprotocol requested from the relay
    pub subprotocol: String,

    /// OAuth bearer token
    pub token: String,

    /// Bound on TCP connect, TLS and WebSocket upgrade together
    pub connect_timeout: Duration,

    /// Maximum message size accepted from the relay
    pub max_message_size: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            proxy_host: DEFAULT_PROXY_HOST.to_string(),
            proxy_path: DEFAULT_PROXY_PATH.to_string(),
            origin: DEFAULT_ORIGIN.to_string(),
            subprotocol: DEFAULT_SUBPROTOCOL.to_string(),
            token: String::new(),
            connect_timeout: Duration::from_secs(30),
            max_message_size: 1024 * 1024, // 1MB
        }
    }
}

impl WebSocketConfig {
    /// Create a configuration for the public relay with the given token
    pub fn with_token(token: &str) -> Self {
        Self {
            token: token.to_string(),
            ..Default::default()
        }
    }

    /// Set relay host
    pub fn with_proxy_host(mut self, host: &str) -> Self {
        self.proxy_host = host.to_string();
        self
    }

    /// Set relay connect path
    pub fn with_path(mut self, path: &str) -> Self {
        self.proxy_path = path.to_string();
        self
    }

    /// Set custom connect timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn validate(&self) -> TransportResult<()> {
        if self.proxy_host.is_empty() {
            return Err(TransportError::Configuration(
                "Proxy host cannot be empty".to_string(),
            ));
        }
        if self.proxy_path.is_empty() || !self.proxy_path.starts_with('/') {
            return Err(TransportError::Configuration(
                "WebSocket path must start with '/'".to_string(),
            ));
        }
        if self.token.is_empty() {
            return Err(TransportError::Configuration(
                "Bearer token is required".to_string(),
            ));
        }
        if self.connect_timeout.is_zero() {
            return Err(TransportError::Configuration(
                "Connect timeout must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Build the relay URL for `target`
    pub fn connect_url(&self, target: &IapTarget) -> TransportResult<Url> {
        let mut url = Url::parse(&format!("wss://{}{}", self.proxy_host, self.proxy_path))
            .map_err(|e| TransportError::Configuration(format!("Invalid URL: {}", e)))?;

        let pairs = target.query_pairs();
        if !pairs.is_empty() {
            url.query_pairs_mut().extend_pairs(pairs);
        }
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_config_default() {
        let config = WebSocketConfig::default();
        assert_eq!(config.proxy_host, "tunnel.cloudproxy.app");
        assert_eq!(config.proxy_path, "/v4/connect");
        assert_eq!(config.connect_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_config_requires_token() {
        assert!(WebSocketConfig::default().validate().is_err());
        assert!(WebSocketConfig::with_token("ya29.token").validate().is_ok());
    }

    #[test]
    fn test_invalid_path_validation() {
        let config = WebSocketConfig::with_token("t").with_path("invalid");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_connect_url_for_instance() {
        let config = WebSocketConfig::with_token("t");
        let target = IapTarget::instance("my-project", "europe-west1-b", "vm-1", 22);

        let url = config.connect_url(&target).unwrap();
        assert_eq!(
            url.as_str(),
            "wss://tunnel.cloudproxy.app/v4/connect?instance=vm-1&interface=nic0&port=22&project=my-project&zone=europe-west1-b"
        );
    }

    #[test]
    fn test_connect_url_for_host_group() {
        let config = WebSocketConfig::with_token("t").with_proxy_host("relay.internal");
        let target = IapTarget::host("p", "us-central1", "default", "10.0.0.5", 5432)
            .with_group("databases");

        let url = config.connect_url(&target).unwrap();
        assert_eq!(url.host_str(), Some("relay.internal"));

        let keys: Vec<String> = url.query_pairs().map(|(k, _)| k.into_owned()).collect();
        assert_eq!(
            keys,
            vec!["group", "host", "network", "port", "project", "region"]
        );
    }

    #[test]
    fn test_target_validation() {
        assert!(IapTarget::instance("p", "z", "vm", 22).validate().is_ok());
        assert!(IapTarget::default().validate().is_err());

        let mut no_backend = IapTarget::instance("p", "z", "vm", 22);
        no_backend.instance.clear();
        assert!(no_backend.validate().is_err());
    }
}
