//! gRPC client configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use service_kit::{ConfigBuilder, ConfigError};

use super::keepalive::{millis, millis_opt, ClientKeepAlive};
use crate::error::Error;

/// Configuration for gRPC clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// `host:port` of the server. A URI with a scheme is used as is.
    pub address: String,
    pub keep_alive: ClientKeepAlive,
    #[serde(rename = "connect_timeout_ms", with = "millis")]
    pub connect_timeout: Duration,
    /// Per-request deadline. No deadline when unset.
    #[serde(rename = "timeout_ms", with = "millis_opt")]
    pub timeout: Option<Duration>,
    pub tcp_nodelay: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: "[::1]:50051".to_string(),
            keep_alive: ClientKeepAlive::default(),
            connect_timeout: Duration::from_secs(10),
            timeout: None,
            tcp_nodelay: true,
        }
    }
}

impl ClientConfig {
    /// Create a new configuration builder.
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::new()
    }

    /// The URI dialled for `address`.
    pub fn endpoint_uri(&self) -> Result<String, Error> {
        let address = self.address.trim();
        if address.is_empty() {
            return Err(Error::InvalidEndpoint("address must not be empty".to_string()));
        }

        if address.contains("://") {
            Ok(address.to_string())
        } else {
            Ok(format!("http://{address}"))
        }
    }
}

/// Builder for [`ClientConfig`] layering explicit values over loaded ones.
#[derive(Default)]
pub struct ClientConfigBuilder {
    inner: ConfigBuilder,
    address: Option<String>,
    timeout: Option<Duration>,
    connect_timeout: Option<Duration>,
    keep_alive: Option<ClientKeepAlive>,
}

impl ClientConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load environment variables from `.env` file.
    pub fn with_dotenv(mut self) -> Self {
        self.inner = self.inner.with_dotenv();
        self
    }

    /// Load a configuration file.
    pub fn with_config_file(mut self, path: impl Into<std::path::PathBuf>) -> Self {
        self.inner = self.inner.with_config_file(path);
        self
    }

    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.inner = self.inner.with_env_prefix(prefix);
        self
    }

    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn keep_alive(mut self, keep_alive: ClientKeepAlive) -> Self {
        self.keep_alive = Some(keep_alive);
        self
    }

    /// Build the configuration.
    pub fn build(self) -> Result<ClientConfig, ConfigError> {
        let mut config: ClientConfig = self.inner.build()?;

        if let Some(address) = self.address {
            config.address = address;
        }
        if let Some(timeout) = self.timeout {
            config.timeout = Some(timeout);
        }
        if let Some(connect_timeout) = self.connect_timeout {
            config.connect_timeout = connect_timeout;
        }
        if let Some(keep_alive) = self.keep_alive {
            config.keep_alive = keep_alive;
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientParameters;

    #[test]
    fn client_config_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.address, "[::1]:50051");
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert!(config.timeout.is_none());
        assert!(config.keep_alive.client_parameters.time.is_zero());
    }

    #[test]
    fn endpoint_uri_adds_scheme() {
        let config = ClientConfig::default();
        assert_eq!(config.endpoint_uri().unwrap(), "http://[::1]:50051");

        let config = ClientConfig {
            address: "https://api.example.com:443".to_string(),
            ..Default::default()
        };
        assert_eq!(config.endpoint_uri().unwrap(), "https://api.example.com:443");
    }

    #[test]
    fn endpoint_uri_rejects_empty_address() {
        let config = ClientConfig {
            address: String::new(),
            ..Default::default()
        };
        assert!(matches!(
            config.endpoint_uri(),
            Err(Error::InvalidEndpoint(_))
        ));
    }

    #[test]
    fn builder_overrides_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.toml");
        std::fs::write(
            &path,
            r#"
            address = "file.example.com:50051"
            timeout_ms = 1500

            [keep_alive.client_parameters]
            time_ms = 30000
            "#,
        )
        .unwrap();

        let config = ClientConfig::builder()
            .with_config_file(&path)
            .address("override.example.com:9000")
            .build()
            .unwrap();

        assert_eq!(config.address, "override.example.com:9000");
        assert_eq!(config.timeout, Some(Duration::from_millis(1500)));
        assert_eq!(
            config.keep_alive.client_parameters.time,
            Duration::from_secs(30)
        );
    }

    #[test]
    fn builder_sets_keep_alive() {
        let keep_alive = ClientKeepAlive {
            client_parameters: ClientParameters {
                permit_without_stream: true,
                ..Default::default()
            },
        };

        let config = ClientConfig::builder()
            .keep_alive(keep_alive)
            .connect_timeout(Duration::from_secs(2))
            .build()
            .unwrap();

        assert!(config.keep_alive.client_parameters.permit_without_stream);
        assert_eq!(config.connect_timeout, Duration::from_secs(2));
    }
}
