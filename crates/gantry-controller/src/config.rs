//! Controller configuration.
//!
//! Every field has a default, so an empty file (or no file at all) is a valid
//! configuration.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::Context;
use gantry_api::shared::Duration;
use gantry_core::backoff::Backoff;
use gantry_core::xds::{ServerConfig, TlsConfig};
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub(crate) struct Config {
    /// The name written into route statuses. Only GatewayClasses that name
    /// this controller are translated.
    pub controller_name: String,

    /// Only publish resources for this GatewayClass. When unset, every class
    /// in the resource file is published.
    pub gateway_class_name: Option<String>,

    pub merge_gateways: bool,

    /// The default log filter. `RUST_LOG` and `--log-level` both override it.
    pub log_level: String,

    pub xds: XdsConfig,
    pub provider: ProviderConfig,
    pub backoff: Backoff,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            controller_name: "gantry.io/gateway-controller".to_string(),
            gateway_class_name: None,
            merge_gateways: false,
            log_level: "info".to_string(),
            xds: XdsConfig::default(),
            provider: ProviderConfig::default(),
            backoff: Backoff::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub(crate) struct XdsConfig {
    pub address: SocketAddr,
    pub keepalive_interval: Duration,
    pub keepalive_timeout: Option<Duration>,

    /// Credentials for serving xDS over mutual TLS. Required unless
    /// `insecure` is set.
    pub tls: Option<TlsPaths>,

    /// Serve plaintext xDS when no TLS credentials are configured. Only for
    /// local development.
    pub insecure: bool,
}

impl Default for XdsConfig {
    fn default() -> Self {
        Self {
            address: SocketAddr::from(([0, 0, 0, 0], 18000)),
            keepalive_interval: Duration::from_secs(15),
            keepalive_timeout: None,
            tls: None,
            insecure: false,
        }
    }
}

/// Paths to PEM files. Proxies must present a certificate signed by
/// `client_ca`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub(crate) struct TlsPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
    pub client_ca: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub(crate) struct ProviderConfig {
    /// How often to re-read the resource file.
    pub poll_interval: Duration,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file, or use the defaults if there's no
    /// file.
    pub(crate) fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };

        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::parse(&contents).with_context(|| format!("invalid config file {}", path.display()))
    }

    fn parse(contents: &str) -> anyhow::Result<Self> {
        // an empty YAML document is null, not an empty map
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yml::from_str(contents)?)
    }

    /// The xDS server config, with any TLS credentials loaded from disk.
    pub(crate) fn server_config(&self) -> anyhow::Result<ServerConfig> {
        let tls = match (&self.xds.tls, self.xds.insecure) {
            (Some(paths), _) => Some(
                TlsConfig::from_files(&paths.cert, &paths.key, &paths.client_ca)
                    .context("failed to load xds server credentials")?,
            ),
            (None, true) => None,
            (None, false) => anyhow::bail!(
                "xds.tls is required. set xds.insecure to serve plaintext xds instead"
            ),
        };

        Ok(ServerConfig {
            address: self.xds.address,
            keepalive_interval: Some(self.xds.keepalive_interval.into()),
            keepalive_timeout: self.xds.keepalive_timeout.map(Into::into),
            tls,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config, Config::default());
        assert!(!config.xds.insecure);
    }

    #[test]
    fn test_tls_required() {
        let config = Config::default();
        let err = config.server_config().unwrap_err();
        assert!(err.to_string().contains("xds.tls is required"));
    }

    #[test]
    fn test_insecure_opt_in() {
        let config = Config::parse("xds:\n  insecure: true\n").unwrap();

        let server = config.server_config().unwrap();
        assert_eq!(server.address, "0.0.0.0:18000".parse().unwrap());
        assert_eq!(
            server.keepalive_interval,
            Some(std::time::Duration::from_secs(15))
        );
        assert!(server.tls.is_none());
    }

    #[test]
    fn test_parse() {
        let config = Config::parse(
            r#"
controller_name: example.com/controller
merge_gateways: true
xds:
  address: 127.0.0.1:9000
  keepalive_interval: 30s
  keepalive_timeout: 2.5
provider:
  poll_interval: 500ms
backoff:
  maxAttempts: -1
  ceiling: 10
"#,
        )
        .unwrap();

        assert_eq!(config.controller_name, "example.com/controller");
        assert!(config.merge_gateways);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.xds.address, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.xds.keepalive_interval, Duration::from_secs(30));
        assert_eq!(
            config.xds.keepalive_timeout,
            Some(Duration::from_millis(2500))
        );
        assert_eq!(config.provider.poll_interval, Duration::from_millis(500));
        assert_eq!(config.backoff.ceiling, Some(10));
    }

    #[test]
    fn test_unknown_tls_file() {
        let config = Config::parse(
            r#"
xds:
  tls:
    cert: /nope/tls.crt
    key: /nope/tls.key
    client_ca: /nope/ca.crt
"#,
        )
        .unwrap();

        assert!(config.server_config().is_err());
    }
}
