//! Service configuration parameters
//!
//! All tunables of the relay daemon. Every field has a default, so an
//! empty JSON object (or no file at all) yields a usable configuration
//! with the simulated co-processor.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;
use crate::rpc::negotiate::MAX_BUFFER_LEN;

/// Service name the IPC endpoint is published under.
pub const SERVICE_NAME: &str = "com.intel.security.service.ISEPService";

/// Interface token every request envelope starts with.
pub const INTERFACE_DESCRIPTOR: &str = "com.intel.security.service.ISEPService";

/// How the daemon reaches the co-processor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportConfig {
    /// MEI character device.
    Device { path: PathBuf },
    /// In-process simulation with these apps pre-installed.
    Simulated { preinstalled: Vec<String> },
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::Simulated {
            preinstalled: Vec::new(),
        }
    }
}

/// Core service configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    // --- Endpoint ---
    pub service_name: String,
    /// Interface token checked on every request
    pub interface_descriptor: String,
    /// Unix socket the IPC endpoint listens on
    pub socket_path: PathBuf,
    /// Dispatcher worker threads
    pub worker_threads: usize,

    // --- Co-processor ---
    pub transport: TransportConfig,
    /// Logical client addressed on the co-processor
    pub client_guid: Uuid,
    /// Event pump poll interval (milliseconds)
    pub event_poll_interval_ms: u64,

    // --- Features ---
    /// Accept RegisterEventCb / StartInstance with a handler
    pub events_enabled: bool,
    /// Accept Install / Uninstall
    pub install_enabled: bool,
    /// First-attempt capacity used by negotiating clients
    pub default_buffer_len: u32,

    /// `log` level filter name, overridden by `RUST_LOG`
    pub log_level: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            service_name: SERVICE_NAME.into(),
            interface_descriptor: INTERFACE_DESCRIPTOR.into(),
            socket_path: PathBuf::from("/dev/socket/ihaproxy"),
            worker_threads: 4,

            transport: TransportConfig::default(),
            client_guid: Uuid::nil(),
            event_poll_interval_ms: 50,

            events_enabled: true,
            install_enabled: true,
            default_buffer_len: 256,

            log_level: "info".into(),
        }
    }
}

impl ServiceConfig {
    /// Read and validate a JSON configuration file.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path).map_err(|_| Error::Config("cannot read config file"))?;
        let cfg: Self = serde_json::from_str(&text).map_err(|_| Error::Config("malformed config JSON"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.service_name.is_empty() {
            return Err(Error::Config("service_name must not be empty"));
        }
        if self.interface_descriptor.is_empty() {
            return Err(Error::Config("interface_descriptor must not be empty"));
        }
        if !(1..=64).contains(&self.worker_threads) {
            return Err(Error::Config("worker_threads must be 1–64"));
        }
        if !(1..=MAX_BUFFER_LEN).contains(&self.default_buffer_len) {
            return Err(Error::Config("default_buffer_len must be 1–65535"));
        }
        if !(1..=10_000).contains(&self.event_poll_interval_ms) {
            return Err(Error::Config("event_poll_interval_ms must be 1–10000"));
        }
        if let TransportConfig::Device { path } = &self.transport {
            if path.as_os_str().is_empty() {
                return Err(Error::Config("transport device path must not be empty"));
            }
            if self.client_guid.is_nil() {
                return Err(Error::Config("client_guid is required for the device transport"));
            }
        }
        if self.log_level.parse::<log::LevelFilter>().is_err() {
            return Err(Error::Config("log_level is not a valid level"));
        }
        Ok(())
    }

    pub fn level_filter(&self) -> log::LevelFilter {
        self.log_level.parse().unwrap_or(log::LevelFilter::Info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_is_valid() {
        let c = ServiceConfig::default();
        assert_eq!(c.validate(), Ok(()));
        assert_eq!(c.service_name, c.interface_descriptor);
        assert!(c.default_buffer_len <= MAX_BUFFER_LEN);
    }

    #[test]
    fn empty_object_yields_defaults() {
        let c: ServiceConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(c, ServiceConfig::default());
    }

    #[test]
    fn device_transport_requires_guid() {
        let mut c = ServiceConfig {
            transport: TransportConfig::Device {
                path: "/dev/mei0".into(),
            },
            ..ServiceConfig::default()
        };
        assert!(c.validate().is_err());
        c.client_guid = Uuid::from_u128(0x1234);
        assert_eq!(c.validate(), Ok(()));
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        let c = ServiceConfig {
            worker_threads: 0,
            ..ServiceConfig::default()
        };
        assert!(c.validate().is_err());
        let c = ServiceConfig {
            default_buffer_len: 70_000,
            ..ServiceConfig::default()
        };
        assert!(c.validate().is_err());
        let c = ServiceConfig {
            log_level: "chatty".into(),
            ..ServiceConfig::default()
        };
        assert!(c.validate().is_err());
    }

    #[test]
    fn load_from_file() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(
            f,
            r#"{{"worker_threads": 2, "transport": {{"simulated": {{"preinstalled": ["otp"]}}}}}}"#
        )
        .unwrap();
        let c = ServiceConfig::load(f.path()).unwrap();
        assert_eq!(c.worker_threads, 2);
        assert_eq!(
            c.transport,
            TransportConfig::Simulated {
                preinstalled: vec!["otp".into()]
            }
        );
    }

    #[test]
    fn postcard_roundtrip() {
        let c = ServiceConfig::default();
        let bytes = postcard::to_allocvec(&c).unwrap();
        let c2: ServiceConfig = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(c, c2);
    }
}
