//! Push client configuration.
//!
//! All intervals are stored in plain seconds so the struct maps one-to-one
//! onto a TOML file; accessor methods convert to [`Duration`] at the call
//! site. Defaults are tuned for a long-lived background connection: a
//! server-side heartbeat request of 10s, client-side probing only as a
//! fallback, and a small sequential-error budget before the client gives up.
//!
//! The `Option` fields have no TOML spelling for `None`; an absent key means
//! the default, and disabling those features is done when constructing the
//! struct in code.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{PushError, Result};

/// Tunables for [`PushClient`](crate::client::PushClient).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PushClientConfig {
    /// Heartbeat interval requested from the server at login, in seconds.
    /// `None` omits the request.
    pub server_heartbeat_interval_secs: Option<u64>,

    /// Idle threshold after which the client sends its own heartbeat ping,
    /// in seconds. `None` disables client-side probing.
    pub client_heartbeat_interval_secs: Option<u64>,

    /// Acknowledge each data message with a selective ack so the server can
    /// drop it from its resend queue immediately.
    pub send_selective_acknowledgements: bool,

    /// Connection attempts per connect/reconnect cycle.
    pub connection_retry_count: u32,

    /// Base delay between connection attempts, in seconds. The actual delay
    /// grows quadratically with the attempt number.
    pub retry_base_delay_secs: f64,

    /// Minimum spacing between the previous login and a reconnect, in
    /// seconds.
    pub reset_interval_secs: f64,

    /// How long to wait for a heartbeat ack before resetting, in seconds.
    pub heartbeat_ack_timeout_secs: f64,

    /// Terminate after this many sequential errors of one kind. `None`
    /// retries forever.
    pub abort_on_sequential_error_count: Option<u32>,

    /// Health check cadence of the monitor task, in seconds.
    pub monitor_interval_secs: f64,

    /// Emission budget per distinct warning before it goes quiet for the
    /// rest of the session. `None` disables these warnings entirely.
    pub log_warn_limit: Option<u32>,

    /// Log full message contents at debug level.
    pub log_debug_verbose: bool,
}

impl Default for PushClientConfig {
    fn default() -> Self {
        Self {
            server_heartbeat_interval_secs: Some(10),
            client_heartbeat_interval_secs: Some(20),
            send_selective_acknowledgements: true,
            connection_retry_count: 5,
            retry_base_delay_secs: 3.0,
            reset_interval_secs: 1.0,
            heartbeat_ack_timeout_secs: 5.0,
            abort_on_sequential_error_count: Some(3),
            monitor_interval_secs: 1.0,
            log_warn_limit: Some(5),
            log_debug_verbose: false,
        }
    }
}

impl PushClientConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| PushError::Config(format!("Failed to read config file: {}", e)))?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check invariants the type system cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.connection_retry_count == 0 {
            return Err(PushError::Config(
                "connection_retry_count must be at least 1".to_string(),
            ));
        }
        if self.monitor_interval_secs <= 0.0 {
            return Err(PushError::Config(
                "monitor_interval_secs must be positive".to_string(),
            ));
        }
        for (name, value) in [
            ("retry_base_delay_secs", self.retry_base_delay_secs),
            ("reset_interval_secs", self.reset_interval_secs),
            ("heartbeat_ack_timeout_secs", self.heartbeat_ack_timeout_secs),
        ] {
            if value < 0.0 || !value.is_finite() {
                return Err(PushError::Config(format!(
                    "{} must be a non-negative number",
                    name
                )));
            }
        }
        Ok(())
    }

    /// Server heartbeat interval as a [`Duration`].
    pub fn server_heartbeat_interval(&self) -> Option<Duration> {
        self.server_heartbeat_interval_secs.map(Duration::from_secs)
    }

    /// Client heartbeat interval as a [`Duration`].
    pub fn client_heartbeat_interval(&self) -> Option<Duration> {
        self.client_heartbeat_interval_secs.map(Duration::from_secs)
    }

    /// Base delay between connection attempts.
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_secs_f64(self.retry_base_delay_secs)
    }

    /// Minimum spacing between login and reconnect.
    pub fn reset_interval(&self) -> Duration {
        Duration::from_secs_f64(self.reset_interval_secs)
    }

    /// Heartbeat ack wait.
    pub fn heartbeat_ack_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.heartbeat_ack_timeout_secs)
    }

    /// Monitor cadence.
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs_f64(self.monitor_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = PushClientConfig::default();
        assert_eq!(config.server_heartbeat_interval_secs, Some(10));
        assert_eq!(config.client_heartbeat_interval_secs, Some(20));
        assert!(config.send_selective_acknowledgements);
        assert_eq!(config.connection_retry_count, 5);
        assert_eq!(config.abort_on_sequential_error_count, Some(3));
        assert_eq!(config.log_warn_limit, Some(5));
        assert!(!config.log_debug_verbose);
        config.validate().unwrap();
    }

    #[test]
    fn test_duration_accessors() {
        let config = PushClientConfig::default();
        assert_eq!(config.server_heartbeat_interval(), Some(Duration::from_secs(10)));
        assert_eq!(config.retry_base_delay(), Duration::from_secs(3));
        assert_eq!(config.monitor_interval(), Duration::from_secs(1));

        let disabled = PushClientConfig {
            server_heartbeat_interval_secs: None,
            client_heartbeat_interval_secs: None,
            ..Default::default()
        };
        assert_eq!(disabled.server_heartbeat_interval(), None);
        assert_eq!(disabled.client_heartbeat_interval(), None);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = PushClientConfig {
            connection_retry_count: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = PushClientConfig {
            monitor_interval_secs: 0.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = PushClientConfig {
            retry_base_delay_secs: -1.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_from_toml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
client_heartbeat_interval_secs = 30
send_selective_acknowledgements = false
connection_retry_count = 2
log_warn_limit = 1
"#
        )
        .unwrap();

        let config = PushClientConfig::from_file(file.path()).unwrap();
        assert_eq!(config.client_heartbeat_interval_secs, Some(30));
        assert!(!config.send_selective_acknowledgements);
        assert_eq!(config.connection_retry_count, 2);
        assert_eq!(config.log_warn_limit, Some(1));
        // Unset keys keep their defaults.
        assert_eq!(config.server_heartbeat_interval_secs, Some(10));
    }

    #[test]
    fn test_config_from_file_rejects_invalid() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "connection_retry_count = 0").unwrap();
        assert!(matches!(
            PushClientConfig::from_file(file.path()),
            Err(PushError::Config(_))
        ));

        assert!(matches!(
            PushClientConfig::from_file("/nonexistent/push.toml"),
            Err(PushError::Config(_))
        ));
    }
}
