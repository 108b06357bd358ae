//! Configuration for device handlers
//!
//! `HandlerConfig` controls where a handler binds, how long discovery rounds
//! last and how long devices stay alive without being re-confirmed, and the
//! budgets of the description, SOAP and GENA exchanges.

use std::net::IpAddr;
use std::time::Duration;

use crate::error::{DlnaError, Result};

/// Configuration for a [`Handler`](crate::Handler)
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerConfig {
    /// Local address to bind; `None` detects the address of the interface
    /// routing toward the SSDP multicast group
    pub ip: Option<IpAddr>,

    /// Collection window of one M-SEARCH round
    /// Default: 2 seconds
    pub discovery_timeout: Duration,

    /// Time a device stays alive after its last sighting
    /// Default: 0 (a device must answer every round)
    pub alive_persistence: Duration,

    /// Delay between two polling rounds
    /// Default: 30 seconds
    pub polling_period: Duration,

    /// Alive persistence used for the first polling round, so nothing expires
    /// before one full scan completed
    /// Default: 86400 seconds
    pub first_round_persistence: Duration,

    /// Timeout of device and service description fetches
    /// Default: 5 seconds
    pub description_timeout: Duration,

    /// Default budget of a SOAP exchange; one extra second is granted on top
    /// Default: 5 seconds
    pub soap_timeout: Duration,

    /// Connect and idle read timeout of SOAP exchanges
    /// Default: 3 seconds
    pub soap_connect_timeout: Duration,

    /// Largest accepted SOAP response
    /// Default: 100 MiB
    pub soap_max_length: usize,

    /// Timeout of SUBSCRIBE and UNSUBSCRIBE requests
    /// Default: 5 seconds
    pub gena_timeout: Duration,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            ip: None,
            discovery_timeout: Duration::from_secs(2),
            alive_persistence: Duration::ZERO,
            polling_period: Duration::from_secs(30),
            first_round_persistence: Duration::from_secs(86_400),
            description_timeout: Duration::from_secs(5),
            soap_timeout: Duration::from_secs(5),
            soap_connect_timeout: Duration::from_secs(3),
            soap_max_length: 104_857_600,
            gena_timeout: Duration::from_secs(5),
        }
    }
}

impl HandlerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Short rounds and a tolerant persistence, for interactive use
    pub fn fast_discovery() -> Self {
        Self {
            discovery_timeout: Duration::from_secs(1),
            alive_persistence: Duration::from_secs(60),
            polling_period: Duration::from_secs(10),
            ..Default::default()
        }
    }

    /// Infrequent polling for long-running controllers
    pub fn low_traffic() -> Self {
        Self {
            alive_persistence: Duration::from_secs(180),
            polling_period: Duration::from_secs(120),
            ..Default::default()
        }
    }

    /// Validate the configuration and return any issues
    pub fn validate(&self) -> Result<()> {
        if self.discovery_timeout.is_zero() {
            return Err(DlnaError::Configuration(
                "Discovery timeout must be greater than 0".to_string(),
            ));
        }

        if self.polling_period.is_zero() {
            return Err(DlnaError::Configuration(
                "Polling period must be greater than 0".to_string(),
            ));
        }

        if self.first_round_persistence < self.alive_persistence {
            return Err(DlnaError::Configuration(
                "First round persistence must not be shorter than alive persistence".to_string(),
            ));
        }

        if self.description_timeout.is_zero()
            || self.soap_connect_timeout.is_zero()
            || self.gena_timeout.is_zero()
        {
            return Err(DlnaError::Configuration(
                "Request timeouts must be greater than 0".to_string(),
            ));
        }

        if self.soap_max_length == 0 {
            return Err(DlnaError::Configuration(
                "SOAP max length must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    pub fn with_ip(mut self, ip: IpAddr) -> Self {
        self.ip = Some(ip);
        self
    }

    pub fn with_discovery_timeout(mut self, timeout: Duration) -> Self {
        self.discovery_timeout = timeout;
        self
    }

    pub fn with_alive_persistence(mut self, persistence: Duration) -> Self {
        self.alive_persistence = persistence;
        self
    }

    pub fn with_polling_period(mut self, period: Duration) -> Self {
        self.polling_period = period;
        self
    }

    pub fn with_soap_timeout(mut self, timeout: Duration) -> Self {
        self.soap_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = HandlerConfig::default();
        assert_eq!(config.ip, None);
        assert_eq!(config.discovery_timeout, Duration::from_secs(2));
        assert_eq!(config.alive_persistence, Duration::ZERO);
        assert_eq!(config.polling_period, Duration::from_secs(30));
        assert_eq!(config.first_round_persistence, Duration::from_secs(86_400));
        assert_eq!(config.soap_max_length, 104_857_600);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_presets_are_valid() {
        assert!(HandlerConfig::fast_discovery().validate().is_ok());
        assert!(HandlerConfig::low_traffic().validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let zero_timeout = HandlerConfig::default().with_discovery_timeout(Duration::ZERO);
        assert!(matches!(
            zero_timeout.validate(),
            Err(DlnaError::Configuration(_))
        ));

        let short_first_round = HandlerConfig {
            alive_persistence: Duration::from_secs(100),
            first_round_persistence: Duration::from_secs(10),
            ..Default::default()
        };
        assert!(short_first_round.validate().is_err());

        let no_length = HandlerConfig {
            soap_max_length: 0,
            ..Default::default()
        };
        assert!(no_length.validate().is_err());
    }

    #[test]
    fn test_builder_methods() {
        let ip: IpAddr = "192.168.1.10".parse().unwrap();
        let config = HandlerConfig::new()
            .with_ip(ip)
            .with_polling_period(Duration::from_secs(5))
            .with_alive_persistence(Duration::from_secs(20))
            .with_soap_timeout(Duration::from_secs(8));
        assert_eq!(config.ip, Some(ip));
        assert_eq!(config.polling_period, Duration::from_secs(5));
        assert_eq!(config.alive_persistence, Duration::from_secs(20));
        assert_eq!(config.soap_timeout, Duration::from_secs(8));
    }
}
