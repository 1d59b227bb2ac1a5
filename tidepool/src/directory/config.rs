//! Directory configuration.

use std::time::Duration;

use crate::error::ConfigError;

/// Tuning knobs for the directory service and the grain locator.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use tidepool::directory::DirectoryConfig;
///
/// let config = DirectoryConfig::builder()
///     .max_hops(4)
///     .lazy_deregistration_delay(Duration::from_secs(30))
///     .build()
///     .expect("valid config");
/// assert_eq!(config.max_hops(), 4);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct DirectoryConfig {
    vnodes_per_silo: u32,
    max_hops: u32,
    forward_retry_delay: Duration,
    forward_retries: u32,
    request_timeout: Duration,
    lazy_deregistration_delay: Duration,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            vnodes_per_silo: 30,
            max_hops: 6,
            forward_retry_delay: Duration::from_millis(200),
            forward_retries: 2,
            request_timeout: Duration::from_secs(30),
            lazy_deregistration_delay: Duration::from_secs(60),
        }
    }
}

impl DirectoryConfig {
    /// Start building a configuration from the defaults.
    pub fn builder() -> DirectoryConfigBuilder {
        DirectoryConfigBuilder::default()
    }

    /// Virtual nodes placed on the ring per silo. Default 30.
    pub fn vnodes_per_silo(&self) -> u32 {
        self.vnodes_per_silo
    }

    /// Upper bound on forwarding hops. The effective limit is also capped
    /// by the number of active silos. Default 6.
    pub fn max_hops(&self) -> u32 {
        self.max_hops
    }

    /// Pause before re-resolving the owner on a forwarded request, and
    /// between transport retries. Default 200ms.
    pub fn forward_retry_delay(&self) -> Duration {
        self.forward_retry_delay
    }

    /// Extra attempts after a transport failure while forwarding. Default 2.
    pub fn forward_retries(&self) -> u32 {
        self.forward_retries
    }

    /// Deadline given to requests started by the locator. Default 30s.
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Grace window protecting young entries from
    /// `NonexistentActivation` unregistration. Default 60s.
    pub fn lazy_deregistration_delay(&self) -> Duration {
        self.lazy_deregistration_delay
    }
}

/// Builder for [`DirectoryConfig`].
#[derive(Debug, Clone, Default)]
pub struct DirectoryConfigBuilder {
    config: DirectoryConfig,
}

impl DirectoryConfigBuilder {
    /// Set virtual nodes per silo.
    pub fn vnodes_per_silo(mut self, vnodes: u32) -> Self {
        self.config.vnodes_per_silo = vnodes;
        self
    }

    /// Set the forwarding hop limit.
    pub fn max_hops(mut self, hops: u32) -> Self {
        self.config.max_hops = hops;
        self
    }

    /// Set the forwarding retry delay.
    pub fn forward_retry_delay(mut self, delay: Duration) -> Self {
        self.config.forward_retry_delay = delay;
        self
    }

    /// Set the number of transport retries when forwarding.
    pub fn forward_retries(mut self, retries: u32) -> Self {
        self.config.forward_retries = retries;
        self
    }

    /// Set the locator request timeout.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// Set the lazy deregistration grace window.
    pub fn lazy_deregistration_delay(mut self, delay: Duration) -> Self {
        self.config.lazy_deregistration_delay = delay;
        self
    }

    /// Validate and build.
    pub fn build(self) -> Result<DirectoryConfig, ConfigError> {
        let config = self.config;
        if config.vnodes_per_silo == 0 {
            return Err(ConfigError::Zero {
                field: "vnodes_per_silo",
            });
        }
        if config.max_hops == 0 {
            return Err(ConfigError::Zero { field: "max_hops" });
        }
        if config.request_timeout.is_zero() {
            return Err(ConfigError::Zero {
                field: "request_timeout",
            });
        }
        if config.forward_retry_delay >= config.request_timeout {
            return Err(ConfigError::Inconsistent(format!(
                "forward_retry_delay ({:?}) must be shorter than request_timeout ({:?})",
                config.forward_retry_delay, config.request_timeout
            )));
        }
        Ok(config)
    }
}
