//! Rebalancer configuration.

use std::time::Duration;

use crate::error::ConfigError;

/// Tuning knobs for the activation rebalancer.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use tidepool::rebalancer::RebalancerConfig;
///
/// let config = RebalancerConfig::builder()
///     .imbalance_threshold(0.05)
///     .max_dispersal_per_cycle(20)
///     .session_cycle_period(Duration::from_secs(5))
///     .build()
///     .expect("valid config");
/// assert_eq!(config.max_dispersal_per_cycle(), 20);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct RebalancerConfig {
    imbalance_threshold: f64,
    max_dispersal_per_cycle: u64,
    session_cycle_period: Duration,
    max_stagnant_cycles: u32,
    improvement_quantum: f64,
    report_period: Duration,
    rebalancer_due_time: Duration,
    message_rate_weight: f64,
}

impl Default for RebalancerConfig {
    fn default() -> Self {
        Self {
            imbalance_threshold: 0.1,
            max_dispersal_per_cycle: 100,
            session_cycle_period: Duration::from_secs(15),
            max_stagnant_cycles: 3,
            improvement_quantum: 0.01,
            report_period: Duration::from_secs(30),
            rebalancer_due_time: Duration::from_secs(60),
            message_rate_weight: 0.0,
        }
    }
}

impl RebalancerConfig {
    /// Start building a configuration from the defaults.
    pub fn builder() -> RebalancerConfigBuilder {
        RebalancerConfigBuilder::default()
    }

    /// Imbalance above which a session disperses load. Default 0.1.
    pub fn imbalance_threshold(&self) -> f64 {
        self.imbalance_threshold
    }

    /// Most activations one silo deactivates in a single cycle. Default 100.
    pub fn max_dispersal_per_cycle(&self) -> u64 {
        self.max_dispersal_per_cycle
    }

    /// Interval between cycles, and the pause after a completed session.
    /// Default 15s.
    pub fn session_cycle_period(&self) -> Duration {
        self.session_cycle_period
    }

    /// Consecutive cycles without improvement before a session fails.
    /// Default 3.
    pub fn max_stagnant_cycles(&self) -> u32 {
        self.max_stagnant_cycles
    }

    /// Smallest imbalance drop that counts as progress. Default 0.01.
    pub fn improvement_quantum(&self) -> f64 {
        self.improvement_quantum
    }

    /// Interval between unsolicited report pushes. Default 30s.
    pub fn report_period(&self) -> Duration {
        self.report_period
    }

    /// Delay before the first session after start-up. Default 60s.
    pub fn rebalancer_due_time(&self) -> Duration {
        self.rebalancer_due_time
    }

    /// Weight of the message rate in the load metric. Default 0
    /// (activation count only).
    pub fn message_rate_weight(&self) -> f64 {
        self.message_rate_weight
    }
}

/// Builder for [`RebalancerConfig`].
#[derive(Debug, Clone, Default)]
pub struct RebalancerConfigBuilder {
    config: RebalancerConfig,
}

impl RebalancerConfigBuilder {
    /// Set the imbalance threshold.
    pub fn imbalance_threshold(mut self, threshold: f64) -> Self {
        self.config.imbalance_threshold = threshold;
        self
    }

    /// Set the per-cycle dispersal cap.
    pub fn max_dispersal_per_cycle(mut self, limit: u64) -> Self {
        self.config.max_dispersal_per_cycle = limit;
        self
    }

    /// Set the session cycle period.
    pub fn session_cycle_period(mut self, period: Duration) -> Self {
        self.config.session_cycle_period = period;
        self
    }

    /// Set the stagnant cycle limit.
    pub fn max_stagnant_cycles(mut self, cycles: u32) -> Self {
        self.config.max_stagnant_cycles = cycles;
        self
    }

    /// Set the improvement quantum.
    pub fn improvement_quantum(mut self, quantum: f64) -> Self {
        self.config.improvement_quantum = quantum;
        self
    }

    /// Set the report period.
    pub fn report_period(mut self, period: Duration) -> Self {
        self.config.report_period = period;
        self
    }

    /// Set the start-up delay.
    pub fn rebalancer_due_time(mut self, due: Duration) -> Self {
        self.config.rebalancer_due_time = due;
        self
    }

    /// Set the message rate weight.
    pub fn message_rate_weight(mut self, weight: f64) -> Self {
        self.config.message_rate_weight = weight;
        self
    }

    /// Validate and build.
    pub fn build(self) -> Result<RebalancerConfig, ConfigError> {
        let config = self.config;
        if !(0.0..=1.0).contains(&config.imbalance_threshold) {
            return Err(ConfigError::OutOfRange {
                field: "imbalance_threshold",
                value: config.imbalance_threshold,
                min: 0.0,
                max: 1.0,
            });
        }
        if !(0.0..=1.0).contains(&config.improvement_quantum) {
            return Err(ConfigError::OutOfRange {
                field: "improvement_quantum",
                value: config.improvement_quantum,
                min: 0.0,
                max: 1.0,
            });
        }
        if !(config.message_rate_weight >= 0.0 && config.message_rate_weight.is_finite()) {
            return Err(ConfigError::OutOfRange {
                field: "message_rate_weight",
                value: config.message_rate_weight,
                min: 0.0,
                max: f64::MAX,
            });
        }
        if config.max_dispersal_per_cycle == 0 {
            return Err(ConfigError::Zero {
                field: "max_dispersal_per_cycle",
            });
        }
        if config.max_stagnant_cycles == 0 {
            return Err(ConfigError::Zero {
                field: "max_stagnant_cycles",
            });
        }
        if config.session_cycle_period.is_zero() {
            return Err(ConfigError::Zero {
                field: "session_cycle_period",
            });
        }
        if config.report_period.is_zero() {
            return Err(ConfigError::Zero {
                field: "report_period",
            });
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert_eq!(
            RebalancerConfig::builder().build(),
            Ok(RebalancerConfig::default())
        );
    }

    #[test]
    fn test_rejects_out_of_range_threshold() {
        let result = RebalancerConfig::builder().imbalance_threshold(1.5).build();
        assert!(matches!(
            result,
            Err(ConfigError::OutOfRange {
                field: "imbalance_threshold",
                ..
            })
        ));
        assert!(RebalancerConfig::builder()
            .imbalance_threshold(f64::NAN)
            .build()
            .is_err());
    }

    #[test]
    fn test_rejects_zero_limits() {
        assert_eq!(
            RebalancerConfig::builder().max_dispersal_per_cycle(0).build(),
            Err(ConfigError::Zero {
                field: "max_dispersal_per_cycle"
            })
        );
        assert_eq!(
            RebalancerConfig::builder()
                .session_cycle_period(Duration::ZERO)
                .build(),
            Err(ConfigError::Zero {
                field: "session_cycle_period"
            })
        );
    }
}
