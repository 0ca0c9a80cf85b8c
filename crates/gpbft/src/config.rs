//! Instance configuration.

use std::time::Duration;
use thiserror::Error;

/// Errors produced by configuration validation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("delta must be positive")]
    NonPositiveDelta,

    #[error("delta backoff exponent must be at least 1")]
    DeltaBackOffExponentTooSmall,

    #[error("quality delta multiplier must be positive")]
    NonPositiveQualityMultiplier,

    #[error("rebroadcast backoff base must be positive")]
    NonPositiveRebroadcastBase,

    #[error("rebroadcast backoff exponent must be at least 1")]
    RebroadcastExponentTooSmall,

    #[error("rebroadcast backoff max must be at least the base")]
    RebroadcastMaxBelowBase,
}

/// Configuration of one consensus instance.
#[derive(Debug, Clone)]
pub struct GpbftConfig {
    /// Base of the synchrony timeout: a phase waits `2·delta` (scaled by the
    /// round backoff) before giving up on further messages.
    pub delta: Duration,

    /// Growth factor of the phase timeout per round.
    pub delta_back_off_exponent: f64,

    /// Additional timeout multiplier applied to the QUALITY phase only.
    pub quality_delta_multi: f64,

    /// Maximum number of rounds ahead of the current round for which
    /// spammable messages (no justification, round > 0) are accepted.
    pub max_lookahead_rounds: u64,

    /// Number of instances back at which the committee for an instance is
    /// fixed. Carried for the host's committee lookups; the core never reads
    /// it.
    pub committee_lookback: u64,

    /// First wait of the rebroadcast backoff sequence.
    pub rebroadcast_backoff_base: Duration,

    /// Growth factor of successive rebroadcast waits.
    pub rebroadcast_backoff_exponent: f64,

    /// Upper bound on any rebroadcast wait.
    pub rebroadcast_backoff_max: Duration,

    /// Once the round exceeds this threshold, rebroadcast is scheduled from
    /// the current time rather than the phase timeout, avoiding long radio
    /// silence as phase timeouts grow exponentially large.
    pub rebroadcast_immediately_after_round: u64,
}

impl Default for GpbftConfig {
    fn default() -> Self {
        Self {
            delta: Duration::from_secs(3),
            delta_back_off_exponent: 1.3,
            quality_delta_multi: 1.0,
            max_lookahead_rounds: 5,
            committee_lookback: 10,
            rebroadcast_backoff_base: Duration::from_secs(3),
            rebroadcast_backoff_exponent: 1.3,
            rebroadcast_backoff_max: Duration::from_secs(30),
            rebroadcast_immediately_after_round: 3,
        }
    }
}

impl GpbftConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.delta.is_zero() {
            return Err(ConfigError::NonPositiveDelta);
        }
        if self.delta_back_off_exponent < 1.0 {
            return Err(ConfigError::DeltaBackOffExponentTooSmall);
        }
        if self.quality_delta_multi <= 0.0 {
            return Err(ConfigError::NonPositiveQualityMultiplier);
        }
        if self.rebroadcast_backoff_base.is_zero() {
            return Err(ConfigError::NonPositiveRebroadcastBase);
        }
        if self.rebroadcast_backoff_exponent < 1.0 {
            return Err(ConfigError::RebroadcastExponentTooSmall);
        }
        if self.rebroadcast_backoff_max < self.rebroadcast_backoff_base {
            return Err(ConfigError::RebroadcastMaxBelowBase);
        }
        Ok(())
    }

    /// The synchrony delay for a round: `2·delta·multi·β^round`.
    pub fn synchrony_delay(&self, round: u64, multiplier: f64) -> Duration {
        let delta = self.delta.as_secs_f64()
            * multiplier
            * self.delta_back_off_exponent.powf(round as f64);
        Duration::from_secs_f64(2.0 * delta)
    }

    /// The wait before rebroadcast attempt `attempts + 1`, growing
    /// exponentially and capped at the configured maximum.
    pub fn rebroadcast_backoff(&self, attempts: u32) -> Duration {
        let backoff = self.rebroadcast_backoff_base.as_secs_f64()
            * self.rebroadcast_backoff_exponent.powf(attempts as f64);
        Duration::from_secs_f64(backoff).min(self.rebroadcast_backoff_max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(GpbftConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_knobs() {
        let mut config = GpbftConfig::default();
        config.delta = Duration::ZERO;
        assert_eq!(config.validate(), Err(ConfigError::NonPositiveDelta));

        let mut config = GpbftConfig::default();
        config.delta_back_off_exponent = 0.9;
        assert_eq!(
            config.validate(),
            Err(ConfigError::DeltaBackOffExponentTooSmall)
        );

        let mut config = GpbftConfig::default();
        config.rebroadcast_backoff_max = Duration::from_millis(1);
        assert_eq!(config.validate(), Err(ConfigError::RebroadcastMaxBelowBase));
    }

    #[test]
    fn test_synchrony_delay_grows_per_round() {
        let config = GpbftConfig::default();
        let base = config.synchrony_delay(0, 1.0);
        assert_eq!(base, Duration::from_secs(6));
        assert!(config.synchrony_delay(1, 1.0) > base);
        assert!(config.synchrony_delay(5, 1.0) > config.synchrony_delay(4, 1.0));
        // Quality multiplier scales linearly.
        assert_eq!(config.synchrony_delay(0, 2.0), Duration::from_secs(12));
    }

    #[test]
    fn test_rebroadcast_backoff_monotone_and_capped() {
        let config = GpbftConfig::default();
        let mut last = Duration::ZERO;
        for attempts in 0..20 {
            let backoff = config.rebroadcast_backoff(attempts);
            assert!(backoff >= last);
            assert!(backoff <= config.rebroadcast_backoff_max);
            last = backoff;
        }
        assert_eq!(config.rebroadcast_backoff(19), config.rebroadcast_backoff_max);
    }
}
