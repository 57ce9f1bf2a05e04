//! Runtime settings for clipq-seq
//!
//! Derives the typed settings of every component from the bootstrap
//! [`TomlConfig`]. Values that would make a component misbehave (zero
//! workers, a zero-length claim) are rejected here, at startup.

use clipq_common::config::TomlConfig;
use clipq_common::{Error, Result};
use std::time::Duration;
use tracing::warn;

use crate::resequencer::ResequencerSettings;
use crate::utils::RetryPolicy;
use crate::worker::{DeliveryPolicy, PoolSettings};

/// Everything the `serve` command needs beyond the database and provider
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub resequencer: ResequencerSettings,
    pub pool: PoolSettings,
    pub retry: RetryPolicy,
    pub visibility_timeout: Duration,
}

impl ServiceSettings {
    pub fn from_toml(config: &TomlConfig) -> Result<Self> {
        let sequencer = &config.sequencer;
        let queues = &config.queues;

        if sequencer.workers == 0 {
            return Err(Error::Config("[sequencer] workers must be at least 1".into()));
        }
        if sequencer.claim_ttl_secs == 0 {
            return Err(Error::Config("[sequencer] claim_ttl_secs must be positive".into()));
        }
        if queues.uploads == queues.segments {
            return Err(Error::Config(
                "[queues] uploads and segments must name different queues".into(),
            ));
        }

        // A lease shorter than the claim lets a slow job be redelivered to a
        // second worker while the first still holds the session
        if queues.visibility_timeout_secs < sequencer.claim_ttl_secs {
            warn!(
                visibility_timeout_secs = queues.visibility_timeout_secs,
                claim_ttl_secs = sequencer.claim_ttl_secs,
                "Queue visibility timeout is shorter than the release claim"
            );
        }

        Ok(Self {
            resequencer: ResequencerSettings {
                claim_ttl: Duration::from_secs(sequencer.claim_ttl_secs),
                init_wait: Duration::from_millis(sequencer.init_wait_ms),
            },
            pool: PoolSettings {
                workers: sequencer.workers,
                intake_workers: sequencer.intake_workers,
                segments_queue: queues.segments.clone(),
                uploads_queue: queues.uploads.clone(),
                sweep_interval: (sequencer.sweep_interval_secs > 0)
                    .then(|| Duration::from_secs(sequencer.sweep_interval_secs)),
                delivery: DeliveryPolicy::from(queues),
            },
            retry: RetryPolicy::from(&config.retry),
            visibility_timeout: Duration::from_secs(queues.visibility_timeout_secs),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let settings = ServiceSettings::from_toml(&TomlConfig::default()).unwrap();
        assert_eq!(settings.pool.workers, 4);
        assert_eq!(settings.pool.sweep_interval, Some(Duration::from_secs(30)));
        assert_eq!(settings.resequencer.claim_ttl, Duration::from_secs(900));
        assert_eq!(settings.retry.max_attempts, 3);
    }

    #[test]
    fn test_zero_sweep_interval_disables_sweeper() {
        let mut config = TomlConfig::default();
        config.sequencer.sweep_interval_secs = 0;
        let settings = ServiceSettings::from_toml(&config).unwrap();
        assert_eq!(settings.pool.sweep_interval, None);
    }

    #[test]
    fn test_rejects_unusable_values() {
        let mut config = TomlConfig::default();
        config.sequencer.workers = 0;
        assert!(ServiceSettings::from_toml(&config).is_err());

        let mut config = TomlConfig::default();
        config.queues.segments = config.queues.uploads.clone();
        assert!(ServiceSettings::from_toml(&config).is_err());
    }
}
