//! Orchestrator configuration
//!
//! All timings are stored in milliseconds so the TOML form stays flat:
//!
//! ```toml
//! failure_grace_ms = 3000
//! max_retries = 5
//! ```

use std::fs;
use std::path::Path;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use super::error::CallError;

/// Upper bound for every `*_ms` timing; deadlines are `Instant + Duration`
pub const MAX_TIMING_MS: u64 = 24 * 60 * 60 * 1000;

/// Timings and bounds used by the call orchestrator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// Fixed part of the delay before sending an initial offer
    pub offer_delay_ms: u64,
    /// Random extra delay (0..=jitter) added to the offer delay
    pub offer_jitter_ms: u64,
    /// Time a failed/disconnected connection gets before recovery starts
    pub failure_grace_ms: u64,
    /// Time an ICE restart gets before the session is recreated
    pub restart_check_ms: u64,
    /// Recovery attempts per peer before it is marked permanently failed
    pub max_retries: u32,
    /// First recreate delay; doubles per attempt
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Hub forwarding reconciliation interval
    pub reconcile_interval_ms: u64,
    pub health_interval_ms: u64,
    /// A session still connecting after this long is treated as failed
    pub connect_timeout_ms: u64,
    /// Delay between leaving and re-joining on a forced reconnect
    pub rejoin_delay_ms: u64,
    pub capture_attempts: u32,
    pub capture_retry_delay_ms: u64,
    /// Automatic full reconnects allowed per call
    pub max_full_reconnects: u32,
    /// Candidates kept for a peer that has no session yet
    pub orphan_candidate_limit: usize,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            offer_delay_ms: 500,
            offer_jitter_ms: 1000,
            failure_grace_ms: 3000,
            restart_check_ms: 3000,
            max_retries: 5,
            backoff_base_ms: 1000,
            backoff_max_ms: 16_000,
            reconcile_interval_ms: 2000,
            health_interval_ms: 5000,
            connect_timeout_ms: 15_000,
            rejoin_delay_ms: 2000,
            capture_attempts: 3,
            capture_retry_delay_ms: 1000,
            max_full_reconnects: 2,
            orphan_candidate_limit: 256,
        }
    }
}

impl CallConfig {
    /// Load a TOML configuration file and validate it
    pub fn load(path: &Path) -> Result<Self, CallError> {
        let contents = fs::read_to_string(path)
            .map_err(|e| CallError::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, CallError> {
        let config: Self = toml::from_str(contents)
            .map_err(|e| CallError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, CallError> {
        toml::to_string_pretty(self)
            .map_err(|e| CallError::Config(format!("Failed to serialize config: {}", e)))
    }

    pub fn validate(&self) -> Result<(), CallError> {
        if self.capture_attempts == 0 {
            return Err(CallError::Config(
                "capture_attempts must be at least 1".to_string(),
            ));
        }

        if self.backoff_base_ms > self.backoff_max_ms {
            return Err(CallError::Config(format!(
                "backoff_base_ms ({}) exceeds backoff_max_ms ({})",
                self.backoff_base_ms, self.backoff_max_ms
            )));
        }

        for (name, value) in [
            ("offer_delay_ms", self.offer_delay_ms),
            ("offer_jitter_ms", self.offer_jitter_ms),
            ("failure_grace_ms", self.failure_grace_ms),
            ("restart_check_ms", self.restart_check_ms),
            ("backoff_base_ms", self.backoff_base_ms),
            ("backoff_max_ms", self.backoff_max_ms),
            ("reconcile_interval_ms", self.reconcile_interval_ms),
            ("health_interval_ms", self.health_interval_ms),
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("rejoin_delay_ms", self.rejoin_delay_ms),
            ("capture_retry_delay_ms", self.capture_retry_delay_ms),
        ] {
            if value > MAX_TIMING_MS {
                return Err(CallError::Config(format!(
                    "{} ({}) exceeds {} ms",
                    name, value, MAX_TIMING_MS
                )));
            }
        }

        for (name, value) in [
            ("reconcile_interval_ms", self.reconcile_interval_ms),
            ("health_interval_ms", self.health_interval_ms),
            ("connect_timeout_ms", self.connect_timeout_ms),
        ] {
            if value == 0 {
                return Err(CallError::Config(format!("{} must be non-zero", name)));
            }
        }

        Ok(())
    }

    pub fn failure_grace(&self) -> Duration {
        millis(self.failure_grace_ms)
    }

    pub fn restart_check(&self) -> Duration {
        millis(self.restart_check_ms)
    }

    pub fn reconcile_interval(&self) -> Duration {
        millis(self.reconcile_interval_ms)
    }

    pub fn health_interval(&self) -> Duration {
        millis(self.health_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        millis(self.connect_timeout_ms)
    }

    pub fn rejoin_delay(&self) -> Duration {
        millis(self.rejoin_delay_ms)
    }

    pub fn capture_retry_delay(&self) -> Duration {
        millis(self.capture_retry_delay_ms)
    }

    pub fn backoff_base(&self) -> Duration {
        millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        millis(self.backoff_max_ms)
    }

    /// Offer delay with random jitter, spreading out offers from both sides
    pub fn offer_delay(&self) -> Duration {
        let jitter = rand::thread_rng().gen_range(0..=self.offer_jitter_ms.min(MAX_TIMING_MS));
        millis(self.offer_delay_ms) + Duration::from_millis(jitter)
    }
}

/// Configs built in code skip `validate`, so accessors clamp as well
fn millis(value: u64) -> Duration {
    Duration::from_millis(value.min(MAX_TIMING_MS))
}
