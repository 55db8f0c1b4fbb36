//! Client settings: endpoint and timing knobs.
//!
//! Defaults can be overridden by an optional settings file (any format the
//! `config` crate understands) and then by `LINK_*` environment variables,
//! e.g. `LINK_STATE_URL` or `LINK_POLL_INTERVAL_MS`.

use crate::election::ElectionTimings;
use crate::flow::FlowTimings;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_STATE_URL: &str = "http://127.0.0.1:8000/state";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub state_url: String,
    pub poll_interval_ms: u64,
    pub election_check_ms: u64,
    pub heartbeat_ms: u64,
    /// Defaults to three election checks.
    pub stale_after_ms: Option<u64>,
    pub waiting_window_secs: u64,
    pub finalize_delay_ms: u64,
    pub reset_guard_ms: u64,
    pub history_limit: usize,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            state_url: DEFAULT_STATE_URL.to_string(),
            poll_interval_ms: 1_500,
            election_check_ms: 3_000,
            heartbeat_ms: 1_000,
            stale_after_ms: None,
            waiting_window_secs: 300,
            finalize_delay_ms: 2_000,
            reset_guard_ms: 3_000,
            history_limit: crate::progress::DEFAULT_HISTORY_LIMIT,
        }
    }
}

impl ClientSettings {
    pub fn load(file: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);
        if let Some(file) = file {
            builder = builder.add_source(File::from(file));
        }
        builder
            .add_source(
                Environment::with_prefix("LINK")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn waiting_window(&self) -> Duration {
        Duration::from_secs(self.waiting_window_secs)
    }

    pub fn election_timings(&self) -> ElectionTimings {
        let mut timings = ElectionTimings::from_check_interval(
            Duration::from_millis(self.election_check_ms),
            Duration::from_millis(self.heartbeat_ms),
        );
        if let Some(stale_after_ms) = self.stale_after_ms {
            timings.stale_after = Duration::from_millis(stale_after_ms);
        }
        timings
    }

    pub fn flow_timings(&self) -> FlowTimings {
        FlowTimings {
            finalize_delay: Duration::from_millis(self.finalize_delay_ms),
            reset_guard: Duration::from_millis(self.reset_guard_ms),
        }
    }
}
