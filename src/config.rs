//! Application-level configuration loading, including round timings and the reward table.

use std::{env, fs, io::ErrorKind, path::PathBuf, time::Duration};

use serde::Deserialize;
use tracing::{info, warn};

use crate::state::settlement::{RewardTable, UnknownPlayerPolicy};

/// Default location on disk where the engine looks for the JSON configuration.
const DEFAULT_CONFIG_PATH: &str = "config/round.json";
/// Environment variable that overrides [`DEFAULT_CONFIG_PATH`].
const CONFIG_PATH_ENV: &str = "ROUND_ENGINE_CONFIG_PATH";

#[derive(Debug, Clone, Default, Deserialize)]
/// Immutable runtime configuration shared across the application.
pub struct AppConfig {
    /// Timings, caps and rewards for every round.
    #[serde(default)]
    pub round: RoundConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
/// Round timings and settlement parameters. Durations are synchronized seconds.
pub struct RoundConfig {
    /// How often the authority broadcasts its clock.
    pub clock_sync_interval_ms: u64,
    /// Delay between barrier satisfaction and the round going active.
    pub round_start_delay_secs: f64,
    /// Delay between barrier satisfaction and the first countdown tick.
    pub countdown_begin_delay_secs: f64,
    /// Interval between countdown ticks.
    pub countdown_cadence_secs: f64,
    /// Highest countdown index.
    pub countdown_max_ticks: u32,
    /// Wait before settling so late scoring events can land.
    pub settlement_grace_secs: f64,
    /// Wait between releasing and destroying round objects.
    pub teardown_delay_secs: f64,
    /// Round time limit; `None` lets gameplay end the round.
    pub round_duration_secs: Option<f64>,
    /// Finishers that end a goal-line round.
    pub max_finishers: usize,
    /// Rounds in a session.
    pub max_rounds: u32,
    /// Give up on silent peers after this long; `None` waits forever.
    pub barrier_timeout_secs: Option<f64>,
    /// Replicas abort when the authority stays silent this long.
    pub authority_timeout_secs: f64,
    /// Handling of results that name unknown players.
    pub unknown_player_policy: UnknownPlayerPolicy,
    /// Bonus amounts.
    pub rewards: RewardTable,
}

impl Default for RoundConfig {
    fn default() -> Self {
        Self {
            clock_sync_interval_ms: 100,
            round_start_delay_secs: 2.0,
            countdown_begin_delay_secs: 3.0,
            countdown_cadence_secs: 1.5,
            countdown_max_ticks: 4,
            settlement_grace_secs: 4.0,
            teardown_delay_secs: 5.0,
            round_duration_secs: Some(60.0),
            max_finishers: 3,
            max_rounds: 3,
            barrier_timeout_secs: Some(30.0),
            authority_timeout_secs: 5.0,
            unknown_player_policy: UnknownPlayerPolicy::default(),
            rewards: RewardTable::default(),
        }
    }
}

impl RoundConfig {
    /// Clock broadcast interval.
    pub fn clock_sync_interval(&self) -> Duration {
        Duration::from_millis(self.clock_sync_interval_ms.max(1))
    }
}

impl AppConfig {
    /// Load the application configuration from disk, falling back to built-in defaults.
    pub fn load() -> Self {
        let path = resolve_config_path();
        match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<AppConfig>(&contents) {
                Ok(app_config) => {
                    info!(
                        path = %path.display(),
                        max_rounds = app_config.round.max_rounds,
                        "loaded round configuration"
                    );
                    app_config
                }
                Err(err) => {
                    warn!(
                        path = %path.display(),
                        error = %err,
                        "failed to parse config; falling back to defaults"
                    );
                    Self::default()
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!(
                    path = %path.display(),
                    "config file not found; using built-in defaults"
                );
                Self::default()
            }
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "failed to read config; falling back to defaults"
                );
                Self::default()
            }
        }
    }
}

/// Resolve the configuration path taking the environment override into account.
fn resolve_config_path() -> PathBuf {
    env::var_os(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .filter(|path| !path.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}
