use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::blockchain::{
    DEFAULT_BASE_REWARD, DEFAULT_DIFFICULTY, DEFAULT_TIME_PENALTY_FACTOR, RewardPolicy,
};

#[derive(Debug, Error)]
#[error("invalid value for {var}: {value:?} ({reason})")]
pub struct ConfigError {
    pub var: &'static str,
    pub value: String,
    pub reason: String,
}

/// Runtime configuration, read from the process environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub ws_host: String,
    pub ws_port: u16,
    pub difficulty: u32,
    pub reward: RewardPolicy,
    pub fail_notice_interval: Duration,
    /// `None` disables the realtime idle timeout.
    pub idle_timeout: Option<Duration>,
    pub store_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            ws_host: "127.0.0.1".to_string(),
            ws_port: 8081,
            difficulty: DEFAULT_DIFFICULTY,
            reward: RewardPolicy {
                base_reward: DEFAULT_BASE_REWARD,
                time_penalty_factor: DEFAULT_TIME_PENALTY_FACTOR,
            },
            fail_notice_interval: Duration::from_millis(1000),
            idle_timeout: Some(Duration::from_secs(300)),
            store_path: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup (the environment in production).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let host = lookup("HOST").unwrap_or(defaults.host);
        let ws_host = lookup("WS_HOST").unwrap_or_else(|| host.clone());

        let difficulty: u32 = parse_or(&lookup, "DIFFICULTY", defaults.difficulty)?;
        if difficulty == 0 {
            return Err(ConfigError {
                var: "DIFFICULTY",
                value: difficulty.to_string(),
                reason: "must be a positive integer".into(),
            });
        }

        let base_reward: f64 = parse_or(&lookup, "BASE_REWARD", defaults.reward.base_reward)?;
        let time_penalty_factor: f64 = parse_or(
            &lookup,
            "TIME_PENALTY_FACTOR",
            defaults.reward.time_penalty_factor,
        )?;
        for (var, v) in [
            ("BASE_REWARD", base_reward),
            ("TIME_PENALTY_FACTOR", time_penalty_factor),
        ] {
            if !v.is_finite() || v < 0.0 {
                return Err(ConfigError {
                    var,
                    value: v.to_string(),
                    reason: "must be a non-negative number".into(),
                });
            }
        }

        let fail_notice_ms: u64 = parse_or(&lookup, "MINE_FAIL_NOTICE_MS", 1000)?;
        let idle_secs: u64 = parse_or(&lookup, "IDLE_TIMEOUT_SECS", 300)?;

        Ok(Self {
            host,
            port: parse_or(&lookup, "PORT", defaults.port)?,
            ws_host,
            ws_port: parse_or(&lookup, "WS_PORT", defaults.ws_port)?,
            difficulty,
            reward: RewardPolicy {
                base_reward,
                time_penalty_factor,
            },
            fail_notice_interval: Duration::from_millis(fail_notice_ms),
            idle_timeout: (idle_secs > 0).then(|| Duration::from_secs(idle_secs)),
            store_path: lookup("STORE_PATH")
                .filter(|p| !p.trim().is_empty())
                .map(PathBuf::from),
        })
    }
}

fn parse_or<T, F>(lookup: &F, var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError {
            var,
            value: raw,
            reason: e.to_string(),
        }),
    }
}
