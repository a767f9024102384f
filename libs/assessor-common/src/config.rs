// Runtime configuration, read once from the environment at boot.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?} ({reason})")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxMode {
    Docker,
    Disabled,
}

impl FromStr for SandboxMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "docker" => Ok(SandboxMode::Docker),
            "disabled" | "none" | "off" => Ok(SandboxMode::Disabled),
            other => Err(format!("expected docker or disabled, got {other}")),
        }
    }
}

/// Knobs for the dispatcher; split out so the engine can be built without
/// the HTTP-only settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchSettings {
    pub submission_overhead: Duration,
    pub max_parallel_tests: usize,
    pub infra_max_retries: u32,
    pub infra_retry_base: Duration,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            submission_overhead: Duration::from_secs(5),
            max_parallel_tests: 4,
            infra_max_retries: 3,
            infra_retry_base: Duration::from_millis(200),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    pub idle_ttl: Duration,
    pub completed_grace: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            idle_ttl: Duration::from_secs(86_400),
            completed_grace: Duration::from_secs(3_600),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub redis_url: Option<String>,
    pub languages_config: PathBuf,
    pub catalog_path: Option<PathBuf>,
    pub session: SessionSettings,
    pub dispatch: DispatchSettings,
    pub sweep_interval: Duration,
    pub sandbox: SandboxMode,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; `from_env` passes the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let session = SessionSettings {
            idle_ttl: Duration::from_secs(parse_or(&non_empty, "SESSION_IDLE_TTL_SECS", 86_400)?),
            completed_grace: Duration::from_secs(parse_or(
                &non_empty,
                "COMPLETED_SESSION_GRACE_SECS",
                3_600,
            )?),
        };

        let max_parallel_tests: usize = parse_or(&non_empty, "MAX_PARALLEL_TESTS", 4)?;
        if max_parallel_tests == 0 {
            return Err(ConfigError::Invalid {
                var: "MAX_PARALLEL_TESTS",
                value: "0".into(),
                reason: "must be at least 1".into(),
            });
        }

        let dispatch = DispatchSettings {
            submission_overhead: Duration::from_secs(parse_or(
                &non_empty,
                "SUBMISSION_OVERHEAD_SECS",
                5,
            )?),
            max_parallel_tests,
            infra_max_retries: parse_or(&non_empty, "INFRA_MAX_RETRIES", 3)?,
            infra_retry_base: Duration::from_millis(parse_or(
                &non_empty,
                "INFRA_RETRY_BASE_MS",
                200,
            )?),
        };

        Ok(Self {
            bind_addr: parse_or(&non_empty, "BIND_ADDR", SocketAddr::from(([0, 0, 0, 0], 3000)))?,
            redis_url: non_empty("REDIS_URL"),
            languages_config: non_empty("LANGUAGES_CONFIG")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("config/languages.json")),
            catalog_path: non_empty("CATALOG_PATH").map(PathBuf::from),
            session,
            dispatch,
            sweep_interval: Duration::from_secs(parse_or(&non_empty, "SWEEP_INTERVAL_SECS", 300)?),
            sandbox: parse_or(&non_empty, "SANDBOX", SandboxMode::Docker)?,
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
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            var,
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}
