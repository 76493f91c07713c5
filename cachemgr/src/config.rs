//! Manager configuration.
//!
//! Values come from builder calls or from a name/value parameter table
//! (`-p name=value` on the command line). They are read once when the
//! supervisor is built and never re-read while a worker runs.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::orchestrator::WorkerSpawner;

pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(3);
pub const DEFAULT_CLI_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_CLI_LIMIT: usize = 48 * 1024;
pub const DEFAULT_CLI_BUFFER: usize = 8 * 1024;

const MIN_CLI_LIMIT: usize = 128;
const MIN_CLI_BUFFER: usize = 4096;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unknown parameter \"{0}\"")]
    UnknownParam(String),
    #[error("invalid value for {name}: {reason}")]
    InvalidValue { name: String, reason: String },
    #[error("malformed parameter assignment \"{0}\", expected name=value")]
    Malformed(String),
}

impl ConfigError {
    fn invalid(name: &str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}

/// Relaunch delay policy for a worker that keeps crashing.
///
/// The first relaunch after a crash is immediate. An incarnation that lived
/// less than `reset_after` counts as a quick crash; the relaunch after the
/// n-th consecutive quick crash (n >= 2) waits `first * factor^(n-2)`,
/// capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RestartBackoff {
    pub first: Duration,
    pub max: Duration,
    pub factor: f64,
    pub reset_after: Duration,
}

impl Default for RestartBackoff {
    fn default() -> Self {
        Self {
            first: Duration::from_millis(500),
            max: Duration::from_secs(30),
            factor: 2.0,
            reset_after: Duration::from_secs(60),
        }
    }
}

impl RestartBackoff {
    /// No delay at all, whatever the crash rate.
    pub fn none() -> Self {
        Self {
            first: Duration::ZERO,
            max: Duration::ZERO,
            factor: 1.0,
            reset_after: Duration::ZERO,
        }
    }

    /// Delay before relaunching after `crashes` consecutive quick crashes
    /// (1 for the first crash).
    pub fn delay(&self, crashes: u32) -> Duration {
        if crashes <= 1 {
            return Duration::ZERO;
        }
        let exp = (crashes - 2).min(i32::MAX as u32) as i32;
        let secs = self.first.as_secs_f64() * self.factor.powi(exp);
        if !secs.is_finite() || secs < 0.0 || secs > self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

#[derive(Clone)]
pub struct ManagerConfig {
    /// Heartbeat period; `None` disables probing.
    pub ping_interval: Option<Duration>,
    /// Relaunch the worker when it exits while the manager wants it running.
    pub auto_restart: bool,
    /// Maximum wait for a reply to the in-flight command; `None` waits forever.
    pub cli_timeout: Option<Duration>,
    /// Longest reply message the worker sends; longer ones are cut and
    /// answered with status 201.
    pub cli_limit: usize,
    /// Longest request line the worker accepts; longer ones get status 100.
    pub cli_buffer: usize,
    pub backoff: RestartBackoff,
    pub spawner: Arc<dyn WorkerSpawner>,
}

impl std::fmt::Debug for ManagerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagerConfig")
            .field("ping_interval", &self.ping_interval)
            .field("auto_restart", &self.auto_restart)
            .field("cli_timeout", &self.cli_timeout)
            .field("cli_limit", &self.cli_limit)
            .field("cli_buffer", &self.cli_buffer)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

impl ManagerConfig {
    pub fn new(spawner: Arc<dyn WorkerSpawner>) -> Self {
        Self {
            ping_interval: Some(DEFAULT_PING_INTERVAL),
            auto_restart: true,
            cli_timeout: Some(DEFAULT_CLI_TIMEOUT),
            cli_limit: DEFAULT_CLI_LIMIT,
            cli_buffer: DEFAULT_CLI_BUFFER,
            backoff: RestartBackoff::default(),
            spawner,
        }
    }

    pub fn with_ping_interval(mut self, interval: Option<Duration>) -> Self {
        self.ping_interval = interval.filter(|d| !d.is_zero());
        self
    }

    pub fn with_auto_restart(mut self, auto_restart: bool) -> Self {
        self.auto_restart = auto_restart;
        self
    }

    pub fn with_cli_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.cli_timeout = timeout.filter(|d| !d.is_zero());
        self
    }

    pub fn with_cli_limit(mut self, bytes: usize) -> Result<Self, ConfigError> {
        self.cli_limit = check_min("cli_limit", bytes, MIN_CLI_LIMIT)?;
        Ok(self)
    }

    pub fn with_cli_buffer(mut self, bytes: usize) -> Result<Self, ConfigError> {
        self.cli_buffer = check_min("cli_buffer", bytes, MIN_CLI_BUFFER)?;
        Ok(self)
    }

    pub fn with_backoff(mut self, backoff: RestartBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Apply every entry of a parameter table.
    pub fn with_params(mut self, params: &BTreeMap<String, String>) -> Result<Self, ConfigError> {
        for (name, value) in params {
            self.set_param(name, value)?;
        }
        Ok(self)
    }

    pub fn set_param(&mut self, name: &str, value: &str) -> Result<(), ConfigError> {
        match name {
            "ping_interval" => {
                let secs = parse_uint(name, value)?;
                self.ping_interval = (secs > 0).then(|| Duration::from_secs(secs));
            }
            "auto_restart" => self.auto_restart = parse_bool(name, value)?,
            "cli_timeout" => {
                let secs = parse_uint(name, value)?;
                self.cli_timeout = (secs > 0).then(|| Duration::from_secs(secs));
            }
            "cli_limit" => self.cli_limit = parse_bytes(name, value, MIN_CLI_LIMIT)?,
            "cli_buffer" => self.cli_buffer = parse_bytes(name, value, MIN_CLI_BUFFER)?,
            other => return Err(ConfigError::UnknownParam(other.to_string())),
        }
        tracing::debug!(param = name, value, "Parameter set");
        Ok(())
    }
}

/// Split `name=value` into its parts.
pub fn parse_assignment(arg: &str) -> Result<(String, String), ConfigError> {
    match arg.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok((name.to_string(), value.to_string())),
        _ => Err(ConfigError::Malformed(arg.to_string())),
    }
}

fn parse_uint(name: &str, value: &str) -> Result<u64, ConfigError> {
    value
        .trim()
        .parse::<u64>()
        .map_err(|_| ConfigError::invalid(name, format!("\"{value}\" is not an unsigned integer")))
}

fn parse_bool(name: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "on" | "true" | "yes" | "enable" => Ok(true),
        "off" | "false" | "no" | "disable" => Ok(false),
        _ => Err(ConfigError::invalid(
            name,
            format!("\"{value}\" is not a boolean (use on/off)"),
        )),
    }
}

fn parse_bytes(name: &str, value: &str, min: usize) -> Result<usize, ConfigError> {
    let trimmed = value.trim();
    let (digits, multiplier) = match trimmed.char_indices().last() {
        Some((i, 'k' | 'K')) => (&trimmed[..i], 1024),
        Some((i, 'm' | 'M')) => (&trimmed[..i], 1024 * 1024),
        Some((i, 'b' | 'B')) => (&trimmed[..i], 1),
        _ => (trimmed, 1),
    };
    let n = digits
        .parse::<usize>()
        .ok()
        .and_then(|n| n.checked_mul(multiplier))
        .ok_or_else(|| ConfigError::invalid(name, format!("\"{value}\" is not a byte size")))?;
    check_min(name, n, min)
}

fn check_min(name: &str, bytes: usize, min: usize) -> Result<usize, ConfigError> {
    if bytes < min {
        return Err(ConfigError::invalid(name, format!("must be at least {min} bytes")));
    }
    Ok(bytes)
}
