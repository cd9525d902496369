// dedup_runner/src/config.rs
use std::env;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::error::{Result, ServerError};

/// Widest digit count the dedup set supports (10^9 bits, ~119 MiB).
pub const MAX_DIGITS: u32 = 9;

/// Startup constants for one server instance.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: IpAddr,
    pub port: u16,
    /// Exact number of ASCII digits a submission must carry.
    pub digits: u32,
    pub max_connections: usize,
    /// Capacity of both the input and the output queue.
    pub queue_capacity: usize,
    pub report_interval: Duration,
    /// Upper bound on how long `stop` waits for the log writer to close the file.
    pub shutdown_timeout: Duration,
    pub log_path: PathBuf,
    /// Line that stops the whole pipeline when a client sends it.
    pub terminate_text: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 4000,
            digits: MAX_DIGITS,
            max_connections: 5,
            queue_capacity: 100_000,
            report_interval: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(10),
            log_path: PathBuf::from("numbers.log"),
            terminate_text: "terminate".to_string(),
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `DEDUP_*` environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind_addr: env_or("DEDUP_BIND_ADDR", defaults.bind_addr),
            port: env_or("DEDUP_PORT", defaults.port),
            digits: env_or("DEDUP_DIGITS", defaults.digits),
            max_connections: env_or("DEDUP_MAX_CONNECTIONS", defaults.max_connections),
            queue_capacity: env_or("DEDUP_QUEUE_CAPACITY", defaults.queue_capacity),
            report_interval: Duration::from_millis(env_or(
                "DEDUP_REPORT_INTERVAL_MS",
                defaults.report_interval.as_millis() as u64,
            )),
            shutdown_timeout: Duration::from_millis(env_or(
                "DEDUP_SHUTDOWN_TIMEOUT_MS",
                defaults.shutdown_timeout.as_millis() as u64,
            )),
            log_path: env::var("DEDUP_LOG_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.log_path),
            terminate_text: env::var("DEDUP_TERMINATE_TEXT").unwrap_or(defaults.terminate_text),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.digits == 0 || self.digits > MAX_DIGITS {
            return Err(ServerError::Config(format!(
                "digits must be within 1..={}, got {}",
                MAX_DIGITS, self.digits
            )));
        }
        if self.max_connections == 0 {
            return Err(ServerError::Config("max_connections must be positive".into()));
        }
        if self.queue_capacity == 0 {
            return Err(ServerError::Config("queue_capacity must be positive".into()));
        }
        if self.report_interval.is_zero() {
            return Err(ServerError::Config("report_interval must be positive".into()));
        }
        // A digit-only sentinel would be indistinguishable from a submission.
        if self.terminate_text.is_empty() || self.terminate_text.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ServerError::Config(format!(
                "terminate_text {:?} must contain a non-digit character",
                self.terminate_text
            )));
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.port)
    }

    /// Number of distinct values a submission can carry, `10^digits`.
    pub fn domain_size(&self) -> u64 {
        10u64.pow(self.digits)
    }
}

fn env_or<T>(name: &str, default: T) -> T
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(e) => {
                warn!("ignoring {}={:?}: {}", name, raw, e);
                default
            }
        },
        Err(_) => default,
    }
}
