// dedup_runner/src/error.rs
//! Error type shared by the intake server.
//!
//! Only two failures are systemic and escape `Server::start`: the listener
//! cannot be bound, or the numbers log cannot be created. Everything else is
//! contained by the component that hit it and logged through a `WarnThrottle`.

use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to create numbers log {path}: {source}")]
    LogFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("malformed record {record:?}: {source}")]
    Malformed {
        record: String,
        #[source]
        source: std::num::ParseIntError,
    },

    #[error("value {value} is outside the dedup domain of {capacity} entries")]
    OutOfDomain { value: u64, capacity: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ServerError>;
