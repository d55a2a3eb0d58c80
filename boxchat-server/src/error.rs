//! Library error types.

use crate::event::{Address, ConnectionId};

/// Errors reported by the authority while processing a single event.
///
/// None of these are fatal: the actor loop logs them and moves on.
#[derive(Debug, thiserror::Error)]
pub enum AuthorityError {
    #[error("client with address {address} (conn {conn_id}) does not exist")]
    UnknownClient {
        address: Address,
        conn_id: ConnectionId,
    },
}

/// Invalid startup configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{name} must be a finite, non-negative number of seconds (got {value})")]
    InvalidDuration { name: &'static str, value: f64 },
    #[error("{name} must be greater than zero")]
    ZeroSize { name: &'static str },
}
