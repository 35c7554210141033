use thiserror::Error;

use crate::gateway::connection::ConnectionState;
use crate::store::EntityKind;

/// Errors raised by the connection state machine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    /// A frame arrived that the protocol does not allow in the current state.
    /// This is a contract breach by the server, never a transient failure.
    #[error("received {event} while {state:?}")]
    InvalidTransition {
        state: ConnectionState,
        event: &'static str,
    },

    /// An operation was requested that the current state cannot perform.
    #[error("cannot {operation} while {state:?}")]
    InvalidState {
        state: ConnectionState,
        operation: &'static str,
    },
}

/// Errors from the REST collaborator.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("GET {route} returned status {status}")]
    Status { route: String, status: u16 },
}

/// Errors loading `hearth.toml`.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

/// A canonical value could not be written into a record field.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HydrationError {
    #[error("{kind} has no field {field}")]
    UnknownField { kind: EntityKind, field: String },

    #[error("invalid value for {kind}.{field}: {reason}")]
    InvalidValue {
        kind: EntityKind,
        field: String,
        reason: String,
    },
}

/// Top-level error returned by [`crate::Client`].
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Hydration(#[from] HydrationError),

    #[error("client is not connected")]
    NotConnected,

    #[error("{kind} {id} was not returned by the API")]
    Missing { kind: EntityKind, id: String },
}
