//! Realtime event connection: wire protocol, lifecycle and socket driver.

pub mod backoff;
pub mod connection;
pub mod driver;
pub mod protocol;

pub use connection::{ConnectionAction, ConnectionState, EventConnection, GatewayConfig};
pub use driver::{ConnectionStatus, SharedStatus};
pub use protocol::{ClientFrame, ServerEvent};
