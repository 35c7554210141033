pub mod dispatcher;
pub mod events;
pub mod permissions;

pub use dispatcher::{DispatchOptions, Dispatcher};
pub use events::ClientEvent;
