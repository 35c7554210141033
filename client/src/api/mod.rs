//! REST lookups used to fill in records the event stream only references.

pub mod rest;

pub use rest::{HttpApi, RestApi, Route};
