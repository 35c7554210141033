pub mod api;
pub mod auth;
pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod store;

#[cfg(test)]
mod integration_tests;

pub use client::{Client, ClientOptions};
pub use error::ClientError;
