// Re-export the platform-agnostic core
pub use duocore::{auth, net, protocol, rooms, types};

pub mod calls;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod http;
pub mod presence;
pub mod transport;
pub mod upload;

#[cfg(test)]
mod test_utils;

pub use client::{Client, ClientBuilder};
pub use config::{ClientConfig, ReconnectPolicy, TypingConfig};
pub use connection::{ConnectionManager, ConnectionState, Session};
pub use error::ClientError;
