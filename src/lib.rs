pub mod auth;
pub mod cli;
pub mod config;
pub mod connection;
pub mod data;
pub mod error;
pub mod protocol;
pub mod resolver;

#[cfg(test)]
mod testing;

pub use cli::{Command, prompt};
pub use config::{ConnectionConfig, TlsMode};
pub use connection::{
    Backend, Connection, ConnectionState, ForwardingBackend, ThreadedBackend, backend, connect,
};
pub use data::{Data, RemoteError};
pub use error::{ConnectionError, Feature, LoginFailure};
pub use protocol::{Context, Record, Reply, Setting, Target, WireRecord};
