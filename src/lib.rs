//! tcp-serv: a minimal TCP connection server
//!
//! Features:
//! - Sliding idle timeout per connection, rearmed on every read and write
//! - Per-read byte limit, also the size of the read buffer
//! - Pluggable message handlers (one physical read is one message)
//! - Graceful shutdown that drains live connections
//! - Configuration via CLI arguments or TOML file

pub mod config;
pub mod connection;
pub mod protocols;
pub mod registry;
pub mod server;

pub use connection::Connection;
pub use protocols::{EchoHandler, Handler, HandlerError};
pub use registry::{ConnectionInfo, Registry};
pub use server::{ConnectionError, Server, ServerConfig, ServerError};
