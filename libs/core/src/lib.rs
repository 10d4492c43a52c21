//! Polymesh Core - Shared vocabulary of the RPC runtime
//!
//! Error taxonomy, configuration, the service path grammar, and the wire
//! formats exchanged between clients, servers and the discovery broker.

pub mod config;
pub mod descriptor;
pub mod envelope;
pub mod error;
pub mod path;

pub use config::Config;
pub use descriptor::{InstanceDescriptor, Presence};
pub use envelope::{Reply, ReplyCode, Request};
pub use error::{Error, ErrorKind, Result};
pub use path::ServicePath;
