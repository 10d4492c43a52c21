//! Polymesh Node - Servers and clients of the RPC runtime
//!
//! A [`Server`] exposes the services of a [`ServiceRegistry`] on a socket and
//! announces itself on the discovery broker. A [`Client`] follows those
//! announcements and load balances requests across the live instances.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use polymesh_core::Config;
//! use polymesh_fabric::MemoryBroker;
//! use polymesh_node::{Client, HandlerSet, Server, ServiceDefinition};
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let broker = Arc::new(MemoryBroker::new());
//! let config = Config::default().with_host("127.0.0.1").with_port(0);
//!
//! let server = Server::new(config.clone(), broker.clone());
//! server.add_service(ServiceDefinition::new(
//!     "s",
//!     HandlerSet::new().handler("echo", |request| async move { Ok(request.data) }),
//! ))?;
//! server.start().await?;
//!
//! let client = Client::new(config, broker);
//! client.start(["s"]).await?;
//! let answer = client.send("s.echo", json!(42), None).await?;
//! assert_eq!(answer, json!(42));
//!
//! client.shutdown(false).await;
//! server.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod discovery;
pub mod logging;
pub mod registry;
pub mod server;
pub mod service;

pub use client::Client;
pub use logging::init_logging;
pub use registry::{ServiceLoader, ServiceRegistry};
pub use server::{Server, ServerState};
pub use service::{Handler, HandlerResult, HandlerSet, Service, ServiceDefinition};
