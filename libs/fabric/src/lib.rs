//! Polymesh Fabric - Transport layer of the RPC runtime
//!
//! Provides length-prefixed TCP framing, the JSON codec, the transport
//! [`Socket`] adapter used by servers and clients, and the publish/subscribe
//! [`Broker`] interface used for discovery.
//!
//! # Example
//!
//! ```no_run
//! use polymesh_fabric::Socket;
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let server = Socket::server();
//! let _subscription = server.on_message(|message| {
//!     if let Some(replier) = message.replier() {
//!         let _ = replier.reply(&json!({ "echo": message.payload().len() }));
//!     }
//! })?;
//! server.connect(0, "127.0.0.1").await?;
//! let port = server.local_addr().unwrap().port();
//!
//! let client = Socket::client();
//! let _subscription = client.on_message(|message| println!("{:?}", message.payload()))?;
//! client.connect(port, "127.0.0.1").await?;
//! client.send(&json!({ "hello": "world" }));
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod codec;
pub mod error;
pub mod socket;
pub mod transport;

// Re-exports for convenience
pub use broker::{Broker, BrokerMessage, BrokerSubscription, MemoryBroker};
pub use error::{Error, Result};
pub use socket::{Message, Replier, Socket, SocketMode, Subscription};
