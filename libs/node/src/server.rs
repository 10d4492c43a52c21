//! Server coordinator
//!
//! Binds a server socket, dispatches inbound requests to the registry and
//! keeps the instance visible on its discovery groups until shutdown.

use std::any::Any;
use std::fmt;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::Mutex;
use polymesh_core::descriptor::{InstanceDescriptor, Presence};
use polymesh_core::envelope::{Reply, ReplyCode, Request};
use polymesh_core::error::{Error, Result};
use polymesh_core::path::ServicePath;
use polymesh_core::Config;
use polymesh_fabric::{Broker, Replier, Socket};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::discovery::{advertised_host, Announcer};
use crate::registry::ServiceRegistry;
use crate::service::{service_name, Service};

/// Lifecycle of a [`Server`]. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Created,
    Bound,
    Broadcasting,
    ShuttingDown,
    Stopped,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

struct Core {
    registry: Arc<ServiceRegistry>,
    socket: Option<Arc<Socket>>,
    announcer: Option<Arc<Announcer>>,
    ticker: Option<JoinHandle<()>>,
    starting: bool,
}

struct Inner {
    id: String,
    config: Config,
    broker: Arc<dyn Broker>,
    state: watch::Sender<ServerState>,
    core: Mutex<Core>,
}

/// Exposes registered services on a socket and announces them for discovery.
pub struct Server {
    inner: Arc<Inner>,
}

impl Server {
    pub fn new(config: Config, broker: Arc<dyn Broker>) -> Self {
        Self::with_registry(config, broker, ServiceRegistry::new())
    }

    /// Create a server around an already populated registry.
    pub fn with_registry(config: Config, broker: Arc<dyn Broker>, registry: ServiceRegistry) -> Self {
        let (state, _) = watch::channel(ServerState::Created);
        Self {
            inner: Arc::new(Inner {
                id: uuid::Uuid::new_v4().simple().to_string(),
                config,
                broker,
                state,
                core: Mutex::new(Core {
                    registry: Arc::new(registry),
                    socket: None,
                    announcer: None,
                    ticker: None,
                    starting: false,
                }),
            }),
        }
    }

    /// Instance id advertised in discovery descriptors.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn state(&self) -> ServerState {
        *self.inner.state.borrow()
    }

    /// Bound address, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.core.lock().socket.as_ref()?.local_addr()
    }

    /// Descriptor published on every broadcast tick, once started.
    pub fn descriptor(&self) -> Option<InstanceDescriptor> {
        let core = self.inner.core.lock();
        core.announcer.as_ref().map(|a| a.descriptor().clone())
    }

    /// Register a service before the server starts.
    ///
    /// The name must not contain the configured path delimiter, or no path
    /// could ever route to it.
    pub fn add_service<S: Service>(&self, service: S) -> Result<String> {
        let name = service_name(&service);
        let delimiter = &self.inner.config.delimiter;
        if !delimiter.is_empty() && name.contains(delimiter.as_str()) {
            return Err(Error::InvalidServiceType(format!(
                "{name:?} contains the path delimiter {delimiter:?}"
            )));
        }

        let mut core = self.inner.core.lock();
        if core.starting || self.state() != ServerState::Created {
            return Err(Error::AlreadyStarted);
        }
        Arc::make_mut(&mut core.registry).register(service)
    }

    /// Bind the socket and start broadcasting presence.
    ///
    /// Returns the bound address.
    pub async fn start(&self) -> Result<SocketAddr> {
        let inner = &self.inner;
        inner.config.validate()?;

        let registry = {
            let mut core = inner.core.lock();
            if core.starting || self.state() != ServerState::Created {
                return Err(Error::AlreadyStarted);
            }
            if core.registry.is_empty() {
                return Err(Error::NoServicesRegistered);
            }
            core.starting = true;
            core.registry.clone()
        };

        let socket = match inner.bind().await {
            Ok(socket) => socket,
            Err(e) => {
                inner.core.lock().starting = false;
                return Err(e);
            }
        };
        let Some(local_addr) = socket.local_addr() else {
            inner.core.lock().starting = false;
            socket.disconnect();
            return Err(Error::Transport("server socket has no local address".to_string()));
        };

        let host = advertised_host(&inner.config);
        let descriptor = InstanceDescriptor::new(&inner.id, host.to_string(), local_addr.port(), registry.names());
        let announcer = Arc::new(Announcer::new(
            inner.broker.clone(),
            descriptor,
            inner.config.groups(),
        ));

        let mut core = inner.core.lock();
        core.starting = false;
        if self.state() != ServerState::Created {
            // Shut down while binding
            drop(core);
            socket.disconnect();
            return Err(Error::custom("server was shut down while starting"));
        }

        core.socket = Some(socket);
        inner.state.send_replace(ServerState::Bound);
        core.ticker = Some(announcer.clone().spawn(inner.config.interval()));
        core.announcer = Some(announcer);
        inner.state.send_replace(ServerState::Broadcasting);

        info!(
            instance = %inner.id,
            %local_addr,
            advertised = %host,
            groups = ?inner.config.groups(),
            services = ?registry.names(),
            "Server started"
        );
        Ok(local_addr)
    }

    /// Announce departure and release the socket and broadcast timer.
    ///
    /// Safe to call more than once.
    pub async fn shutdown(&self) {
        self.inner.shutdown().await;
    }

    /// Resolves once the server has reached [`ServerState::Stopped`].
    pub async fn stopped(&self) {
        let mut state = self.inner.state.subscribe();
        let _ = state.wait_for(|s| *s == ServerState::Stopped).await;
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish()
    }
}

impl Inner {
    async fn bind(self: &Arc<Self>) -> Result<Arc<Socket>> {
        let socket = Arc::new(Socket::server());
        let weak = Arc::downgrade(self);
        let _subscription = socket.on_message(move |message| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let (payload, replier) = message.into_parts();
            if let Some(replier) = replier {
                tokio::spawn(inner.dispatch(payload, replier));
            }
        })?;
        socket
            .connect(self.config.port, &self.config.host)
            .await?;
        Ok(socket)
    }

    async fn dispatch(self: Arc<Self>, payload: Vec<u8>, replier: Replier) {
        let request: Request = match serde_json::from_slice(&payload) {
            Ok(request) => request,
            Err(e) => {
                debug!(peer = %replier.peer_addr(), error = %e, "Malformed request");
                let id = Request::peek_id(&payload).unwrap_or_default();
                self.reply(
                    &replier,
                    Reply::failure(id, None, ReplyCode::InvalidMessage, e.to_string()),
                );
                return;
            }
        };

        let path = ServicePath::split(&request.path, &self.config.delimiter);
        if path.is_shutdown() {
            info!(peer = %replier.peer_addr(), "Shutdown requested by peer");
            self.shutdown().await;
            return;
        }

        let service = path.service.to_string();
        let registry = self.core.lock().registry.clone();
        if !registry.contains(&service) {
            let message = format!("Unknown service: {service}");
            self.reply(
                &replier,
                Reply::failure(request.id, Some(service), ReplyCode::InvalidService, message),
            );
            return;
        }
        let Some(handler) = registry.resolve(&service, path.method) else {
            let message = format!("Unknown method: {}", path.method);
            self.reply(
                &replier,
                Reply::failure(request.id, Some(service), ReplyCode::InvalidMethod, message),
            );
            return;
        };

        let id = request.id.clone();
        let outcome = AssertUnwindSafe(async move { handler(request).await })
            .catch_unwind()
            .await;

        let reply = match outcome {
            Ok(Ok(value)) => Reply::success(id, service, value),
            Ok(Err(e)) => {
                debug!(request = %id, %service, error = %e, "Handler failed");
                Reply::failure(id, Some(service), ReplyCode::HandlerFailed, e.to_string())
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                warn!(request = %id, %service, %message, "Handler panicked");
                Reply::failure(id, Some(service), ReplyCode::HandlerFailed, message)
            }
        };
        self.reply(&replier, reply);
    }

    fn reply(&self, replier: &Replier, reply: Reply) {
        let state = *self.state.borrow();
        if matches!(state, ServerState::ShuttingDown | ServerState::Stopped) {
            debug!(request = %reply.id, %state, "Dropping reply after shutdown");
            return;
        }
        if let Err(e) = replier.reply(&reply) {
            debug!(request = %reply.id, peer = %replier.peer_addr(), error = %e, "Failed to send reply");
        }
    }

    async fn shutdown(&self) {
        let (socket, announcer, ticker) = {
            let mut core = self.core.lock();
            let state = *self.state.borrow();
            if matches!(state, ServerState::ShuttingDown | ServerState::Stopped) {
                return;
            }
            self.state.send_replace(ServerState::ShuttingDown);
            (core.socket.take(), core.announcer.take(), core.ticker.take())
        };

        if let Some(ticker) = ticker {
            ticker.abort();
        }
        if let Some(announcer) = announcer {
            announcer.announce(Presence::Down).await;
        }
        if let Some(socket) = socket {
            socket.disconnect();
        }

        self.state.send_replace(ServerState::Stopped);
        info!(instance = %self.id, "Server stopped");
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(ticker) = self.core.get_mut().ticker.take() {
            ticker.abort();
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}
