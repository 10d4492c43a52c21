//! Transport socket adapter
//!
//! A [`Socket`] wraps one message-queue style endpoint over TCP:
//!
//! - **Server mode** binds a listener and accepts any number of peers. Every
//!   inbound frame is delivered together with a [`Replier`] bound to the
//!   connection it arrived on.
//! - **Client mode** connects lazily in the background. Frames queued before
//!   the connection is up are written once it is, and a dropped connection is
//!   re-established with capped exponential backoff.
//!
//! Send failures never surface to the caller: they are logged and reported to
//! the error handler, and callers recover through their own timeouts.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, trace, warn};

use crate::codec::{Codec, JsonCodec};
use crate::error::{Error, Result};
use crate::transport::{TcpTransport, TcpTransportListener};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const RECONNECT_MIN: Duration = Duration::from_millis(50);
const RECONNECT_MAX: Duration = Duration::from_secs(2);
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketMode {
    /// Connects to a remote server and sends requests
    Client,
    /// Binds locally and answers requests
    Server,
}

impl fmt::Display for SocketMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocketMode::Client => f.write_str("client"),
            SocketMode::Server => f.write_str("server"),
        }
    }
}

pub type MessageHandler = Arc<dyn Fn(Message) + Send + Sync>;
pub type ErrorHandler = Arc<dyn Fn(&Error) + Send + Sync>;

struct Outgoing {
    frame: Vec<u8>,
    flushed: Option<oneshot::Sender<()>>,
}

impl Outgoing {
    fn done(self) {
        if let Some(flushed) = self.flushed {
            let _ = flushed.send(());
        }
    }
}

/// A frame received on a socket
pub struct Message {
    payload: Vec<u8>,
    replier: Option<Replier>,
}

impl Message {
    fn new(payload: Vec<u8>, replier: Option<Replier>) -> Self {
        Self { payload, replier }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        JsonCodec.decode(&self.payload)
    }

    /// Reply path back to the sender; only server-mode messages carry one
    pub fn replier(&self) -> Option<&Replier> {
        self.replier.as_ref()
    }

    pub fn into_parts(self) -> (Vec<u8>, Option<Replier>) {
        (self.payload, self.replier)
    }
}

/// Sends replies on the connection a message arrived on
#[derive(Clone)]
pub struct Replier {
    outbox: mpsc::UnboundedSender<Outgoing>,
    peer: SocketAddr,
}

impl Replier {
    pub fn reply<T: Serialize + ?Sized>(&self, message: &T) -> Result<()> {
        let frame = JsonCodec.encode(message)?;
        self.outbox
            .send(Outgoing {
                frame,
                flushed: None,
            })
            .map_err(|_| Error::ConnectionClosed)
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.outbox.is_closed()
    }
}

#[derive(Default)]
struct Handlers {
    message: Mutex<Option<MessageHandler>>,
    error: Mutex<Option<ErrorHandler>>,
}

impl Handlers {
    fn deliver(&self, message: Message) {
        let handler = self.message.lock().clone();
        match handler {
            Some(handler) => handler(message),
            None => debug!(len = message.payload.len(), "No message handler, dropping frame"),
        }
    }

    fn report(&self, err: Error) {
        match &err {
            Error::ConnectionClosed => debug!("Connection closed by peer"),
            _ => warn!(error = %err, "Socket error"),
        }
        let handler = self.error.lock().clone();
        if let Some(handler) = handler {
            handler(&err);
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Event {
    Message,
    Error,
}

/// Handle to a registered socket handler
///
/// Cancelling it unregisters the handler, after which a new one may be set.
#[must_use = "dropping a Subscription keeps the handler registered"]
pub struct Subscription {
    handlers: Weak<Handlers>,
    event: Event,
}

impl Subscription {
    pub fn cancel(self) {
        if let Some(handlers) = self.handlers.upgrade() {
            match self.event {
                Event::Message => *handlers.message.lock() = None,
                Event::Error => *handlers.error.lock() = None,
            }
        }
    }
}

enum State {
    Idle,
    Open {
        outbox: Option<mpsc::UnboundedSender<Outgoing>>,
        task: JoinHandle<()>,
        local_addr: Option<SocketAddr>,
    },
    Closed,
}

/// One bidirectional message socket in client or server mode
pub struct Socket {
    id: String,
    mode: SocketMode,
    handlers: Arc<Handlers>,
    state: Mutex<State>,
}

impl Socket {
    pub fn new(mode: SocketMode) -> Self {
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            mode,
            handlers: Arc::new(Handlers::default()),
            state: Mutex::new(State::Idle),
        }
    }

    pub fn client() -> Self {
        Self::new(SocketMode::Client)
    }

    pub fn server() -> Self {
        Self::new(SocketMode::Server)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn mode(&self) -> SocketMode {
        self.mode
    }

    pub fn is_connected(&self) -> bool {
        matches!(*self.state.lock(), State::Open { .. })
    }

    /// Bound address of a server-mode socket
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &*self.state.lock() {
            State::Open { local_addr, .. } => *local_addr,
            _ => None,
        }
    }

    /// Register the handler for inbound frames
    ///
    /// Fails with [`Error::InvalidHandler`] if one is already registered.
    pub fn on_message<F>(&self, handler: F) -> Result<Subscription>
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        let mut slot = self.handlers.message.lock();
        if slot.is_some() {
            return Err(Error::InvalidHandler(
                "message handler already registered".to_string(),
            ));
        }
        *slot = Some(Arc::new(handler));
        Ok(Subscription {
            handlers: Arc::downgrade(&self.handlers),
            event: Event::Message,
        })
    }

    /// Register the handler for transport failures
    pub fn on_error<F>(&self, handler: F) -> Result<Subscription>
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
        let mut slot = self.handlers.error.lock();
        if slot.is_some() {
            return Err(Error::InvalidHandler(
                "error handler already registered".to_string(),
            ));
        }
        *slot = Some(Arc::new(handler));
        Ok(Subscription {
            handlers: Arc::downgrade(&self.handlers),
            event: Event::Error,
        })
    }

    /// Bind (server mode) or connect (client mode) to `host:port`
    ///
    /// Client mode returns as soon as the connection task is running; the
    /// TCP connection itself is established in the background.
    pub async fn connect(&self, port: u16, host: &str) -> Result<()> {
        self.ensure_idle()?;

        let opened = match self.mode {
            SocketMode::Server => {
                let listener = TcpTransportListener::bind(host, port).await?;
                let local_addr = listener.local_addr()?;
                debug!(socket = %self.id, %local_addr, "Socket bound");
                State::Open {
                    outbox: None,
                    task: tokio::spawn(accept_loop(listener, self.handlers.clone())),
                    local_addr: Some(local_addr),
                }
            }
            SocketMode::Client => {
                let (tx, rx) = mpsc::unbounded_channel();
                let address = host_port(host, port);
                debug!(socket = %self.id, %address, "Socket connecting");
                State::Open {
                    outbox: Some(tx),
                    task: tokio::spawn(client_loop(address, rx, self.handlers.clone())),
                    local_addr: None,
                }
            }
        };

        let mut state = self.state.lock();
        if !matches!(*state, State::Idle) {
            if let State::Open { task, .. } = opened {
                task.abort();
            }
            return Err(Error::Custom("Socket already connected".to_string()));
        }
        *state = opened;
        Ok(())
    }

    fn ensure_idle(&self) -> Result<()> {
        match *self.state.lock() {
            State::Idle => Ok(()),
            State::Open { .. } => Err(Error::Custom("Socket already connected".to_string())),
            State::Closed => Err(Error::ConnectionClosed),
        }
    }

    /// Serialize and queue a message; failures are logged, not returned
    pub fn send<T: Serialize + ?Sized>(&self, message: &T) {
        match JsonCodec.encode(message) {
            Ok(frame) => self.send_raw(frame),
            Err(e) => warn!(socket = %self.id, error = %e, "Dropping unserializable message"),
        }
    }

    /// Queue an already encoded frame
    pub fn send_raw(&self, frame: impl Into<Vec<u8>>) {
        let outgoing = Outgoing {
            frame: frame.into(),
            flushed: None,
        };
        if let Err(e) = self.enqueue(outgoing) {
            debug!(socket = %self.id, mode = %self.mode, error = %e, "Dropping outgoing frame");
        }
    }

    /// Queue a message and wait until it has been written to the peer
    pub async fn send_flushed<T: Serialize + ?Sized>(&self, message: &T) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.enqueue(Outgoing {
            frame: JsonCodec.encode(message)?,
            flushed: Some(tx),
        })?;
        rx.await.map_err(|_| Error::ConnectionClosed)
    }

    fn enqueue(&self, outgoing: Outgoing) -> Result<()> {
        let state = self.state.lock();
        match &*state {
            State::Open {
                outbox: Some(outbox),
                ..
            } => outbox.send(outgoing).map_err(|_| Error::ConnectionClosed),
            State::Open { outbox: None, .. } => Err(Error::Custom(
                "Server socket replies through the inbound message".to_string(),
            )),
            _ => Err(Error::NotConnected),
        }
    }

    /// Release the socket without waiting for queued frames to flush
    ///
    /// Safe to call more than once.
    pub fn disconnect(&self) {
        let previous = std::mem::replace(&mut *self.state.lock(), State::Closed);
        if let State::Open { task, .. } = previous {
            task.abort();
            debug!(socket = %self.id, mode = %self.mode, "Socket disconnected");
        }
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .field("connected", &self.is_connected())
            .finish()
    }
}

fn host_port(host: &str, port: u16) -> String {
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V6(ip)) => format!("[{ip}]:{port}"),
        _ => format!("{host}:{port}"),
    }
}

async fn client_loop(
    address: String,
    mut outbox: mpsc::UnboundedReceiver<Outgoing>,
    handlers: Arc<Handlers>,
) {
    let mut backoff = RECONNECT_MIN;
    loop {
        let connected = TcpTransport::builder()
            .address(address.clone())
            .connect_timeout(CONNECT_TIMEOUT)
            .connect()
            .await;

        let transport = match connected {
            Ok(transport) => transport,
            Err(e) => {
                handlers.report(e);
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(RECONNECT_MAX);
                continue;
            }
        };
        backoff = RECONNECT_MIN;
        trace!(%address, "Connected");

        let (mut reader, mut writer) = transport.into_split();

        let reading = async {
            loop {
                match reader.receive().await {
                    Ok(frame) => handlers.deliver(Message::new(frame, None)),
                    Err(e) => break e,
                }
            }
        };

        let writing = async {
            while let Some(outgoing) = outbox.recv().await {
                writer.send(&outgoing.frame).await?;
                outgoing.done();
            }
            Ok::<(), Error>(())
        };

        tokio::select! {
            err = reading => handlers.report(err),
            res = writing => match res {
                // Every sender is gone: the socket itself was dropped
                Ok(()) => return,
                Err(e) => handlers.report(e),
            },
        }
    }
}

async fn accept_loop(listener: TcpTransportListener, handlers: Arc<Handlers>) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((transport, peer)) => {
                    trace!(%peer, "Accepted connection");
                    connections.spawn(serve_connection(transport, peer, handlers.clone()));
                }
                Err(e) => {
                    handlers.report(e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
}

async fn serve_connection(transport: TcpTransport, peer: SocketAddr, handlers: Arc<Handlers>) {
    let (mut reader, mut writer) = transport.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Outgoing>();

    let reading = async {
        loop {
            match reader.receive().await {
                Ok(frame) => {
                    let replier = Replier {
                        outbox: tx.clone(),
                        peer,
                    };
                    handlers.deliver(Message::new(frame, Some(replier)));
                }
                Err(e) => break e,
            }
        }
    };

    let writing = async {
        while let Some(outgoing) = rx.recv().await {
            writer.send(&outgoing.frame).await?;
            outgoing.done();
        }
        Ok::<(), Error>(())
    };

    tokio::select! {
        err = reading => handlers.report(err),
        res = writing => {
            if let Err(e) = res {
                handlers.report(e);
            }
        }
    }
}
