//! Client coordinator
//!
//! Tracks server instances through discovery events, load balances requests
//! across them and correlates replies with their callers.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use polymesh_core::descriptor::{InstanceDescriptor, Presence};
use polymesh_core::envelope::{Reply, Request};
use polymesh_core::error::{Error, Result};
use polymesh_core::path::ServicePath;
use polymesh_core::Config;
use polymesh_fabric::{Broker, BrokerMessage, BrokerSubscription, Socket};
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, trace, warn};

const NOTIFY_TIMEOUT: Duration = Duration::from_millis(250);

struct Peer {
    socket: Arc<Socket>,
    last_seen: Instant,
}

struct PendingRequest {
    target: String,
    service: String,
    created_at: Instant,
    responder: oneshot::Sender<Result<Value>>,
    expiry: Option<AbortHandle>,
}

impl PendingRequest {
    fn resolve(self, result: Result<Value>) {
        if let Some(expiry) = self.expiry {
            expiry.abort();
        }
        // The caller may have stopped waiting
        let _ = self.responder.send(result);
    }
}

#[derive(Default)]
struct State {
    started: bool,
    closed: bool,
    /// Services to open sockets for; empty tracks every advertised service
    tracked: HashSet<String>,
    services: HashMap<String, HashMap<String, Peer>>,
    pending: HashMap<String, PendingRequest>,
    tasks: Vec<JoinHandle<()>>,
    broker: Option<Arc<dyn Broker>>,
}

impl State {
    fn tracks(&self, service: &str) -> bool {
        self.tracked.is_empty() || self.tracked.contains(service)
    }

    fn take_pending_for(&mut self, instance: &str) -> Vec<PendingRequest> {
        let ids: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, p)| p.target == instance)
            .map(|(id, _)| id.clone())
            .collect();
        ids.iter().filter_map(|id| self.pending.remove(id)).collect()
    }
}

struct Inner {
    config: Config,
    state: Mutex<State>,
}

/// Sends requests to discovered server instances.
pub struct Client {
    inner: Arc<Inner>,
}

impl Client {
    pub fn new(config: Config, broker: Arc<dyn Broker>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(State {
                    broker: Some(broker),
                    ..State::default()
                }),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Subscribe to discovery and begin tracking `services`.
    ///
    /// An empty list tracks every service any instance advertises.
    pub async fn start<I, S>(&self, services: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let inner = &self.inner;
        inner.config.validate()?;

        let broker = {
            let mut state = inner.state.lock();
            if state.closed {
                return Err(Error::ClientShuttingDown);
            }
            if state.started {
                return Err(Error::AlreadyStarted);
            }
            state.started = true;
            state.tracked = services.into_iter().map(Into::into).collect();
            let tracked: Vec<String> = state.tracked.iter().cloned().collect();
            for service in tracked {
                state.services.entry(service).or_default();
            }
            state.broker.clone().ok_or(Error::ClientShuttingDown)?
        };

        let groups = inner.config.groups();
        let channels: Vec<String> = groups
            .iter()
            .flat_map(|g| [Presence::Up.channel(g), Presence::Down.channel(g)])
            .collect();
        let subscription = match broker.subscribe(&channels).await {
            Ok(subscription) => subscription,
            Err(e) => {
                let mut state = inner.state.lock();
                state.started = false;
                state.tracked.clear();
                state.services.clear();
                return Err(e.into());
            }
        };

        let discovery = tokio::spawn(discovery_loop(Arc::downgrade(inner), subscription));
        let sweeper = tokio::spawn(sweep_loop(Arc::downgrade(inner), inner.config.interval()));

        let mut state = inner.state.lock();
        if state.closed {
            discovery.abort();
            sweeper.abort();
            return Err(Error::ClientShuttingDown);
        }
        state.tasks.extend([discovery, sweeper]);
        info!(?groups, tracked = ?state.tracked, "Client started");
        Ok(())
    }

    /// Send `data` to `path` and wait for the reply.
    ///
    /// `timeout` overrides the configured default; with neither, the request
    /// only expires through the stale sweep.
    pub async fn send(&self, path: &str, data: Value, timeout: Option<Duration>) -> Result<Value> {
        let inner = &self.inner;
        let parsed = ServicePath::parse(path, &inner.config.delimiter)?;
        let timeout = timeout.or_else(|| inner.config.timeout());

        let (id, target, socket, reply) = {
            let mut state = inner.state.lock();
            if state.closed {
                return Err(Error::ClientShuttingDown);
            }

            let peers = state
                .services
                .get(parsed.service)
                .ok_or_else(|| Error::UnknownService(parsed.service.to_string()))?;
            let index = match peers.len() {
                0 => return Err(Error::NoInstanceAvailable(parsed.service.to_string())),
                n => rand::rng().random_range(0..n),
            };
            let (target, peer) = peers
                .iter()
                .nth(index)
                .ok_or_else(|| Error::NoInstanceAvailable(parsed.service.to_string()))?;
            let (target, socket) = (target.clone(), peer.socket.clone());

            let id = loop {
                let id = uuid::Uuid::new_v4().simple().to_string();
                if !state.pending.contains_key(&id) {
                    break id;
                }
            };

            let expiry = timeout.map(|after| {
                let weak = Arc::downgrade(inner);
                let id = id.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(after).await;
                    if let Some(inner) = weak.upgrade() {
                        inner.expire(&id, after);
                    }
                })
                .abort_handle()
            });

            let (responder, reply) = oneshot::channel();
            state.pending.insert(
                id.clone(),
                PendingRequest {
                    target: target.clone(),
                    service: parsed.service.to_string(),
                    created_at: Instant::now(),
                    responder,
                    expiry,
                },
            );
            (id, target, socket, reply)
        };

        trace!(request = %id, %path, instance = %target, "Sending request");
        socket.send(&Request::new(id, path, data));

        reply.await.unwrap_or(Err(Error::ClientShuttingDown))
    }

    /// Typed wrapper around [`Client::send`] using the default timeout.
    pub async fn call<Req, Res>(&self, path: &str, request: &Req) -> Result<Res>
    where
        Req: Serialize + ?Sized,
        Res: DeserializeOwned,
    {
        let data = serde_json::to_value(request)?;
        let value = self.send(path, data, None).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Known instance ids for `service`, sorted.
    pub fn instances(&self, service: &str) -> Vec<String> {
        let state = self.inner.state.lock();
        let mut ids: Vec<String> = state
            .services
            .get(service)
            .map(|peers| peers.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }

    /// Number of requests awaiting a reply.
    pub fn pending(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    /// Feed a discovery message as if it came from the broker.
    pub async fn handle_discovery(&self, message: BrokerMessage) {
        self.inner.on_discovery(message).await;
    }

    /// Release every socket and fail every pending request.
    ///
    /// With `notify_remote`, each known instance is first sent the shutdown
    /// sentinel. Safe to call more than once.
    pub async fn shutdown(&self, notify_remote: bool) {
        let (services, pending, tasks, broker) = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            (
                std::mem::take(&mut state.services),
                std::mem::take(&mut state.pending),
                std::mem::take(&mut state.tasks),
                state.broker.take(),
            )
        };

        for task in tasks {
            task.abort();
        }
        drop(broker);

        if notify_remote {
            let mut notified = HashSet::new();
            for (instance, peer) in services.values().flat_map(|peers| peers.iter()) {
                if !notified.insert(instance.as_str()) {
                    continue;
                }
                let id = uuid::Uuid::new_v4().simple().to_string();
                let request = Request::shutdown(id, &self.inner.config.delimiter);
                match tokio::time::timeout(NOTIFY_TIMEOUT, peer.socket.send_flushed(&request)).await {
                    Ok(Ok(())) => debug!(%instance, "Sent shutdown notice"),
                    Ok(Err(e)) => warn!(%instance, error = %e, "Failed to send shutdown notice"),
                    Err(_) => warn!(%instance, "Timed out sending shutdown notice"),
                }
            }
        }

        for peer in services.into_values().flat_map(HashMap::into_values) {
            peer.socket.disconnect();
        }

        let cancelled = pending.len();
        for (_, request) in pending {
            request.resolve(Err(Error::ClientShuttingDown));
        }
        info!(cancelled, "Client stopped");
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Client")
            .field("started", &state.started)
            .field("closed", &state.closed)
            .field("services", &state.services.len())
            .field("pending", &state.pending.len())
            .finish()
    }
}

impl Inner {
    async fn on_discovery(self: &Arc<Self>, message: BrokerMessage) {
        let Some((presence, group)) = Presence::parse(&message.channel) else {
            debug!(channel = %message.channel, "Ignoring message on unknown channel");
            return;
        };
        let descriptor = match InstanceDescriptor::decode(&message.payload) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                warn!(%group, error = %e, "Malformed instance descriptor");
                return;
            }
        };

        match presence {
            Presence::Up => self.instance_up(descriptor).await,
            Presence::Down => self.instance_down(&descriptor.id),
        }
    }

    async fn instance_up(self: &Arc<Self>, descriptor: InstanceDescriptor) {
        let missing: Vec<String> = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            let mut missing = Vec::new();
            for service in &descriptor.services {
                if !state.tracks(service) {
                    continue;
                }
                match state
                    .services
                    .get_mut(service)
                    .and_then(|peers| peers.get_mut(&descriptor.id))
                {
                    Some(peer) => peer.last_seen = Instant::now(),
                    None => missing.push(service.clone()),
                }
            }
            missing
        };

        for service in missing {
            let socket = match self.open_socket(&descriptor).await {
                Ok(socket) => socket,
                Err(e) => {
                    warn!(%service, instance = %descriptor.id, error = %e, "Failed to open socket");
                    continue;
                }
            };

            let mut state = self.state.lock();
            if state.closed {
                socket.disconnect();
                return;
            }
            debug!(
                %service,
                instance = %descriptor.id,
                address = %format!("{}:{}", descriptor.host, descriptor.port),
                "Instance up"
            );
            state.services.entry(service).or_default().insert(
                descriptor.id.clone(),
                Peer {
                    socket,
                    last_seen: Instant::now(),
                },
            );
        }
    }

    async fn open_socket(self: &Arc<Self>, descriptor: &InstanceDescriptor) -> Result<Arc<Socket>> {
        let socket = Arc::new(Socket::client());
        let weak = Arc::downgrade(self);
        let _subscription = socket.on_message(move |message| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_reply(message.payload());
            }
        })?;
        socket.connect(descriptor.port, &descriptor.host).await?;
        Ok(socket)
    }

    fn instance_down(&self, instance: &str) {
        let (sockets, reaped) = {
            let mut state = self.state.lock();
            let sockets: Vec<Arc<Socket>> = state
                .services
                .values_mut()
                .filter_map(|peers| peers.remove(instance))
                .map(|peer| peer.socket)
                .collect();
            (sockets, state.take_pending_for(instance))
        };

        if sockets.is_empty() && reaped.is_empty() {
            return;
        }
        debug!(%instance, reaped = reaped.len(), "Instance down");

        for socket in sockets {
            socket.disconnect();
        }
        for request in reaped {
            let error = Error::ServiceUnavailable {
                service: request.service.clone(),
                instance: instance.to_string(),
            };
            request.resolve(Err(error));
        }
    }

    fn handle_reply(&self, payload: &[u8]) {
        let reply: Reply = match serde_json::from_slice(payload) {
            Ok(reply) => reply,
            Err(e) => {
                debug!(error = %e, "Dropping malformed reply");
                return;
            }
        };

        let pending = self.state.lock().pending.remove(&reply.id);
        match pending {
            Some(request) => request.resolve(reply.into_result()),
            None => debug!(request = %reply.id, "Dropping reply without a pending request"),
        }
    }

    fn expire(&self, id: &str, after: Duration) {
        let pending = self.state.lock().pending.remove(id);
        if let Some(request) = pending {
            debug!(request = %id, ?after, "Request timed out");
            request.resolve(Err(Error::RequestTimeout {
                id: id.to_string(),
                after,
            }));
        }
    }

    /// Expire requests without a timer once they are older than `stale`, and
    /// drop instances that have not announced themselves within `stale`.
    fn sweep(&self) {
        let stale = self.config.stale();
        let (silent, expired): (HashSet<String>, Vec<(String, PendingRequest)>) = {
            let mut state = self.state.lock();
            let silent = state
                .services
                .values()
                .flat_map(|peers| peers.iter())
                .filter(|(_, peer)| peer.last_seen.elapsed() >= stale)
                .map(|(instance, _)| instance.clone())
                .collect();

            let ids: Vec<String> = state
                .pending
                .iter()
                .filter(|(_, p)| p.expiry.is_none() && p.created_at.elapsed() >= stale)
                .map(|(id, _)| id.clone())
                .collect();
            let expired = ids
                .into_iter()
                .filter_map(|id| state.pending.remove(&id).map(|p| (id, p)))
                .collect();
            (silent, expired)
        };

        for instance in silent {
            debug!(%instance, ?stale, "No announcement from instance, dropping it");
            self.instance_down(&instance);
        }

        for (id, request) in expired {
            let age = request.created_at.elapsed();
            debug!(request = %id, ?age, "Request expired");
            request.resolve(Err(Error::MessageExpired { id, age }));
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        for task in self.state.get_mut().tasks.drain(..) {
            task.abort();
        }
    }
}

async fn discovery_loop(inner: Weak<Inner>, mut subscription: BrokerSubscription) {
    while let Some(message) = subscription.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.on_discovery(message).await;
    }
    debug!("Discovery subscription closed");
}

async fn sweep_loop(inner: Weak<Inner>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick completes immediately
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.sweep();
    }
}
