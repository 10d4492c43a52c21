//! Service definitions: a stable name plus a set of async method handlers.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use polymesh_core::envelope::Request;
use polymesh_core::path::is_reserved;
use serde_json::Value;

/// What a handler resolves to; errors become a failure reply.
pub type HandlerResult = anyhow::Result<Value>;

/// A type-erased async method handler.
pub type Handler = Arc<dyn Fn(Request) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Method name to handler mapping exposed by a service.
#[derive(Clone, Default)]
pub struct HandlerSet {
    handlers: HashMap<String, Handler>,
}

impl HandlerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handler for `method`, replacing any previous one.
    ///
    /// Methods starting with the reserved prefix may be added but are never
    /// dispatched.
    pub fn handler<F, Fut>(mut self, method: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |request| handler(request).boxed());
        self.handlers.insert(method.into(), handler);
        self
    }

    /// Dispatchable handler for `method`.
    pub fn get(&self, method: &str) -> Option<&Handler> {
        if method.is_empty() || is_reserved(method) {
            return None;
        }
        self.handlers.get(method)
    }

    /// Dispatchable method names, sorted.
    pub fn methods(&self) -> Vec<&str> {
        let mut methods: Vec<&str> = self
            .handlers
            .keys()
            .map(String::as_str)
            .filter(|m| !m.is_empty() && !is_reserved(m))
            .collect();
        methods.sort_unstable();
        methods
    }

    pub fn is_empty(&self) -> bool {
        self.methods().is_empty()
    }
}

impl fmt::Debug for HandlerSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.handlers.keys()).finish()
    }
}

/// A handler container that can be registered with a server.
///
/// The registered name is [`Service::name`] when it returns one, otherwise
/// the type's identifier with its first character lowercased
/// (`EchoService` becomes `echoService`).
pub trait Service: Send + Sync + 'static {
    /// Explicit name overriding the derived one.
    fn name(&self) -> Option<String> {
        None
    }

    /// Methods this service exposes.
    fn handlers(&self) -> HandlerSet;

    #[doc(hidden)]
    fn type_name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Canonical registration name of a service.
pub fn service_name(service: &dyn Service) -> String {
    service
        .name()
        .unwrap_or_else(|| derive_name(service.type_name()))
}

fn derive_name(type_name: &str) -> String {
    let base = type_name.split('<').next().unwrap_or(type_name);
    let ident = base.rsplit("::").next().unwrap_or(base);
    let mut chars = ident.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// A service assembled from a name and handlers, without a dedicated type.
#[derive(Debug, Clone)]
pub struct ServiceDefinition {
    name: String,
    handlers: HandlerSet,
}

impl ServiceDefinition {
    pub fn new(name: impl Into<String>, handlers: HandlerSet) -> Self {
        Self {
            name: name.into(),
            handlers,
        }
    }
}

impl Service for ServiceDefinition {
    fn name(&self) -> Option<String> {
        Some(self.name.clone())
    }

    fn handlers(&self) -> HandlerSet {
        self.handlers.clone()
    }
}
