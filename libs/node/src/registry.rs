//! Service registry: service name to handler set.

use std::collections::HashMap;
use std::path::Path;

use polymesh_core::error::{Error, Result};
use polymesh_core::path::SHUTDOWN_SENTINEL;
use tracing::debug;

use crate::service::{service_name, Handler, HandlerSet, Service};

/// A registered service. Immutable once registered.
#[derive(Debug, Clone)]
pub struct ServiceRegistration {
    name: String,
    handlers: HandlerSet,
}

impl ServiceRegistration {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handlers(&self) -> &HandlerSet {
        &self.handlers
    }
}

/// Builds a service from one file of a service directory.
pub trait ServiceLoader {
    fn load(&self, path: &Path) -> Result<Box<dyn Service>>;
}

impl<F> ServiceLoader for F
where
    F: Fn(&Path) -> Result<Box<dyn Service>>,
{
    fn load(&self, path: &Path) -> Result<Box<dyn Service>> {
        self(path)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ServiceRegistry {
    services: HashMap<String, ServiceRegistration>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service under its canonical name, which is returned.
    pub fn register<S: Service>(&mut self, service: S) -> Result<String> {
        self.register_dyn(&service)
    }

    pub fn register_boxed(&mut self, service: Box<dyn Service>) -> Result<String> {
        self.register_dyn(service.as_ref())
    }

    /// Register every service in order, stopping at the first failure.
    ///
    /// Services registered before the failure stay registered.
    pub fn register_many<I>(&mut self, services: I) -> Result<Vec<String>>
    where
        I: IntoIterator<Item = Box<dyn Service>>,
    {
        services
            .into_iter()
            .map(|service| self.register_boxed(service))
            .collect()
    }

    /// Register the service `loader` builds from each regular file in `dir`,
    /// in file name order.
    pub fn register_from_directory<L>(&mut self, dir: impl AsRef<Path>, loader: L) -> Result<Vec<String>>
    where
        L: ServiceLoader,
    {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            return Err(Error::config(format!(
                "service directory {} does not exist",
                dir.display()
            )));
        }

        let mut files = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                files.push(entry.path());
            }
        }
        files.sort();

        let mut names = Vec::with_capacity(files.len());
        for file in files {
            let service = loader.load(&file)?;
            let name = self.register_boxed(service)?;
            debug!(service = %name, file = %file.display(), "Loaded service");
            names.push(name);
        }
        Ok(names)
    }

    fn register_dyn(&mut self, service: &dyn Service) -> Result<String> {
        let name = service_name(service);
        if name.is_empty() || name == SHUTDOWN_SENTINEL || name.chars().any(char::is_whitespace) {
            return Err(Error::InvalidServiceType(format!(
                "{:?} is not a usable service name",
                name
            )));
        }
        if self.services.contains_key(&name) {
            return Err(Error::DuplicateService(name));
        }

        let handlers = service.handlers();
        if handlers.is_empty() {
            return Err(Error::InvalidServiceType(format!(
                "service {name} exposes no dispatchable methods"
            )));
        }

        debug!(service = %name, methods = ?handlers.methods(), "Registered service");
        self.services.insert(
            name.clone(),
            ServiceRegistration {
                name: name.clone(),
                handlers,
            },
        );
        Ok(name)
    }

    /// Handler for `service`/`method`.
    ///
    /// Unknown services, unknown methods and reserved methods all resolve to
    /// `None`.
    pub fn resolve(&self, service: &str, method: &str) -> Option<Handler> {
        self.services.get(service)?.handlers.get(method).cloned()
    }

    pub fn get(&self, service: &str) -> Option<&ServiceRegistration> {
        self.services.get(service)
    }

    pub fn contains(&self, service: &str) -> bool {
        self.services.contains_key(service)
    }

    /// Registered service names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.keys().cloned().collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}
