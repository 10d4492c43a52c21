//! Runtime configuration shared by servers and clients.
//!
//! Sources, later ones overriding earlier ones:
//! 1. Built-in defaults
//! 2. An optional TOML file
//! 3. Environment variables prefixed with `POLYMESH_` (e.g. `POLYMESH_TIMEOUT=500`)

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{Error, Result};

pub const DEFAULT_GROUP: &str = "polymesh";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Separator between service and method in a service path
    pub delimiter: String,
    /// Network interface whose address is advertised (an IP literal is used as-is)
    pub iface: String,
    /// Broadcast and sweep period in milliseconds
    pub interval: u64,
    /// Log filter used when no `RUST_LOG` is set
    pub logs: String,
    /// Group joined when `group` is empty
    pub name: String,
    /// Discovery groups, given as a list or a whitespace-separated string
    #[serde(deserialize_with = "groups")]
    pub group: Vec<String>,
    /// Host the server socket binds to
    pub host: String,
    /// Port the server socket binds to (0 picks a free port)
    pub port: u16,
    /// Default per-request timeout in milliseconds
    pub timeout: Option<u64>,
    /// Age in milliseconds after which a request without a timer is expired
    pub stale: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            delimiter: ".".to_string(),
            iface: "eth0".to_string(),
            interval: 3000,
            logs: "info".to_string(),
            name: DEFAULT_GROUP.to_string(),
            group: Vec::new(),
            host: "0.0.0.0".to_string(),
            port: 8000,
            timeout: None,
            stale: 60_000,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Groups {
    Joined(String),
    List(Vec<String>),
}

fn groups<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Groups::deserialize(deserializer)? {
        Groups::Joined(s) => s.split_whitespace().map(str::to_string).collect(),
        Groups::List(list) => list,
    })
}

impl Config {
    /// Load configuration from defaults, an optional file and the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path));
        }

        builder = builder.add_source(
            ::config::Environment::with_prefix("POLYMESH").try_parsing(true),
        );

        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.delimiter.is_empty() {
            return Err(Error::config("delimiter must not be empty"));
        }
        if self.interval == 0 {
            return Err(Error::config("interval must be greater than zero"));
        }
        if self.stale == 0 {
            return Err(Error::config("stale must be greater than zero"));
        }
        if self
            .groups()
            .iter()
            .any(|g| g.trim().is_empty() || g.chars().any(char::is_whitespace))
        {
            return Err(Error::config(
                "groups must be non-empty and contain no whitespace",
            ));
        }
        Ok(())
    }

    /// Groups this process belongs to; falls back to `name`
    pub fn groups(&self) -> Vec<String> {
        if self.group.is_empty() {
            vec![self.name.clone()]
        } else {
            self.group.clone()
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout.map(Duration::from_millis)
    }

    pub fn stale(&self) -> Duration {
        Duration::from_millis(self.stale)
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group.push(group.into());
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval.as_millis() as u64;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_stale(mut self, stale: Duration) -> Self {
        self.stale = stale.as_millis() as u64;
        self
    }
}
