//! Instance descriptors and the discovery channels they travel on.

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Presence snapshot a server publishes on every broadcast tick:
/// `{ "_": id, "i": host, "p": port, "s": [services] }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceDescriptor {
    #[serde(rename = "_")]
    pub id: String,

    #[serde(rename = "i")]
    pub host: String,

    #[serde(rename = "p")]
    pub port: u16,

    #[serde(rename = "s", default)]
    pub services: Vec<String>,
}

impl InstanceDescriptor {
    pub fn new(
        id: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        services: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            port,
            services: services.into_iter().map(Into::into).collect(),
        }
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(payload: &str) -> Result<Self> {
        Ok(serde_json::from_str(payload)?)
    }

    pub fn exposes(&self, service: &str) -> bool {
        self.services.iter().any(|s| s == service)
    }
}

/// Presence event carried by a discovery channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Up,
    Down,
}

impl Presence {
    fn prefix(self) -> &'static str {
        match self {
            Presence::Up => "up-",
            Presence::Down => "down-",
        }
    }

    /// Channel name for this event in `group`.
    pub fn channel(self, group: &str) -> String {
        format!("{}{}", self.prefix(), group)
    }

    /// Split a channel name into its event and group.
    pub fn parse(channel: &str) -> Option<(Presence, &str)> {
        [Presence::Up, Presence::Down]
            .into_iter()
            .find_map(|p| channel.strip_prefix(p.prefix()).map(|group| (p, group)))
            .filter(|(_, group)| !group.is_empty())
    }
}

pub fn up_channel(group: &str) -> String {
    Presence::Up.channel(group)
}

pub fn down_channel(group: &str) -> String {
    Presence::Down.channel(group)
}
