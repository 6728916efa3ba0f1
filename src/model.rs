//! Catalog records derived from the mirrored Kubernetes objects.
//!
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Kind of change observed on a mirrored object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Event {
    Add,
    Update,
    Delete,
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Add => write!(f, "add"),
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

/// Application protocol spoken on a service port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Protocol {
    Grpc,
    Http,
    Http2,
    Https,
    Mongo,
    Redis,
    Tcp,
    Udp,
}

impl Protocol {
    /// Case-insensitive protocol lookup from a port name prefix
    #[must_use]
    pub fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix.to_ascii_lowercase().as_str() {
            "grpc" => Some(Self::Grpc),
            "http" => Some(Self::Http),
            "http2" => Some(Self::Http2),
            "https" => Some(Self::Https),
            "mongo" => Some(Self::Mongo),
            "redis" => Some(Self::Redis),
            "tcp" => Some(Self::Tcp),
            "udp" => Some(Self::Udp),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Port {
    pub name: String,
    pub port: i32,
    pub protocol: Protocol,
}

/// Ordered service ports; names are unique within a service
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PortList(pub Vec<Port>);

impl PortList {
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Port> {
        self.0.iter().find(|port| port.name == name)
    }

    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.0.iter().map(|port| port.name.as_str()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Port> {
        self.0.iter()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Service {
    /// `<name>.<namespace>.svc.<domain>`
    pub hostname: String,
    /// Cluster IP, absent for external-name services
    pub address: Option<String>,
    pub external_name: Option<String>,
    pub ports: PortList,
}

impl Service {
    #[must_use]
    pub const fn is_external(&self) -> bool {
        self.external_name.is_some()
    }
}

/// Label key/value pairs attached to a workload
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Tags(pub BTreeMap<String, String>);

impl Tags {
    /// True when every pair of `self` is also present in `other`
    #[must_use]
    pub fn is_subset_of(&self, other: &Self) -> bool {
        self.0
            .iter()
            .all(|(key, value)| other.0.get(key) == Some(value))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Tags {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        )
    }
}

/// Alternative tag filters; an instance matches if any one of them is a subset of its tags
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TagsList(pub Vec<Tags>);

impl TagsList {
    /// An empty list matches everything
    #[must_use]
    pub fn has_subset_of(&self, tags: &Tags) -> bool {
        self.0.is_empty() || self.0.iter().any(|filter| filter.is_subset_of(tags))
    }
}

impl From<Tags> for TagsList {
    fn from(tags: Tags) -> Self {
        Self(vec![tags])
    }
}

/// Region/zone of the node hosting a workload
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize)]
pub enum Locality {
    Zone { region: String, zone: String },
    #[default]
    Unknown,
}

impl fmt::Display for Locality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Zone { region, zone } => write!(f, "{region}/{zone}"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkEndpoint {
    pub address: String,
    pub port: i32,
    pub service_port: Port,
}

/// One concrete backend of a service
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceInstance {
    pub endpoint: NetworkEndpoint,
    pub service: Service,
    pub tags: Tags,
    pub locality: Locality,
}

/// Every instance derived from a single endpoints object, delivered to instance handlers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceSet {
    pub service: Service,
    pub instances: Vec<ServiceInstance>,
}
