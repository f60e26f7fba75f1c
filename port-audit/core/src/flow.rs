use crate::format::write_row;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// The direction of a flow relative to the node.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    #[default]
    Ingress,
}

/// Transport protocol of a flow.
///
/// Variants are declared in lexicographic order of their rendered names so
/// the derived `Ord` agrees with sorting by name.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Protocol {
    #[default]
    #[serde(rename = "TCP")]
    Tcp,
    #[serde(rename = "UDP")]
    Udp,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("unknown protocol: {0}")]
pub struct InvalidProtocol(String);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("unknown direction: {0}")]
pub struct InvalidDirection(String);

/// One observed or declared ingress flow.
///
/// Equality is structural; flow identity (see [`FlowRecord::key`]) only
/// covers the node group, protocol and port.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FlowRecord {
    pub direction: Direction,
    pub protocol: Protocol,
    pub port: u16,
    pub namespace: String,
    pub service: String,
    pub pod: String,
    pub container: String,
    pub node_group: String,
    pub optional: bool,
}

/// The identity of a [`FlowRecord`].
///
/// Field order defines the canonical matrix order: node group, then
/// protocol, then port.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FlowKey<'a> {
    pub node_group: &'a str,
    pub protocol: Protocol,
    pub port: u16,
}

/// A declared, inclusive port interval that policy allows on every node
/// group, e.g. a NodePort or ephemeral range.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DynamicRange {
    pub direction: Direction,
    pub protocol: Protocol,
    pub min_port: u16,
    pub max_port: u16,
    pub description: String,
    pub optional: bool,
}

// === impl Direction ===

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ingress => "Ingress",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = InvalidDirection;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("ingress") {
            Ok(Self::Ingress)
        } else {
            Err(InvalidDirection(s.to_string()))
        }
    }
}

// === impl Protocol ===

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "TCP",
            Self::Udp => "UDP",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = InvalidProtocol;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("tcp") {
            Ok(Self::Tcp)
        } else if s.eq_ignore_ascii_case("udp") {
            Ok(Self::Udp)
        } else {
            Err(InvalidProtocol(s.to_string()))
        }
    }
}

// === impl FlowRecord ===

impl FlowRecord {
    /// Creates an ingress record with no workload attribution.
    pub fn ingress(node_group: impl Into<String>, protocol: Protocol, port: u16) -> Self {
        Self {
            direction: Direction::Ingress,
            protocol,
            port,
            node_group: node_group.into(),
            ..Default::default()
        }
    }

    #[inline]
    pub fn key(&self) -> FlowKey<'_> {
        FlowKey {
            node_group: &self.node_group,
            protocol: self.protocol,
            port: self.port,
        }
    }

    /// Returns true if both records describe the same flow, ignoring
    /// workload attribution.
    #[inline]
    pub fn same_flow(&self, other: &Self) -> bool {
        self.key() == other.key()
    }

    pub(crate) fn fields(&self) -> [String; 9] {
        [
            self.direction.to_string(),
            self.protocol.to_string(),
            self.port.to_string(),
            self.namespace.clone(),
            self.service.clone(),
            self.pod.clone(),
            self.container.clone(),
            self.node_group.clone(),
            self.optional.to_string(),
        ]
    }
}

/// Renders the record as a single CSV row in canonical column order.
impl fmt::Display for FlowRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_row(f, &self.fields())
    }
}

// === impl DynamicRange ===

impl DynamicRange {
    pub fn ingress(
        protocol: Protocol,
        min_port: u16,
        max_port: u16,
        description: impl Into<String>,
    ) -> Self {
        Self {
            direction: Direction::Ingress,
            protocol,
            min_port,
            max_port,
            description: description.into(),
            optional: false,
        }
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.min_port..=self.max_port).contains(&port)
    }

    pub(crate) fn port_spec(&self) -> String {
        format!("{}-{}", self.min_port, self.max_port)
    }

    pub(crate) fn fields(&self) -> [String; 9] {
        [
            self.direction.to_string(),
            self.protocol.to_string(),
            self.port_spec(),
            String::new(),
            self.description.clone(),
            String::new(),
            String::new(),
            String::new(),
            self.optional.to_string(),
        ]
    }
}

impl fmt::Display for DynamicRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_row(f, &self.fields())
    }
}
