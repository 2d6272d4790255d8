// ABOUTME: Upstream source records and the poller interface the loop pulls them through
// ABOUTME: A record is one microservice's identity plus its port bindings

pub mod client;
pub mod models;

use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeSet;

use crate::proxy::RouteRule;

pub use client::{ClientCredentials, ControllerClient};

/// Protocol assumed for bindings that don't declare one.
pub const DEFAULT_PROTOCOL: &str = "http";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortBinding {
    pub internal: u16,
    pub external: u16,
    pub protocol: String,
}

impl PortBinding {
    pub fn is_published(&self) -> bool {
        self.external != 0
    }
}

/// One upstream workload. `id` is the stable key; `name` is only a label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRecord {
    pub id: String,
    pub name: String,
    pub ports: Vec<PortBinding>,
}

impl SourceRecord {
    pub fn published_ports(&self) -> BTreeSet<u16> {
        self.ports
            .iter()
            .filter(|p| p.is_published())
            .map(|p| p.external)
            .collect()
    }

    pub fn route_rules(&self) -> Vec<RouteRule> {
        self.published_ports()
            .into_iter()
            .map(|port| RouteRule::new(&self.name, &self.id, port))
            .collect()
    }

    /// Keep only bindings whose protocol matches, case-insensitively.
    pub fn with_protocol(mut self, protocol: &str) -> Self {
        self.ports.retain(|p| p.protocol.eq_ignore_ascii_case(protocol));
        self
    }

    /// The same record with nothing published; how a removed record is applied.
    pub fn without_ports(&self) -> Self {
        Self {
            id: self.id.clone(),
            name: self.name.clone(),
            ports: Vec::new(),
        }
    }
}

#[async_trait]
pub trait SourcePoller: Send + Sync {
    /// Current records. Any error aborts the whole poll cycle.
    async fn poll(&self) -> Result<Vec<SourceRecord>>;
}
