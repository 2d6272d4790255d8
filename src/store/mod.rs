// ABOUTME: Downstream declarative store interface and the two object kinds it manages
// ABOUTME: Workload carries the proxy config argument, NetworkEndpoint exposes its ports

pub mod k8s;
pub mod memory;

use async_trait::async_trait;
use std::collections::BTreeMap;

use crate::error::StoreError;

pub use self::k8s::{resolve_owner, KubeStore};
pub use self::memory::{MemoryStore, StoreCalls};

pub const WORKLOAD_KIND: &str = "Workload";
pub const ENDPOINT_KIND: &str = "NetworkEndpoint";

/// Reference to the object whose deletion cascades to everything we create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerReference {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub uid: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectMeta {
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub owner: Option<OwnerReference>,
}

impl ObjectMeta {
    pub fn qualified_name(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

/// Name of the proxy container in a newly created Workload.
pub const PROXY_CONTAINER: &str = "proxy";
/// The proxy image runs `node <script> <config>`.
pub const PROXY_COMMAND: &str = "node";
pub const PROXY_SCRIPT: &str = "/opt/app-root/bin/simple.js";
/// Environment variable telling the proxy where the router listens.
pub const ROUTER_ADDRESS_ENV: &str = "ROUTER_ADDRESS";

/// The proxy Deployment. Its container takes exactly two arguments: the
/// entrypoint script and the serialized proxy config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workload {
    pub meta: ObjectMeta,
    /// Container that carries the config argument.
    pub container: String,
    pub image: String,
    pub image_pull_secret: Option<String>,
    pub replicas: i32,
    pub command: Vec<String>,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

impl Workload {
    /// The config argument, or a reason the Workload cannot carry one.
    pub fn proxy_config(&self) -> Result<&str, String> {
        match self.args.as_slice() {
            [_script, config] => Ok(config.as_str()),
            other => Err(format!(
                "expected 2 container arguments (script and config), found {}",
                other.len()
            )),
        }
    }

    /// Replace the config argument, keeping the script argument as it is.
    pub fn set_proxy_config(&mut self, config: String) {
        match self.args.as_mut_slice() {
            [_script, existing] => *existing = config,
            _ => self.args = vec![PROXY_SCRIPT.to_string(), config],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointType {
    LoadBalancer,
    ClusterIp,
}

impl EndpointType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointType::LoadBalancer => "LoadBalancer",
            EndpointType::ClusterIp => "ClusterIP",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "LoadBalancer" => Some(EndpointType::LoadBalancer),
            "ClusterIP" => Some(EndpointType::ClusterIp),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PortMapping {
    pub name: String,
    pub port: u16,
    pub target_port: u16,
    /// Transport protocol as the cluster spells it, e.g. `TCP` or `UDP`.
    pub protocol: String,
}

/// Protocol of every port mapping this crate creates.
pub const DEFAULT_PORT_PROTOCOL: &str = "TCP";

/// The proxy Service. Never persisted with zero ports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkEndpoint {
    pub meta: ObjectMeta,
    pub endpoint_type: EndpointType,
    pub ports: Vec<PortMapping>,
}

/// get/create/update/delete over the two kinds, keyed by namespace and name.
///
/// A missing object is `Ok(None)` from the getters and `Ok(())` from
/// `delete_endpoint`; every `Err` is a real API failure.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    async fn get_workload(&self, namespace: &str, name: &str)
        -> Result<Option<Workload>, StoreError>;
    async fn create_workload(&self, workload: &Workload) -> Result<(), StoreError>;
    async fn update_workload(&self, workload: &Workload) -> Result<(), StoreError>;

    async fn get_endpoint(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<NetworkEndpoint>, StoreError>;
    async fn create_endpoint(&self, endpoint: &NetworkEndpoint) -> Result<(), StoreError>;
    async fn update_endpoint(&self, endpoint: &NetworkEndpoint) -> Result<(), StoreError>;
    async fn delete_endpoint(&self, namespace: &str, name: &str) -> Result<(), StoreError>;
}
