// ABOUTME: Reconciler configuration and how process options expand into one or two reconcilers
// ABOUTME: A single http reconciler by default, separate http and tcp ones when both addresses are set

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::store::EndpointType;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_OWNER_NAME: &str = "port-manager";
pub const DEFAULT_READY_FILE: &str = "/tmp/operator-sdk-ready";

/// Protocol class a reconciler serves. Each class has its own proxy objects
/// and its own rule scheme, so two reconcilers never touch the same names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolClass {
    Http,
    Tcp,
}

impl ProtocolClass {
    pub fn scheme(&self) -> &'static str {
        match self {
            ProtocolClass::Http => "http",
            ProtocolClass::Tcp => "tcp",
        }
    }

    pub fn proxy_name(&self) -> &'static str {
        match self {
            ProtocolClass::Http => "http-proxy",
            ProtocolClass::Tcp => "tcp-proxy",
        }
    }
}

/// Where and how the proxy objects of one reconciler are written.
#[derive(Debug, Clone)]
pub struct ProxyTarget {
    pub namespace: String,
    pub class: ProtocolClass,
    pub proxy_name: String,
    pub image: String,
    pub image_pull_secret: Option<String>,
    pub endpoint_type: EndpointType,
    pub annotations: BTreeMap<String, String>,
    /// Address clients use to reach this proxy, when it is fronted externally.
    pub external_address: Option<String>,
    /// Router the proxy forwards to, handed to new Workloads as `ROUTER_ADDRESS`.
    pub router_address: Option<String>,
}

impl ProxyTarget {
    pub fn new(namespace: &str, class: ProtocolClass, image: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            class,
            proxy_name: class.proxy_name().to_string(),
            image: image.to_string(),
            image_pull_secret: None,
            endpoint_type: EndpointType::LoadBalancer,
            annotations: BTreeMap::new(),
            external_address: None,
            router_address: None,
        }
    }

    pub fn labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([("name".to_string(), self.proxy_name.clone())])
    }
}

/// Configuration for one Reconciler.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub target: ProxyTarget,
    /// Only bindings of this protocol are routed; None routes every binding.
    pub protocol_filter: Option<ProtocolClass>,
    pub poll_interval: Duration,
}

impl ReconcilerConfig {
    pub fn new(target: ProxyTarget) -> Self {
        Self {
            target,
            protocol_filter: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Process-level options, already read from flags and environment.
#[derive(Debug, Clone, Default)]
pub struct ManagerOptions {
    pub namespace: String,
    pub proxy_image: String,
    pub image_pull_secret: Option<String>,
    pub router_address: Option<String>,
    pub http_proxy_address: Option<String>,
    pub tcp_proxy_address: Option<String>,
    pub proxy_service_annotations: Option<String>,
    pub poll_interval: Option<Duration>,
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value.as_ref().filter(|v| !v.trim().is_empty()).cloned()
}

/// Parse the JSON object of annotations applied to every NetworkEndpoint.
pub fn parse_annotations(raw: &str) -> Result<BTreeMap<String, String>> {
    serde_json::from_str(raw).context("Failed to parse proxy service annotations as a JSON object")
}

/// Expand options into the reconcilers to run.
pub fn plan_reconcilers(opts: &ManagerOptions) -> Result<Vec<ReconcilerConfig>> {
    if opts.proxy_image.trim().is_empty() {
        anyhow::bail!("A proxy image is required");
    }

    let annotations = match non_empty(&opts.proxy_service_annotations) {
        Some(raw) => parse_annotations(&raw)?,
        None => BTreeMap::new(),
    };

    let build = |class: ProtocolClass| {
        let mut target = ProxyTarget::new(&opts.namespace, class, &opts.proxy_image);
        target.image_pull_secret = non_empty(&opts.image_pull_secret);
        target.router_address = non_empty(&opts.router_address);
        target.annotations = annotations.clone();
        let mut config = ReconcilerConfig::new(target);
        if let Some(interval) = opts.poll_interval {
            config.poll_interval = interval;
        }
        config
    };

    let split = (
        non_empty(&opts.http_proxy_address),
        non_empty(&opts.tcp_proxy_address),
    );
    match split {
        (Some(http_address), Some(tcp_address)) => {
            let mut http = build(ProtocolClass::Http);
            http.protocol_filter = Some(ProtocolClass::Http);
            http.target.endpoint_type = EndpointType::ClusterIp;
            http.target.external_address = Some(http_address);

            let mut tcp = build(ProtocolClass::Tcp);
            tcp.protocol_filter = Some(ProtocolClass::Tcp);
            tcp.target.endpoint_type = EndpointType::ClusterIp;
            tcp.target.external_address = Some(tcp_address);

            Ok(vec![http, tcp])
        }
        _ => Ok(vec![build(ProtocolClass::Http)]),
    }
}
