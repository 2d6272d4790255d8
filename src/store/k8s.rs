// ABOUTME: Kubernetes ResourceStore: Workload is an apps/v1 Deployment, NetworkEndpoint a v1 Service
// ABOUTME: Also resolves the owner Deployment once at startup for cascade deletion

use anyhow::{Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta as KubeMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::{json, Value};

use super::{
    EndpointType, NetworkEndpoint, ObjectMeta, OwnerReference, PortMapping, ResourceStore,
    Workload, DEFAULT_PORT_PROTOCOL, ENDPOINT_KIND, PROXY_CONTAINER, WORKLOAD_KIND,
};
use crate::error::StoreError;

pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn deployments(&self, namespace: &str) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn services(&self, namespace: &str) -> Api<Service> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

/// Look up the Deployment this process runs in so created objects can name it as owner.
pub async fn resolve_owner(client: Client, namespace: &str, name: &str) -> Result<OwnerReference> {
    let api: Api<Deployment> = Api::namespaced(client, namespace);
    let deployment = api
        .get(name)
        .await
        .with_context(|| format!("Failed to get owner Deployment {}/{}", namespace, name))?;
    let uid = deployment
        .metadata
        .uid
        .with_context(|| format!("Owner Deployment {}/{} has no uid", namespace, name))?;
    Ok(OwnerReference {
        api_version: "apps/v1".to_string(),
        kind: "Deployment".to_string(),
        name: name.to_string(),
        uid,
    })
}

fn api_error(
    verb: &'static str,
    kind: &'static str,
    namespace: &str,
    name: &str,
    err: kube::Error,
) -> StoreError {
    match err {
        kube::Error::Api(ref response) if response.code == 409 => StoreError::Conflict {
            kind,
            namespace: namespace.to_string(),
            name: name.to_string(),
        },
        other => StoreError::Api {
            verb,
            kind,
            namespace: namespace.to_string(),
            name: name.to_string(),
            message: other.to_string(),
        },
    }
}

fn invalid(kind: &'static str, namespace: &str, name: &str, reason: String) -> StoreError {
    StoreError::Invalid {
        kind,
        namespace: namespace.to_string(),
        name: name.to_string(),
        reason,
    }
}

fn metadata_json(meta: &ObjectMeta) -> Value {
    let mut value = json!({
        "name": meta.name,
        "namespace": meta.namespace,
        "labels": meta.labels,
    });
    if !meta.annotations.is_empty() {
        value["annotations"] = json!(meta.annotations);
    }
    if let Some(owner) = &meta.owner {
        value["ownerReferences"] = json!([{
            "apiVersion": owner.api_version,
            "kind": owner.kind,
            "name": owner.name,
            "uid": owner.uid,
        }]);
    }
    value
}

fn meta_from_kube(meta: KubeMeta) -> ObjectMeta {
    let owner = meta
        .owner_references
        .and_then(|refs| refs.into_iter().next())
        .map(|r| OwnerReference {
            api_version: r.api_version,
            kind: r.kind,
            name: r.name,
            uid: r.uid,
        });
    ObjectMeta {
        name: meta.name.unwrap_or_default(),
        namespace: meta.namespace.unwrap_or_default(),
        labels: meta.labels.unwrap_or_default(),
        annotations: meta.annotations.unwrap_or_default(),
        owner,
    }
}

fn container_json(workload: &Workload) -> Value {
    let mut container = json!({
        "name": workload.container,
        "image": workload.image,
        "command": workload.command,
        "args": workload.args,
        "imagePullPolicy": "Always",
    });
    if !workload.env.is_empty() {
        container["env"] = Value::Array(
            workload
                .env
                .iter()
                .map(|(name, value)| json!({ "name": name, "value": value }))
                .collect(),
        );
    }
    container
}

/// Strategic merge patch touching only the config container's arguments.
/// Containers merge by name, so command, env and any sidecars stay as they are.
fn workload_patch(workload: &Workload) -> Value {
    json!({
        "spec": {
            "template": {
                "spec": {
                    "containers": [{
                        "name": workload.container,
                        "args": workload.args,
                    }],
                },
            },
        },
    })
}

fn deployment_json(workload: &Workload) -> Value {
    let mut pod_spec = json!({ "containers": [container_json(workload)] });
    if let Some(secret) = &workload.image_pull_secret {
        pod_spec["imagePullSecrets"] = json!([{ "name": secret }]);
    }
    json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": metadata_json(&workload.meta),
        "spec": {
            "replicas": workload.replicas,
            "selector": { "matchLabels": workload.meta.labels },
            "template": {
                "metadata": { "labels": workload.meta.labels },
                "spec": pod_spec,
            },
        },
    })
}

fn workload_from_deployment(deployment: Deployment) -> Workload {
    let meta = meta_from_kube(deployment.metadata);
    let spec = deployment.spec.unwrap_or_default();
    let pod_spec = spec.template.spec.unwrap_or_default();

    // Secret names are read through serde so the shape of LocalObjectReference doesn't matter here.
    let image_pull_secret = pod_spec
        .image_pull_secrets
        .unwrap_or_default()
        .into_iter()
        .filter_map(|secret| serde_json::to_value(secret).ok())
        .find_map(|value| value.get("name").and_then(Value::as_str).map(str::to_string));

    let container = pod_spec
        .containers
        .iter()
        .find(|c| c.name == PROXY_CONTAINER)
        .or_else(|| pod_spec.containers.first());

    let env = container
        .and_then(|c| c.env.clone())
        .unwrap_or_default()
        .into_iter()
        .filter_map(|var| var.value.map(|value| (var.name, value)))
        .collect();

    Workload {
        meta,
        container: container
            .map(|c| c.name.clone())
            .unwrap_or_else(|| PROXY_CONTAINER.to_string()),
        image: container.and_then(|c| c.image.clone()).unwrap_or_default(),
        image_pull_secret,
        replicas: spec.replicas.unwrap_or(1),
        command: container.and_then(|c| c.command.clone()).unwrap_or_default(),
        args: container.and_then(|c| c.args.clone()).unwrap_or_default(),
        env,
    }
}

fn ports_json(ports: &[PortMapping]) -> Value {
    Value::Array(
        ports
            .iter()
            .map(|p| {
                json!({
                    "name": p.name,
                    "port": p.port,
                    "targetPort": p.target_port,
                    "protocol": p.protocol,
                })
            })
            .collect(),
    )
}

fn service_json(endpoint: &NetworkEndpoint) -> Value {
    let mut spec = json!({
        "type": endpoint.endpoint_type.as_str(),
        "selector": endpoint.meta.labels,
        "ports": ports_json(&endpoint.ports),
    });
    if endpoint.endpoint_type == EndpointType::LoadBalancer {
        spec["externalTrafficPolicy"] = json!("Local");
    }
    json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": metadata_json(&endpoint.meta),
        "spec": spec,
    })
}

fn endpoint_from_service(service: Service) -> Result<NetworkEndpoint, StoreError> {
    let meta = meta_from_kube(service.metadata);
    let spec = service.spec.unwrap_or_default();

    let endpoint_type = match spec.type_.as_deref() {
        None => EndpointType::ClusterIp,
        Some(value) => EndpointType::parse(value).ok_or_else(|| {
            invalid(
                ENDPOINT_KIND,
                &meta.namespace,
                &meta.name,
                format!("unsupported service type {}", value),
            )
        })?,
    };

    let mut ports = Vec::new();
    for port in spec.ports.unwrap_or_default() {
        let number = u16::try_from(port.port).map_err(|_| {
            invalid(
                ENDPOINT_KIND,
                &meta.namespace,
                &meta.name,
                format!("port {} out of range", port.port),
            )
        })?;
        let target_port = match port.target_port {
            Some(IntOrString::Int(target)) => u16::try_from(target).unwrap_or(number),
            _ => number,
        };
        ports.push(PortMapping {
            name: port.name.unwrap_or_default(),
            port: number,
            target_port,
            protocol: port
                .protocol
                .unwrap_or_else(|| DEFAULT_PORT_PROTOCOL.to_string()),
        });
    }

    Ok(NetworkEndpoint {
        meta,
        endpoint_type,
        ports,
    })
}

#[async_trait]
impl ResourceStore for KubeStore {
    async fn get_workload(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Workload>, StoreError> {
        let found = self
            .deployments(namespace)
            .get_opt(name)
            .await
            .map_err(|e| api_error("get", WORKLOAD_KIND, namespace, name, e))?;
        Ok(found.map(workload_from_deployment))
    }

    async fn create_workload(&self, workload: &Workload) -> Result<(), StoreError> {
        let (namespace, name) = (&workload.meta.namespace, &workload.meta.name);
        let deployment: Deployment = serde_json::from_value(deployment_json(workload))
            .map_err(|e| invalid(WORKLOAD_KIND, namespace, name, e.to_string()))?;
        self.deployments(namespace)
            .create(&PostParams::default(), &deployment)
            .await
            .map_err(|e| api_error("create", WORKLOAD_KIND, namespace, name, e))?;
        Ok(())
    }

    async fn update_workload(&self, workload: &Workload) -> Result<(), StoreError> {
        let (namespace, name) = (&workload.meta.namespace, &workload.meta.name);
        let patch = workload_patch(workload);
        self.deployments(namespace)
            .patch(name, &PatchParams::default(), &Patch::Strategic(&patch))
            .await
            .map_err(|e| api_error("update", WORKLOAD_KIND, namespace, name, e))?;
        Ok(())
    }

    async fn get_endpoint(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<NetworkEndpoint>, StoreError> {
        let found = self
            .services(namespace)
            .get_opt(name)
            .await
            .map_err(|e| api_error("get", ENDPOINT_KIND, namespace, name, e))?;
        found.map(endpoint_from_service).transpose()
    }

    async fn create_endpoint(&self, endpoint: &NetworkEndpoint) -> Result<(), StoreError> {
        let (namespace, name) = (&endpoint.meta.namespace, &endpoint.meta.name);
        let service: Service = serde_json::from_value(service_json(endpoint))
            .map_err(|e| invalid(ENDPOINT_KIND, namespace, name, e.to_string()))?;
        self.services(namespace)
            .create(&PostParams::default(), &service)
            .await
            .map_err(|e| api_error("create", ENDPOINT_KIND, namespace, name, e))?;
        Ok(())
    }

    async fn update_endpoint(&self, endpoint: &NetworkEndpoint) -> Result<(), StoreError> {
        let (namespace, name) = (&endpoint.meta.namespace, &endpoint.meta.name);
        // Only ports and annotations change; clusterIP and friends are immutable.
        let patch = json!({
            "metadata": { "annotations": endpoint.meta.annotations },
            "spec": { "ports": ports_json(&endpoint.ports) },
        });
        self.services(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| api_error("update", ENDPOINT_KIND, namespace, name, e))?;
        Ok(())
    }

    async fn delete_endpoint(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        match self
            .services(namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(response)) if response.code == 404 => Ok(()),
            Err(e) => Err(api_error("delete", ENDPOINT_KIND, namespace, name, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{PROXY_COMMAND, PROXY_SCRIPT, ROUTER_ADDRESS_ENV};
    use std::collections::BTreeMap;

    fn meta() -> ObjectMeta {
        ObjectMeta {
            name: "http-proxy".to_string(),
            namespace: "edge".to_string(),
            labels: BTreeMap::from([("name".to_string(), "http-proxy".to_string())]),
            annotations: BTreeMap::new(),
            owner: Some(OwnerReference {
                api_version: "apps/v1".to_string(),
                kind: "Deployment".to_string(),
                name: "port-manager".to_string(),
                uid: "1234".to_string(),
            }),
        }
    }

    fn workload() -> Workload {
        Workload {
            meta: meta(),
            container: PROXY_CONTAINER.to_string(),
            image: "quay.io/proxy:3".to_string(),
            image_pull_secret: Some("regcred".to_string()),
            replicas: 1,
            command: vec![PROXY_COMMAND.to_string()],
            args: vec![
                PROXY_SCRIPT.to_string(),
                "http:80=>backend:web-u1".to_string(),
            ],
            env: BTreeMap::from([(
                ROUTER_ADDRESS_ENV.to_string(),
                "router.edge:5672".to_string(),
            )]),
        }
    }

    #[test]
    fn test_workload_survives_deployment_conversion() {
        let workload = workload();
        let value = deployment_json(&workload);
        let container = &value["spec"]["template"]["spec"]["containers"][0];
        assert_eq!(container["command"], json!(["node"]));
        assert_eq!(container["args"][0], PROXY_SCRIPT);
        assert_eq!(container["env"][0]["name"], "ROUTER_ADDRESS");

        let deployment: Deployment = serde_json::from_value(value).unwrap();
        assert_eq!(workload_from_deployment(deployment), workload);
    }

    #[test]
    fn test_update_patch_touches_only_container_args() {
        let patch = workload_patch(&workload());
        let containers = patch["spec"]["template"]["spec"]["containers"]
            .as_array()
            .unwrap();
        assert_eq!(containers.len(), 1);

        let container = containers[0].as_object().unwrap();
        let mut keys: Vec<&str> = container.keys().map(String::as_str).collect();
        keys.sort_unstable();
        assert_eq!(keys, vec!["args", "name"]);
        assert_eq!(container["name"], PROXY_CONTAINER);
        assert_eq!(
            container["args"],
            json!([PROXY_SCRIPT, "http:80=>backend:web-u1"])
        );
        assert!(patch["spec"].get("replicas").is_none());
    }

    #[test]
    fn test_sidecar_before_proxy_container_is_skipped() {
        let deployment: Deployment = serde_json::from_value(json!({
            "metadata": { "name": "http-proxy", "namespace": "edge" },
            "spec": {
                "selector": {},
                "template": { "spec": { "containers": [
                    { "name": "log-shipper", "image": "fluent:1", "args": ["--tail"] },
                    {
                        "name": "proxy",
                        "image": "proxy:1",
                        "command": ["node"],
                        "args": [PROXY_SCRIPT, "tcp:22=>backend:ssh-x"],
                    },
                ] } },
            },
        }))
        .unwrap();
        let workload = workload_from_deployment(deployment);
        assert_eq!(workload.container, "proxy");
        assert_eq!(workload.proxy_config(), Ok("tcp:22=>backend:ssh-x"));
        let patch = workload_patch(&workload);
        assert_eq!(
            patch["spec"]["template"]["spec"]["containers"][0]["name"],
            "proxy"
        );
    }

    #[test]
    fn test_endpoint_survives_service_conversion() {
        let endpoint = NetworkEndpoint {
            meta: meta(),
            endpoint_type: EndpointType::LoadBalancer,
            ports: vec![
                PortMapping {
                    name: "web-u1-80".to_string(),
                    port: 80,
                    target_port: 80,
                    protocol: "TCP".to_string(),
                },
                PortMapping {
                    name: "dns-u2-53".to_string(),
                    port: 53,
                    target_port: 53,
                    protocol: "UDP".to_string(),
                },
            ],
        };
        let value = service_json(&endpoint);
        assert_eq!(value["spec"]["ports"][1]["protocol"], "UDP");
        assert_eq!(value["spec"]["externalTrafficPolicy"], "Local");
        let service: Service = serde_json::from_value(value).unwrap();
        assert_eq!(endpoint_from_service(service).unwrap(), endpoint);
    }

    #[test]
    fn test_cluster_ip_service_has_no_traffic_policy() {
        let endpoint = NetworkEndpoint {
            meta: meta(),
            endpoint_type: EndpointType::ClusterIp,
            ports: vec![],
        };
        assert!(service_json(&endpoint)["spec"]
            .get("externalTrafficPolicy")
            .is_none());
    }

    #[test]
    fn test_deployment_without_containers_has_no_args() {
        let deployment: Deployment = serde_json::from_value(json!({
            "metadata": { "name": "http-proxy", "namespace": "edge" },
            "spec": {
                "selector": {},
                "template": { "spec": { "containers": [] } },
            },
        }))
        .unwrap();
        let workload = workload_from_deployment(deployment);
        assert!(workload.args.is_empty());
        assert!(workload.proxy_config().is_err());
    }
}
