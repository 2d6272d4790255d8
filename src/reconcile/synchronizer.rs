// ABOUTME: Applies one source record to the shared proxy Workload and NetworkEndpoint
// ABOUTME: Merges only that record's rules, leaving other records' rules untouched

use std::collections::BTreeSet;
use std::sync::Arc;

use super::cache::PlannedChange;
use crate::config::ProxyTarget;
use crate::error::SyncError;
use crate::proxy::{merge_owner_ports, port_mapping, ProxyConfig};
use crate::store::{
    NetworkEndpoint, ObjectMeta, OwnerReference, ResourceStore, Workload, PROXY_COMMAND,
    PROXY_CONTAINER, PROXY_SCRIPT, ROUTER_ADDRESS_ENV,
};
use crate::upstream::SourceRecord;

/// What happened to one downstream object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceAction {
    Created,
    Updated,
    Deleted,
    Unchanged,
    /// Absent and nothing to put in it, so left absent.
    Skipped,
}

impl ResourceAction {
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            ResourceAction::Created | ResourceAction::Updated | ResourceAction::Deleted
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncOutcome {
    pub workload: ResourceAction,
    pub endpoint: ResourceAction,
}

impl SyncOutcome {
    pub fn wrote(&self) -> bool {
        self.workload.is_write() || self.endpoint.is_write()
    }
}

/// Writes the proxy objects of one protocol class. Holds no state between
/// calls: everything is read back from the store each time.
pub struct Synchronizer<S> {
    store: Arc<S>,
    target: ProxyTarget,
    owner: Option<OwnerReference>,
}

impl<S: ResourceStore> Synchronizer<S> {
    pub fn new(store: Arc<S>, target: ProxyTarget, owner: Option<OwnerReference>) -> Self {
        Self {
            store,
            target,
            owner,
        }
    }

    pub fn target(&self) -> &ProxyTarget {
        &self.target
    }

    /// Apply a planned change. For a renamed record the rules under the old
    /// name are dropped in the same write that adds the new ones.
    pub async fn apply(&self, change: &PlannedChange) -> Result<SyncOutcome, SyncError> {
        if let Some(previous) = &change.previous {
            tracing::info!(
                "Record {} renamed from {} to {}, replacing its rules",
                change.record.id,
                previous.name,
                change.record.name
            );
        }
        self.converge(&change.desired(), change.previous.as_ref())
            .await
    }

    /// Make the shared objects carry exactly `record`'s published ports.
    ///
    /// Idempotent: with unchanged input, a second call only reads.
    pub async fn ensure_route(&self, record: &SourceRecord) -> Result<SyncOutcome, SyncError> {
        self.converge(record, None).await
    }

    /// Remove every rule and port mapping owned by `record`.
    pub async fn purge_route(&self, record: &SourceRecord) -> Result<SyncOutcome, SyncError> {
        self.ensure_route(&record.without_ports()).await
    }

    async fn converge(
        &self,
        record: &SourceRecord,
        previous: Option<&SourceRecord>,
    ) -> Result<SyncOutcome, SyncError> {
        let desired = record.published_ports();
        let workload = self.sync_workload(record, &desired, previous).await?;
        let endpoint = self.sync_endpoint(record, &desired, previous).await?;
        Ok(SyncOutcome { workload, endpoint })
    }

    fn meta(&self) -> ObjectMeta {
        ObjectMeta {
            name: self.target.proxy_name.clone(),
            namespace: self.target.namespace.clone(),
            labels: self.target.labels(),
            annotations: Default::default(),
            owner: self.owner.clone(),
        }
    }

    fn new_workload(&self, config: String) -> Workload {
        let env = self
            .target
            .router_address
            .iter()
            .map(|address| (ROUTER_ADDRESS_ENV.to_string(), address.clone()))
            .collect();
        Workload {
            meta: self.meta(),
            container: PROXY_CONTAINER.to_string(),
            image: self.target.image.clone(),
            image_pull_secret: self.target.image_pull_secret.clone(),
            replicas: 1,
            command: vec![PROXY_COMMAND.to_string()],
            args: vec![PROXY_SCRIPT.to_string(), config],
            env,
        }
    }

    fn new_endpoint(&self, record: &SourceRecord) -> NetworkEndpoint {
        let mut meta = self.meta();
        meta.annotations = self.target.annotations.clone();
        NetworkEndpoint {
            meta,
            endpoint_type: self.target.endpoint_type,
            ports: record.route_rules().iter().map(port_mapping).collect(),
        }
    }

    async fn sync_workload(
        &self,
        record: &SourceRecord,
        desired: &BTreeSet<u16>,
        previous: Option<&SourceRecord>,
    ) -> Result<ResourceAction, SyncError> {
        let namespace = &self.target.namespace;
        let name = &self.target.proxy_name;
        let scheme = self.target.class.scheme();

        let Some(mut workload) = self.store.get_workload(namespace, name).await? else {
            if desired.is_empty() {
                return Ok(ResourceAction::Skipped);
            }
            let config = ProxyConfig::from_rules(scheme, &record.route_rules());
            tracing::info!(
                "Creating proxy workload {}/{} for {} ({})",
                namespace,
                name,
                record.name,
                record.id
            );
            self.store
                .create_workload(&self.new_workload(config.encode()))
                .await?;
            return Ok(ResourceAction::Created);
        };

        let qualified = workload.meta.qualified_name();
        let mut config = {
            let current = workload
                .proxy_config()
                .map_err(|reason| SyncError::MalformedWorkload {
                    workload: qualified.clone(),
                    reason,
                })?;
            ProxyConfig::parse(scheme, current).map_err(|source| SyncError::MalformedConfig {
                workload: qualified.clone(),
                source,
            })?
        };

        let mut changed = false;
        if let Some(previous) = previous {
            changed |= config.sync_owner(&previous.name, &previous.id, &BTreeSet::new());
        }
        changed |= config.sync_owner(&record.name, &record.id, desired);
        if !changed {
            return Ok(ResourceAction::Unchanged);
        }

        tracing::info!(
            "Updating proxy config of {} for {} ({}): {} rule(s)",
            qualified,
            record.name,
            record.id,
            config.len()
        );
        workload.set_proxy_config(config.encode());
        self.store.update_workload(&workload).await?;
        Ok(ResourceAction::Updated)
    }

    async fn sync_endpoint(
        &self,
        record: &SourceRecord,
        desired: &BTreeSet<u16>,
        previous: Option<&SourceRecord>,
    ) -> Result<ResourceAction, SyncError> {
        let namespace = &self.target.namespace;
        let name = &self.target.proxy_name;

        let Some(mut endpoint) = self.store.get_endpoint(namespace, name).await? else {
            if desired.is_empty() {
                return Ok(ResourceAction::Skipped);
            }
            tracing::info!(
                "Creating proxy endpoint {}/{} for {} ({})",
                namespace,
                name,
                record.name,
                record.id
            );
            self.store.create_endpoint(&self.new_endpoint(record)).await?;
            return Ok(ResourceAction::Created);
        };

        let mut merged = endpoint.ports.clone();
        if let Some(previous) = previous {
            merged = merge_owner_ports(&merged, &previous.name, &previous.id, &BTreeSet::new());
        }
        let merged = merge_owner_ports(&merged, &record.name, &record.id, desired);

        // An endpoint with no ports is rejected by the cluster; remove it instead.
        if merged.is_empty() {
            tracing::info!(
                "Deleting proxy endpoint {}/{}: no ports left after removing {} ({})",
                namespace,
                name,
                record.name,
                record.id
            );
            self.store.delete_endpoint(namespace, name).await?;
            return Ok(ResourceAction::Deleted);
        }

        if merged == endpoint.ports {
            return Ok(ResourceAction::Unchanged);
        }

        tracing::info!(
            "Updating proxy endpoint {}/{} for {} ({}): {} port(s)",
            namespace,
            name,
            record.name,
            record.id,
            merged.len()
        );
        endpoint.ports = merged;
        self.store.update_endpoint(&endpoint).await?;
        Ok(ResourceAction::Updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProtocolClass;
    use crate::store::MemoryStore;
    use crate::upstream::PortBinding;

    fn record(id: &str, name: &str, ports: &[u16]) -> SourceRecord {
        SourceRecord {
            id: id.to_string(),
            name: name.to_string(),
            ports: ports
                .iter()
                .map(|p| PortBinding {
                    internal: 80,
                    external: *p,
                    protocol: "http".to_string(),
                })
                .collect(),
        }
    }

    fn synchronizer(store: Arc<MemoryStore>) -> Synchronizer<MemoryStore> {
        Synchronizer::new(
            store,
            ProxyTarget::new("edge", ProtocolClass::Http, "proxy:latest"),
            None,
        )
    }

    #[tokio::test]
    async fn test_zero_port_record_creates_nothing() {
        let store = Arc::new(MemoryStore::new());
        let outcome = synchronizer(store.clone())
            .ensure_route(&record("u1", "web", &[]))
            .await
            .unwrap();
        assert_eq!(outcome.workload, ResourceAction::Skipped);
        assert_eq!(outcome.endpoint, ResourceAction::Skipped);
        assert_eq!(store.calls().writes(), 0);
    }

    #[tokio::test]
    async fn test_rename_replaces_rules_in_one_write() {
        let store = Arc::new(MemoryStore::new());
        let sync = synchronizer(store.clone());
        sync.ensure_route(&record("u1", "web", &[8080])).await.unwrap();

        let change = PlannedChange {
            kind: crate::reconcile::ChangeKind::Changed,
            record: record("u1", "frontend", &[8080]),
            previous: Some(record("u1", "web", &[8080])),
        };
        let outcome = sync.apply(&change).await.unwrap();
        assert_eq!(outcome.workload, ResourceAction::Updated);
        assert_eq!(outcome.endpoint, ResourceAction::Updated);

        let workload = store.workload("edge", "http-proxy").unwrap();
        assert_eq!(workload.proxy_config(), Ok("http:8080=>backend:frontend-u1"));
        let endpoint = store.endpoint("edge", "http-proxy").unwrap();
        assert_eq!(endpoint.ports.len(), 1);
        assert_eq!(endpoint.ports[0].name, "frontend-u1-8080");
    }

    #[tokio::test]
    async fn test_new_workload_runs_script_with_router_address() {
        let store = Arc::new(MemoryStore::new());
        let mut target = ProxyTarget::new("edge", ProtocolClass::Http, "proxy:latest");
        target.router_address = Some("router.edge:5672".to_string());
        Synchronizer::new(store.clone(), target, None)
            .ensure_route(&record("u1", "web", &[8080]))
            .await
            .unwrap();

        let workload = store.workload("edge", "http-proxy").unwrap();
        assert_eq!(workload.container, PROXY_CONTAINER);
        assert_eq!(workload.command, vec![PROXY_COMMAND.to_string()]);
        assert_eq!(
            workload.args,
            vec![
                PROXY_SCRIPT.to_string(),
                "http:8080=>backend:web-u1".to_string()
            ]
        );
        assert_eq!(
            workload.env.get(ROUTER_ADDRESS_ENV).map(String::as_str),
            Some("router.edge:5672")
        );
    }
}
