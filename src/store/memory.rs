// ABOUTME: In-memory ResourceStore that records every call it receives
// ABOUTME: Used to exercise the synchronizer and loop without a cluster

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use super::{NetworkEndpoint, ResourceStore, Workload, ENDPOINT_KIND, WORKLOAD_KIND};
use crate::error::StoreError;

/// Number of calls seen per verb.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreCalls {
    pub gets: usize,
    pub creates: usize,
    pub updates: usize,
    pub deletes: usize,
}

impl StoreCalls {
    pub fn writes(&self) -> usize {
        self.creates + self.updates + self.deletes
    }

    pub fn total(&self) -> usize {
        self.gets + self.writes()
    }
}

type Key = (String, String);

#[derive(Default)]
struct Inner {
    workloads: HashMap<Key, Workload>,
    endpoints: HashMap<Key, NetworkEndpoint>,
    calls: StoreCalls,
    fail_reads: bool,
    fail_writes: bool,
    /// Writes left until the one that fails, counting it.
    fail_write_in: Option<usize>,
}

impl Inner {
    fn write_fails(&mut self) -> bool {
        if let Some(remaining) = self.fail_write_in.as_mut() {
            *remaining -= 1;
            if *remaining == 0 {
                self.fail_write_in = None;
                return true;
            }
        }
        self.fail_writes
    }
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

fn injected(verb: &'static str, kind: &'static str, namespace: &str, name: &str) -> StoreError {
    StoreError::Api {
        verb,
        kind,
        namespace: namespace.to_string(),
        name: name.to_string(),
        message: "injected failure".to_string(),
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn calls(&self) -> StoreCalls {
        self.lock().calls
    }

    pub fn reset_calls(&self) {
        self.lock().calls = StoreCalls::default();
    }

    /// Make every subsequent get fail with an API error.
    pub fn fail_reads(&self, fail: bool) {
        self.lock().fail_reads = fail;
    }

    /// Make every subsequent create/update/delete fail with an API error.
    pub fn fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    /// Make only the `n`th write from now fail (1 is the next write).
    pub fn fail_write_at(&self, n: usize) {
        self.lock().fail_write_in = (n > 0).then_some(n);
    }

    /// Current Workload, bypassing call accounting.
    pub fn workload(&self, namespace: &str, name: &str) -> Option<Workload> {
        self.lock().workloads.get(&key(namespace, name)).cloned()
    }

    /// Current NetworkEndpoint, bypassing call accounting.
    pub fn endpoint(&self, namespace: &str, name: &str) -> Option<NetworkEndpoint> {
        self.lock().endpoints.get(&key(namespace, name)).cloned()
    }

    /// Seed or overwrite a Workload, bypassing call accounting.
    pub fn put_workload(&self, workload: Workload) {
        let k = key(&workload.meta.namespace, &workload.meta.name);
        self.lock().workloads.insert(k, workload);
    }

    /// Seed or overwrite a NetworkEndpoint, bypassing call accounting.
    pub fn put_endpoint(&self, endpoint: NetworkEndpoint) {
        let k = key(&endpoint.meta.namespace, &endpoint.meta.name);
        self.lock().endpoints.insert(k, endpoint);
    }
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn get_workload(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Workload>, StoreError> {
        let mut inner = self.lock();
        inner.calls.gets += 1;
        if inner.fail_reads {
            return Err(injected("get", WORKLOAD_KIND, namespace, name));
        }
        Ok(inner.workloads.get(&key(namespace, name)).cloned())
    }

    async fn create_workload(&self, workload: &Workload) -> Result<(), StoreError> {
        let (namespace, name) = (&workload.meta.namespace, &workload.meta.name);
        let mut inner = self.lock();
        inner.calls.creates += 1;
        if inner.write_fails() {
            return Err(injected("create", WORKLOAD_KIND, namespace, name));
        }
        let k = key(namespace, name);
        if inner.workloads.contains_key(&k) {
            return Err(StoreError::Conflict {
                kind: WORKLOAD_KIND,
                namespace: namespace.clone(),
                name: name.clone(),
            });
        }
        inner.workloads.insert(k, workload.clone());
        Ok(())
    }

    async fn update_workload(&self, workload: &Workload) -> Result<(), StoreError> {
        let (namespace, name) = (&workload.meta.namespace, &workload.meta.name);
        let mut inner = self.lock();
        inner.calls.updates += 1;
        if inner.write_fails() {
            return Err(injected("update", WORKLOAD_KIND, namespace, name));
        }
        match inner.workloads.get_mut(&key(namespace, name)) {
            Some(existing) => {
                *existing = workload.clone();
                Ok(())
            }
            None => Err(StoreError::Api {
                verb: "update",
                kind: WORKLOAD_KIND,
                namespace: namespace.clone(),
                name: name.clone(),
                message: "object does not exist".to_string(),
            }),
        }
    }

    async fn get_endpoint(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<NetworkEndpoint>, StoreError> {
        let mut inner = self.lock();
        inner.calls.gets += 1;
        if inner.fail_reads {
            return Err(injected("get", ENDPOINT_KIND, namespace, name));
        }
        Ok(inner.endpoints.get(&key(namespace, name)).cloned())
    }

    async fn create_endpoint(&self, endpoint: &NetworkEndpoint) -> Result<(), StoreError> {
        let (namespace, name) = (&endpoint.meta.namespace, &endpoint.meta.name);
        let mut inner = self.lock();
        inner.calls.creates += 1;
        if inner.write_fails() {
            return Err(injected("create", ENDPOINT_KIND, namespace, name));
        }
        if endpoint.ports.is_empty() {
            return Err(StoreError::Invalid {
                kind: ENDPOINT_KIND,
                namespace: namespace.clone(),
                name: name.clone(),
                reason: "at least one port is required".to_string(),
            });
        }
        let k = key(namespace, name);
        if inner.endpoints.contains_key(&k) {
            return Err(StoreError::Conflict {
                kind: ENDPOINT_KIND,
                namespace: namespace.clone(),
                name: name.clone(),
            });
        }
        inner.endpoints.insert(k, endpoint.clone());
        Ok(())
    }

    async fn update_endpoint(&self, endpoint: &NetworkEndpoint) -> Result<(), StoreError> {
        let (namespace, name) = (&endpoint.meta.namespace, &endpoint.meta.name);
        let mut inner = self.lock();
        inner.calls.updates += 1;
        if inner.write_fails() {
            return Err(injected("update", ENDPOINT_KIND, namespace, name));
        }
        if endpoint.ports.is_empty() {
            return Err(StoreError::Invalid {
                kind: ENDPOINT_KIND,
                namespace: namespace.clone(),
                name: name.clone(),
                reason: "at least one port is required".to_string(),
            });
        }
        match inner.endpoints.get_mut(&key(namespace, name)) {
            Some(existing) => {
                *existing = endpoint.clone();
                Ok(())
            }
            None => Err(StoreError::Api {
                verb: "update",
                kind: ENDPOINT_KIND,
                namespace: namespace.clone(),
                name: name.clone(),
                message: "object does not exist".to_string(),
            }),
        }
    }

    async fn delete_endpoint(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.calls.deletes += 1;
        if inner.write_fails() {
            return Err(injected("delete", ENDPOINT_KIND, namespace, name));
        }
        inner.endpoints.remove(&key(namespace, name));
        Ok(())
    }
}
