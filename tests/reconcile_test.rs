// ABOUTME: Integration tests for the reconcile loop: diffing polls and applying changes
// ABOUTME: Uses a scripted poller and the in-memory store

use anyhow::Result;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use port_manager::config::{ProtocolClass, ProxyTarget, ReconcilerConfig};
use port_manager::reconcile::{Reconciler, Synchronizer};
use port_manager::store::MemoryStore;
use port_manager::upstream::{PortBinding, SourcePoller, SourceRecord};

/// Returns queued poll results in order, then repeats the last successful one.
#[derive(Default)]
struct ScriptedPoller {
    script: Mutex<VecDeque<Result<Vec<SourceRecord>>>>,
    last: Mutex<Vec<SourceRecord>>,
}

impl ScriptedPoller {
    fn push(&self, records: Vec<SourceRecord>) {
        self.script.lock().unwrap().push_back(Ok(records));
    }

    fn push_error(&self, message: &str) {
        self.script
            .lock()
            .unwrap()
            .push_back(Err(anyhow::anyhow!(message.to_string())));
    }
}

#[async_trait]
impl SourcePoller for ScriptedPoller {
    async fn poll(&self) -> Result<Vec<SourceRecord>> {
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Ok(records)) => {
                *self.last.lock().unwrap() = records.clone();
                Ok(records)
            }
            Some(Err(e)) => Err(e),
            None => Ok(self.last.lock().unwrap().clone()),
        }
    }
}

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

fn reconciler(
    poller: &Arc<ScriptedPoller>,
    store: &Arc<MemoryStore>,
) -> Reconciler<ScriptedPoller, MemoryStore> {
    let mut config =
        ReconcilerConfig::new(ProxyTarget::new("edge", ProtocolClass::Http, "proxy:latest"));
    config.poll_interval = Duration::from_millis(20);
    let synchronizer = Synchronizer::new(store.clone(), config.target.clone(), None);
    Reconciler::new(config, poller.clone(), synchronizer)
}

fn proxy_config(store: &MemoryStore) -> String {
    store
        .workload("edge", "http-proxy")
        .unwrap()
        .proxy_config()
        .unwrap()
        .to_string()
}

#[tokio::test]
async fn test_records_flow_through_cycles() {
    let poller = Arc::new(ScriptedPoller::default());
    let store = Arc::new(MemoryStore::new());
    let mut reconciler = reconciler(&poller, &store);

    poller.push(vec![record("u1", "web", &[8080])]);
    let stats = reconciler.run_cycle().await.unwrap();
    assert_eq!(stats.records_seen, 1);
    assert_eq!(stats.created, 1);
    assert_eq!(stats.applied, 1);
    assert!(stats.is_success());
    assert_eq!(proxy_config(&store), "http:8080=>backend:web-u1");

    poller.push(vec![record("u1", "web", &[8080]), record("u2", "api", &[9090])]);
    let stats = reconciler.run_cycle().await.unwrap();
    assert_eq!(stats.created, 1);
    assert_eq!(stats.unchanged, 1);
    assert_eq!(
        proxy_config(&store),
        "http:8080=>backend:web-u1,http:9090=>backend:api-u2"
    );

    poller.push(vec![record("u2", "api", &[9090, 9443])]);
    let stats = reconciler.run_cycle().await.unwrap();
    assert_eq!(stats.changed, 1);
    assert_eq!(stats.removed, 1);
    assert_eq!(stats.applied, 2);
    assert_eq!(
        proxy_config(&store),
        "http:9090=>backend:api-u2,http:9443=>backend:api-u2"
    );
    assert_eq!(reconciler.cache().len(), 1);
    assert!(reconciler.cache().get("u1").is_none());
}

#[tokio::test]
async fn test_unchanged_poll_makes_no_store_calls() {
    let poller = Arc::new(ScriptedPoller::default());
    let store = Arc::new(MemoryStore::new());
    let mut reconciler = reconciler(&poller, &store);

    poller.push(vec![record("u1", "web", &[8080]), record("u2", "api", &[9090])]);
    reconciler.run_cycle().await.unwrap();
    store.reset_calls();

    let stats = reconciler.run_cycle().await.unwrap();
    assert_eq!(stats.unchanged, 2);
    assert_eq!(stats.applied, 0);
    assert_eq!(store.calls().total(), 0);
}

#[tokio::test]
async fn test_failed_change_is_retried_next_cycle() {
    let poller = Arc::new(ScriptedPoller::default());
    let store = Arc::new(MemoryStore::new());
    let mut reconciler = reconciler(&poller, &store);

    poller.push(vec![record("u1", "web", &[8080])]);
    store.fail_writes(true);
    let stats = reconciler.run_cycle().await.unwrap();
    assert_eq!(stats.created, 1);
    assert_eq!(stats.applied, 0);
    assert_eq!(stats.errors.len(), 1);
    assert!(!stats.is_success());
    assert!(reconciler.cache().is_empty());

    store.fail_writes(false);
    let stats = reconciler.run_cycle().await.unwrap();
    assert_eq!(stats.created, 1);
    assert_eq!(stats.applied, 1);
    assert!(stats.is_success());
    assert_eq!(proxy_config(&store), "http:8080=>backend:web-u1");
    assert!(reconciler.cache().get("u1").is_some());
}

#[tokio::test]
async fn test_one_failed_record_does_not_block_the_others() {
    let poller = Arc::new(ScriptedPoller::default());
    let store = Arc::new(MemoryStore::new());
    let mut reconciler = reconciler(&poller, &store);

    // Writes 1 and 2 create the objects for u1; write 3 is u2's workload update.
    poller.push(vec![record("u1", "web", &[8080]), record("u2", "api", &[9090])]);
    store.fail_write_at(3);
    let stats = reconciler.run_cycle().await.unwrap();
    assert_eq!(stats.created, 2);
    assert_eq!(stats.applied, 1);
    assert_eq!(stats.errors.len(), 1);
    assert!(stats.errors[0].contains("u2"), "unexpected error: {}", stats.errors[0]);
    assert!(reconciler.cache().get("u1").is_some());
    assert!(reconciler.cache().get("u2").is_none());
    assert_eq!(proxy_config(&store), "http:8080=>backend:web-u1");

    store.reset_calls();
    let stats = reconciler.run_cycle().await.unwrap();
    assert_eq!(stats.unchanged, 1);
    assert_eq!(stats.created, 1);
    assert_eq!(stats.applied, 1);
    assert!(stats.is_success());
    assert!(reconciler.cache().get("u2").is_some());
    assert_eq!(
        proxy_config(&store),
        "http:8080=>backend:web-u1,http:9090=>backend:api-u2"
    );
}

#[tokio::test]
async fn test_malformed_shared_config_fails_each_record() {
    let poller = Arc::new(ScriptedPoller::default());
    let store = Arc::new(MemoryStore::new());
    let mut reconciler = reconciler(&poller, &store);

    // A rule without a scheme makes the shared config unparseable.
    poller.push(vec![record("u1", "web", &[8080]), record("u2", "api", &[9090])]);
    store.put_workload(port_manager::store::Workload {
        meta: port_manager::store::ObjectMeta {
            name: "http-proxy".to_string(),
            namespace: "edge".to_string(),
            ..Default::default()
        },
        container: port_manager::store::PROXY_CONTAINER.to_string(),
        image: "proxy:latest".to_string(),
        image_pull_secret: None,
        replicas: 1,
        command: vec![port_manager::store::PROXY_COMMAND.to_string()],
        args: vec![
            port_manager::store::PROXY_SCRIPT.to_string(),
            "8080=>backend:web-u1".to_string(),
        ],
        env: Default::default(),
    });

    let stats = reconciler.run_cycle().await.unwrap();
    assert_eq!(stats.created, 2);
    assert_eq!(stats.errors.len(), 2);
    assert!(reconciler.cache().is_empty());
    assert_eq!(proxy_config(&store), "8080=>backend:web-u1");
}

#[tokio::test]
async fn test_poll_error_aborts_cycle_without_touching_cache() {
    let poller = Arc::new(ScriptedPoller::default());
    let store = Arc::new(MemoryStore::new());
    let mut reconciler = reconciler(&poller, &store);

    poller.push(vec![record("u1", "web", &[8080])]);
    reconciler.run_cycle().await.unwrap();
    store.reset_calls();

    poller.push_error("controller unavailable");
    assert!(reconciler.run_cycle().await.is_err());
    assert_eq!(reconciler.cache().len(), 1);
    assert_eq!(store.calls().total(), 0);
    assert_eq!(proxy_config(&store), "http:8080=>backend:web-u1");
}

#[tokio::test]
async fn test_rename_moves_rules_to_new_name() {
    let poller = Arc::new(ScriptedPoller::default());
    let store = Arc::new(MemoryStore::new());
    let mut reconciler = reconciler(&poller, &store);

    poller.push(vec![record("u1", "web", &[8080])]);
    reconciler.run_cycle().await.unwrap();

    poller.push(vec![record("u1", "frontend", &[8080])]);
    let stats = reconciler.run_cycle().await.unwrap();
    assert_eq!(stats.changed, 1);
    assert_eq!(proxy_config(&store), "http:8080=>backend:frontend-u1");
    assert_eq!(reconciler.cache().get("u1").unwrap().record.name, "frontend");
}

#[tokio::test]
async fn test_run_stops_on_shutdown() {
    let poller = Arc::new(ScriptedPoller::default());
    let store = Arc::new(MemoryStore::new());
    poller.push(vec![record("u1", "web", &[8080])]);

    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel::<()>(1);
    let handle = tokio::spawn(reconciler(&poller, &store).run(shutdown_rx));

    tokio::time::sleep(Duration::from_millis(100)).await;
    shutdown_tx.send(()).unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("reconciler did not stop")
        .unwrap();
    assert!(result.is_ok());
    assert_eq!(proxy_config(&store), "http:8080=>backend:web-u1");
}
