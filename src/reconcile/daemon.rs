// ABOUTME: Reconciler loop - polls upstream, diffs against the cache and applies changes
// ABOUTME: Runs cycles at a fixed interval until a shutdown signal arrives

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};

use super::cache::{diff, ChangeKind, RecordCache};
use super::synchronizer::Synchronizer;
use crate::config::ReconcilerConfig;
use crate::store::ResourceStore;
use crate::upstream::{SourcePoller, SourceRecord};

/// Statistics from one reconcile cycle.
#[derive(Debug, Clone, Default)]
pub struct CycleStats {
    pub records_seen: usize,
    pub created: usize,
    pub changed: usize,
    pub removed: usize,
    pub unchanged: usize,
    /// Changes whose downstream writes all succeeded.
    pub applied: usize,
    pub errors: Vec<String>,
    pub duration_ms: u64,
}

impl CycleStats {
    /// Check if every planned change was applied.
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }
}

/// One polling loop for one proxy target.
pub struct Reconciler<P, S> {
    config: ReconcilerConfig,
    poller: Arc<P>,
    synchronizer: Synchronizer<S>,
    cache: RecordCache,
}

impl<P: SourcePoller, S: ResourceStore> Reconciler<P, S> {
    pub fn new(config: ReconcilerConfig, poller: Arc<P>, synchronizer: Synchronizer<S>) -> Self {
        Self {
            config,
            poller,
            synchronizer,
            cache: RecordCache::new(),
        }
    }

    /// Name of the proxy this reconciler manages, used in logs.
    pub fn name(&self) -> &str {
        &self.config.target.proxy_name
    }

    pub fn cache(&self) -> &RecordCache {
        &self.cache
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    async fn poll(&self) -> Result<Vec<SourceRecord>> {
        let records = self
            .poller
            .poll()
            .await
            .context("Failed to poll upstream records")?;

        Ok(match self.config.protocol_filter {
            Some(class) => records
                .into_iter()
                .map(|r| r.with_protocol(class.scheme()))
                .collect(),
            None => records,
        })
    }

    /// Run one poll, diff and apply pass.
    ///
    /// A failed poll aborts the cycle without touching the cache. A failed
    /// change is logged and left out of the cache, so the next cycle sees it
    /// again and retries.
    pub async fn run_cycle(&mut self) -> Result<CycleStats> {
        let start = std::time::Instant::now();
        let mut stats = CycleStats::default();

        let records = self.poll().await?;
        stats.records_seen = records.len();

        let plan = diff(&records, &self.cache);
        stats.unchanged = plan.unchanged;
        stats.created = plan.count(ChangeKind::New);
        stats.changed = plan.count(ChangeKind::Changed);
        stats.removed = plan.count(ChangeKind::Removed);

        for change in plan.changes {
            tracing::debug!(
                "{}: applying {} record {} ({})",
                self.name(),
                change.kind.as_str(),
                change.record.name,
                change.record.id
            );

            match self.synchronizer.apply(&change).await {
                Ok(outcome) => {
                    stats.applied += 1;
                    if outcome.wrote() {
                        tracing::info!(
                            "{}: {} record {} ({}) applied: workload {:?}, endpoint {:?}",
                            self.name(),
                            change.kind.as_str(),
                            change.record.name,
                            change.record.id,
                            outcome.workload,
                            outcome.endpoint
                        );
                    }
                    match change.kind {
                        ChangeKind::Removed => {
                            self.cache.evict(&change.record.id);
                        }
                        ChangeKind::New | ChangeKind::Changed => {
                            self.cache.commit(change.record);
                        }
                    }
                }
                Err(e) => {
                    // Log with :? to show full error chain including root cause
                    tracing::error!(
                        "{}: failed to apply {} record {} ({}): {:?}",
                        self.name(),
                        change.kind.as_str(),
                        change.record.name,
                        change.record.id,
                        e
                    );
                    stats.errors.push(format!(
                        "Failed to apply {} record {} ({}): {}",
                        change.kind.as_str(),
                        change.record.name,
                        change.record.id,
                        e
                    ));
                }
            }
        }

        stats.duration_ms = start.elapsed().as_millis() as u64;
        Ok(stats)
    }

    /// Run cycles continuously until `shutdown` fires.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let mut ticker = interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cycles = 0u64;

        tracing::info!(
            "Starting reconciler {} in namespace {} with poll_interval={:?}",
            self.name(),
            self.config.target.namespace,
            self.config.poll_interval
        );
        if let Some(address) = &self.config.target.external_address {
            tracing::info!("{}: proxy is reachable at {}", self.name(), address);
        }

        loop {
            tokio::select! {
                biased;

                _ = shutdown.recv() => {
                    tracing::info!("Shutdown signal received, stopping reconciler {}", self.name());
                    break;
                }
                _ = ticker.tick() => {
                    cycles += 1;
                    tracing::debug!("{}: starting cycle {}", self.name(), cycles);

                    let name = self.name().to_string();
                    tokio::select! {
                        biased;
                        _ = shutdown.recv() => {
                            tracing::info!("Shutdown signal received during cycle, stopping reconciler {}", name);
                            break;
                        }
                        result = self.run_cycle() => {
                            match result {
                                Ok(stats) => {
                                    if stats.created + stats.changed + stats.removed > 0 {
                                        tracing::info!(
                                            "{}: cycle {} completed: {} records, {} new, {} changed, {} removed in {}ms",
                                            name,
                                            cycles,
                                            stats.records_seen,
                                            stats.created,
                                            stats.changed,
                                            stats.removed,
                                            stats.duration_ms
                                        );
                                    } else {
                                        tracing::debug!(
                                            "{}: cycle {} completed: {} records unchanged in {}ms",
                                            name,
                                            cycles,
                                            stats.unchanged,
                                            stats.duration_ms
                                        );
                                    }
                                    if !stats.is_success() {
                                        tracing::warn!("{}: cycle {} had {} errors", name, cycles, stats.errors.len());
                                    }
                                }
                                Err(e) => {
                                    tracing::error!("{}: cycle {} failed: {:?}", name, cycles, e);
                                }
                            }
                        }
                    }
                }
            }
        }

        tracing::info!("Reconciler {} stopped after {} cycles", self.name(), cycles);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProtocolClass, ProxyTarget};
    use crate::store::MemoryStore;
    use crate::upstream::PortBinding;
    use async_trait::async_trait;

    struct FixedPoller(Vec<SourceRecord>);

    #[async_trait]
    impl SourcePoller for FixedPoller {
        async fn poll(&self) -> Result<Vec<SourceRecord>> {
            Ok(self.0.clone())
        }
    }

    fn binding(port: u16, protocol: &str) -> PortBinding {
        PortBinding {
            internal: port,
            external: port,
            protocol: protocol.to_string(),
        }
    }

    #[test]
    fn test_cycle_stats_success() {
        let stats = CycleStats {
            records_seen: 3,
            applied: 1,
            ..Default::default()
        };
        assert!(stats.is_success());
    }

    #[test]
    fn test_cycle_stats_with_errors() {
        let stats = CycleStats {
            errors: vec!["Failed to apply new record web (u1)".to_string()],
            ..Default::default()
        };
        assert!(!stats.is_success());
    }

    #[tokio::test]
    async fn test_protocol_filter_drops_other_bindings() {
        let record = SourceRecord {
            id: "u1".to_string(),
            name: "mixed".to_string(),
            ports: vec![binding(8080, "http"), binding(5432, "TCP")],
        };
        let store = Arc::new(MemoryStore::new());
        let mut config =
            ReconcilerConfig::new(ProxyTarget::new("edge", ProtocolClass::Tcp, "proxy:latest"));
        config.protocol_filter = Some(ProtocolClass::Tcp);
        let synchronizer = Synchronizer::new(store.clone(), config.target.clone(), None);
        let mut reconciler =
            Reconciler::new(config, Arc::new(FixedPoller(vec![record])), synchronizer);

        let stats = reconciler.run_cycle().await.unwrap();
        assert_eq!(stats.created, 1);
        assert_eq!(stats.applied, 1);

        let workload = store.workload("edge", "tcp-proxy").unwrap();
        assert_eq!(workload.proxy_config(), Ok("tcp:5432=>backend:mixed-u1"));
        assert_eq!(
            reconciler.cache().get("u1").unwrap().published.len(),
            1
        );
    }
}
