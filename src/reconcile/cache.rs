// ABOUTME: Last confirmed state per source record id and the diff against a fresh poll
// ABOUTME: Classifies records as new, changed, unchanged or removed in one pass each way

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::upstream::SourceRecord;

/// The last record applied downstream for one id.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub record: SourceRecord,
    pub published: BTreeSet<u16>,
}

impl CacheEntry {
    pub fn new(record: SourceRecord) -> Self {
        Self {
            published: record.published_ports(),
            record,
        }
    }
}

/// Per-reconciler cache. Only the loop writes to it, and only after the
/// downstream objects were updated successfully.
#[derive(Debug, Default)]
pub struct RecordCache {
    entries: HashMap<String, CacheEntry>,
}

impl RecordCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&CacheEntry> {
        self.entries.get(id)
    }

    /// Record `record` as applied, replacing any previous entry for its id.
    pub fn commit(&mut self, record: SourceRecord) {
        self.entries
            .insert(record.id.clone(), CacheEntry::new(record));
    }

    pub fn evict(&mut self, id: &str) -> Option<CacheEntry> {
        self.entries.remove(id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    New,
    Changed,
    Removed,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::New => "new",
            ChangeKind::Changed => "changed",
            ChangeKind::Removed => "removed",
        }
    }
}

/// One record that needs downstream work this cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedChange {
    pub kind: ChangeKind,
    /// Current record; for `Removed`, the cached one.
    pub record: SourceRecord,
    /// Cached record when it was published under a different name.
    pub previous: Option<SourceRecord>,
}

impl PlannedChange {
    /// The record to converge downstream state to. Removed records publish nothing.
    pub fn desired(&self) -> SourceRecord {
        match self.kind {
            ChangeKind::Removed => self.record.without_ports(),
            ChangeKind::New | ChangeKind::Changed => self.record.clone(),
        }
    }
}

#[derive(Debug, Default)]
pub struct DiffPlan {
    pub changes: Vec<PlannedChange>,
    pub unchanged: usize,
}

impl DiffPlan {
    pub fn count(&self, kind: ChangeKind) -> usize {
        self.changes.iter().filter(|c| c.kind == kind).count()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

/// Compare a poll against the cache using id lookups only.
///
/// A record whose published ports and name match its cache entry generates no
/// work. A rename is a change: rules are keyed by name, so the old ones must go.
/// Duplicate ids in `current` keep their first occurrence.
pub fn diff(current: &[SourceRecord], cache: &RecordCache) -> DiffPlan {
    let mut plan = DiffPlan::default();
    let mut seen: HashSet<&str> = HashSet::with_capacity(current.len());

    for record in current {
        if !seen.insert(record.id.as_str()) {
            tracing::warn!(
                "Ignoring duplicate record id {} ({})",
                record.id,
                record.name
            );
            continue;
        }

        match cache.get(&record.id) {
            None => plan.changes.push(PlannedChange {
                kind: ChangeKind::New,
                record: record.clone(),
                previous: None,
            }),
            Some(entry) => {
                let renamed = entry.record.name != record.name;
                if !renamed && entry.published == record.published_ports() {
                    plan.unchanged += 1;
                    continue;
                }
                plan.changes.push(PlannedChange {
                    kind: ChangeKind::Changed,
                    record: record.clone(),
                    previous: renamed.then(|| entry.record.clone()),
                });
            }
        }
    }

    for (id, entry) in &cache.entries {
        if !seen.contains(id.as_str()) {
            plan.changes.push(PlannedChange {
                kind: ChangeKind::Removed,
                record: entry.record.clone(),
                previous: None,
            });
        }
    }

    plan
}
