// ABOUTME: Encodes routing rules into the single proxy config argument of the Workload
// ABOUTME: Rules look like "<scheme>:<port>=>backend:<name>-<id>", joined by commas

use std::collections::BTreeSet;
use std::fmt;

use crate::error::CodecError;

pub const RULE_SEPARATOR: char = ',';
pub const ROUTE_ARROW: &str = "=>";
pub const BACKEND_PREFIX: &str = "backend:";

/// One routing directive: traffic arriving on `port` goes to the backend
/// named after the source record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RouteRule {
    pub source_name: String,
    pub source_id: String,
    pub port: u16,
}

impl RouteRule {
    pub fn new(source_name: &str, source_id: &str, port: u16) -> Self {
        Self {
            source_name: source_name.to_string(),
            source_id: source_id.to_string(),
            port,
        }
    }

    /// The backend marker, `<name>-<id>`, that identifies the rule's owner.
    pub fn backend(&self) -> String {
        backend_marker(&self.source_name, &self.source_id)
    }

    pub fn encode(&self, scheme: &str) -> String {
        encode_rule(scheme, &self.source_name, &self.source_id, self.port)
    }
}

pub fn backend_marker(source_name: &str, source_id: &str) -> String {
    format!("{}-{}", source_name, source_id)
}

/// Format a single rule. Pure, no validation.
pub fn encode_rule(scheme: &str, source_name: &str, source_id: &str, port: u16) -> String {
    format!(
        "{}:{}{}{}{}",
        scheme,
        port,
        ROUTE_ARROW,
        BACKEND_PREFIX,
        backend_marker(source_name, source_id)
    )
}

/// Ports of the rules owned by `(source_name, source_id)` under `scheme`.
pub fn decode_owned(
    config: &str,
    scheme: &str,
    source_name: &str,
    source_id: &str,
) -> Result<BTreeSet<u16>, CodecError> {
    Ok(ProxyConfig::parse(scheme, config)?.owned_ports(source_name, source_id))
}

/// Every rule's port regardless of owner. Fails on the same inputs `decode_owned` does.
pub fn decode_all(config: &str) -> Result<BTreeSet<u16>, CodecError> {
    Ok(parse_entries(config)?.iter().map(|e| e.port).collect())
}

/// A parsed rule. The backend is kept whole: `<name>-<id>` cannot be split
/// back unambiguously, so ownership is always tested by exact comparison.
/// `raw` is the rule text as read, and is what gets written back.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    scheme: String,
    port: u16,
    backend: String,
    raw: String,
}

impl Entry {
    fn new(scheme: &str, port: u16, backend: String) -> Self {
        let raw = format!("{}:{}{}{}{}", scheme, port, ROUTE_ARROW, BACKEND_PREFIX, backend);
        Self {
            scheme: scheme.to_string(),
            port,
            backend,
            raw,
        }
    }

    fn from_rule(scheme: &str, rule: &RouteRule) -> Self {
        Self::new(scheme, rule.port, rule.backend())
    }

    fn parse(rule: &str) -> Result<Self, CodecError> {
        let (head, target) =
            rule.split_once(ROUTE_ARROW)
                .ok_or_else(|| CodecError::MissingArrow {
                    rule: rule.to_string(),
                })?;

        let (scheme, port) = head.split_once(':').ok_or_else(|| CodecError::MissingScheme {
            rule: rule.to_string(),
        })?;
        if scheme.is_empty() {
            return Err(CodecError::MissingScheme {
                rule: rule.to_string(),
            });
        }

        let port: u16 = port
            .parse()
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| CodecError::InvalidPort {
                rule: rule.to_string(),
            })?;

        let backend = target
            .strip_prefix(BACKEND_PREFIX)
            .filter(|b| !b.is_empty())
            .ok_or_else(|| CodecError::MissingBackend {
                rule: rule.to_string(),
            })?;

        Ok(Self {
            scheme: scheme.to_string(),
            port,
            backend: backend.to_string(),
            raw: rule.to_string(),
        })
    }

    fn owned_by(&self, scheme: &str, backend: &str) -> bool {
        self.scheme == scheme && self.backend == backend
    }
}

impl fmt::Display for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

fn parse_entries(config: &str) -> Result<Vec<Entry>, CodecError> {
    if config.is_empty() {
        return Ok(Vec::new());
    }
    config
        .split(RULE_SEPARATOR)
        .enumerate()
        .map(|(position, rule)| {
            if rule.is_empty() {
                Err(CodecError::EmptyRule { position })
            } else {
                Entry::parse(rule)
            }
        })
        .collect()
}

/// The shared, multi-tenant rule list of one proxy Workload.
///
/// Rules are kept in wire order. Adding appends at the end and removing drops
/// exactly one element, so re-encoding never leaves a leading, trailing or
/// doubled separator. Rules with a scheme other than this config's are kept
/// verbatim but never treated as owned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    scheme: String,
    entries: Vec<Entry>,
}

impl ProxyConfig {
    pub fn new(scheme: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            entries: Vec::new(),
        }
    }

    pub fn parse(scheme: impl Into<String>, config: &str) -> Result<Self, CodecError> {
        Ok(Self {
            scheme: scheme.into(),
            entries: parse_entries(config)?,
        })
    }

    /// Fresh config holding only `rules`, duplicates dropped.
    pub fn from_rules<'a>(
        scheme: impl Into<String>,
        rules: impl IntoIterator<Item = &'a RouteRule>,
    ) -> Self {
        let mut config = Self::new(scheme);
        for rule in rules {
            config.add(rule);
        }
        config
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, rule: &RouteRule) -> bool {
        let backend = rule.backend();
        self.entries
            .iter()
            .any(|e| e.port == rule.port && e.owned_by(&self.scheme, &backend))
    }

    pub fn owned_ports(&self, source_name: &str, source_id: &str) -> BTreeSet<u16> {
        let backend = backend_marker(source_name, source_id);
        self.entries
            .iter()
            .filter(|e| e.owned_by(&self.scheme, &backend))
            .map(|e| e.port)
            .collect()
    }

    pub fn ports(&self) -> BTreeSet<u16> {
        self.entries.iter().map(|e| e.port).collect()
    }

    /// Append `rule` unless it is already present. Returns whether it was added.
    pub fn add(&mut self, rule: &RouteRule) -> bool {
        if self.contains(rule) {
            return false;
        }
        self.entries.push(Entry::from_rule(&self.scheme, rule));
        true
    }

    /// Drop the first occurrence of `rule`. Returns whether anything was removed.
    pub fn remove(&mut self, rule: &RouteRule) -> bool {
        let backend = rule.backend();
        let scheme = &self.scheme;
        match self
            .entries
            .iter()
            .position(|e| e.port == rule.port && e.owned_by(scheme, &backend))
        {
            Some(idx) => {
                self.entries.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Make the owner's rules exactly `desired`: stale and duplicated rules are
    /// dropped, missing ones appended in port order. Other owners' rules keep
    /// their position. Returns whether the config changed.
    pub fn sync_owner(
        &mut self,
        source_name: &str,
        source_id: &str,
        desired: &BTreeSet<u16>,
    ) -> bool {
        let backend = backend_marker(source_name, source_id);
        let scheme = &self.scheme;
        let mut kept = BTreeSet::new();
        let before = self.entries.len();

        self.entries.retain(|e| {
            !e.owned_by(scheme, &backend) || (desired.contains(&e.port) && kept.insert(e.port))
        });
        let mut changed = self.entries.len() != before;

        for port in desired.difference(&kept) {
            self.entries.push(Entry::new(&self.scheme, *port, backend.clone()));
            changed = true;
        }
        changed
    }

    pub fn encode(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ProxyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, entry) in self.entries.iter().enumerate() {
            if idx > 0 {
                write!(f, "{}", RULE_SEPARATOR)?;
            }
            write!(f, "{}", entry)?;
        }
        Ok(())
    }
}
