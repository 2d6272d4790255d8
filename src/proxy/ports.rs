// ABOUTME: Maps routing rules to NetworkEndpoint port mappings with owner-scoped names
// ABOUTME: Merges one owner's desired ports into the shared mapping list

use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

use super::codec::RouteRule;
use crate::store::{PortMapping, DEFAULT_PORT_PROTOCOL};

/// Longest name the cluster accepts for a Service port.
const MAX_PORT_NAME: usize = 63;
/// Hex digits of the digest appended to names that had to be shortened.
const HASH_LEN: usize = 8;

/// Owner-scoped mapping name: `<name>-<id>-<port>`, lowercased, with anything
/// outside `[a-z0-9-]` replaced by `-` and no leading or trailing `-`.
///
/// Names longer than 63 characters are cut and suffixed with a digest of the
/// owner and port, so they stay unique and stable across cycles.
pub fn mapping_name(source_name: &str, source_id: &str, port: u16) -> String {
    let sanitized: String = format!("{}-{}-{}", source_name, source_id, port)
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    let trimmed = sanitized.trim_matches('-');
    if trimmed.len() <= MAX_PORT_NAME {
        return trimmed.to_string();
    }

    let digest = Sha256::digest(format!("{}/{}/{}", source_name, source_id, port).as_bytes());
    let suffix: String = digest
        .iter()
        .take(HASH_LEN / 2)
        .map(|b| format!("{:02x}", b))
        .collect();
    let head = trimmed[..MAX_PORT_NAME - HASH_LEN - 1].trim_end_matches('-');
    format!("{}-{}", head, suffix)
}

pub fn port_mapping(rule: &RouteRule) -> PortMapping {
    PortMapping {
        name: mapping_name(&rule.source_name, &rule.source_id, rule.port),
        port: rule.port,
        target_port: rule.port,
        protocol: DEFAULT_PORT_PROTOCOL.to_string(),
    }
}

/// A mapping belongs to an owner when its name is exactly the one that owner
/// would produce for the mapping's own port.
pub fn is_owned_by(mapping: &PortMapping, source_name: &str, source_id: &str) -> bool {
    mapping.name == mapping_name(source_name, source_id, mapping.port)
}

/// Replace the owner's mappings in `existing` with one per `desired` port.
/// Mappings of other owners keep their order; new mappings go last.
pub fn merge_owner_ports(
    existing: &[PortMapping],
    source_name: &str,
    source_id: &str,
    desired: &BTreeSet<u16>,
) -> Vec<PortMapping> {
    let mut kept = BTreeSet::new();
    let mut merged: Vec<PortMapping> = existing
        .iter()
        .filter(|m| {
            !is_owned_by(m, source_name, source_id)
                || (desired.contains(&m.port) && kept.insert(m.port))
        })
        .cloned()
        .collect();

    for port in desired.difference(&kept) {
        merged.push(port_mapping(&RouteRule::new(source_name, source_id, *port)));
    }
    merged
}
