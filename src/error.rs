// ABOUTME: Typed errors for the codec, the downstream store and the synchronizer
// ABOUTME: NotFound is not represented here - lookups return Ok(None) instead

use thiserror::Error;

/// Failure to parse a ProxyConfig string carried by a Workload.
///
/// These are surfaced to the loop rather than repaired: a config that was
/// edited outside the manager has to be fixed before the cache can advance.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("empty rule at position {position} in proxy config")]
    EmptyRule { position: usize },
    #[error("rule '{rule}' has no '=>' separator")]
    MissingArrow { rule: String },
    #[error("rule '{rule}' has no scheme")]
    MissingScheme { rule: String },
    #[error("rule '{rule}' has an invalid port")]
    InvalidPort { rule: String },
    #[error("rule '{rule}' does not route to a 'backend:' target")]
    MissingBackend { rule: String },
}

/// API-level failure from the downstream declarative store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{verb} {kind} {namespace}/{name} failed: {message}")]
    Api {
        verb: &'static str,
        kind: &'static str,
        namespace: String,
        name: String,
        message: String,
    },
    #[error("{kind} {namespace}/{name} already exists")]
    Conflict {
        kind: &'static str,
        namespace: String,
        name: String,
    },
    #[error("{kind} {namespace}/{name} cannot be represented: {reason}")]
    Invalid {
        kind: &'static str,
        namespace: String,
        name: String,
        reason: String,
    },
}

/// Reasons a single record could not be reconciled this cycle.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("proxy config of workload {workload} is malformed: {source}")]
    MalformedConfig {
        workload: String,
        #[source]
        source: CodecError,
    },
    #[error("workload {workload} cannot carry a proxy config: {reason}")]
    MalformedWorkload { workload: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malformed_config_keeps_source() {
        let err = SyncError::MalformedConfig {
            workload: "default/http-proxy".to_string(),
            source: CodecError::InvalidPort {
                rule: "http:x=>backend:a-1".to_string(),
            },
        };
        let source = std::error::Error::source(&err).map(|s| s.to_string());
        assert_eq!(
            source.as_deref(),
            Some("rule 'http:x=>backend:a-1' has an invalid port")
        );
    }
}
