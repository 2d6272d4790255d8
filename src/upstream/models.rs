// ABOUTME: Wire structures returned by the ioFog Controller and the token endpoint
// ABOUTME: Deserialized leniently: unknown fields ignored, missing ports treated as none

use serde::Deserialize;

use super::{PortBinding, SourceRecord, DEFAULT_PROTOCOL};

#[derive(Debug, Clone, Deserialize)]
pub struct MicroserviceList {
    #[serde(default)]
    pub microservices: Vec<Microservice>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Microservice {
    pub uuid: String,
    pub name: String,
    #[serde(default)]
    pub ports: Vec<MicroservicePort>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MicroservicePort {
    #[serde(default)]
    pub internal: u16,
    #[serde(default)]
    pub external: u16,
    #[serde(default)]
    pub protocol: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub expires_in: Option<u64>,
}

impl From<Microservice> for SourceRecord {
    fn from(msvc: Microservice) -> Self {
        SourceRecord {
            id: msvc.uuid,
            name: msvc.name,
            ports: msvc
                .ports
                .into_iter()
                .map(|p| PortBinding {
                    internal: p.internal,
                    external: p.external,
                    protocol: p
                        .protocol
                        .filter(|proto| !proto.is_empty())
                        .unwrap_or_else(|| DEFAULT_PROTOCOL.to_string()),
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_microservice_list_deserialization() {
        let body = serde_json::json!({
            "microservices": [
                {
                    "uuid": "u1",
                    "name": "web",
                    "flowId": 7,
                    "ports": [
                        {"internal": 80, "external": 8080, "protocol": "http"},
                        {"internal": 5432, "external": 0}
                    ]
                },
                {"uuid": "u2", "name": "idle"}
            ]
        });
        let list: MicroserviceList = serde_json::from_value(body).unwrap();
        let records: Vec<SourceRecord> = list.microservices.into_iter().map(Into::into).collect();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, "u1");
        assert_eq!(records[0].ports[1].protocol, "http");
        assert_eq!(records[0].published_ports().len(), 1);
        assert!(records[1].ports.is_empty());
    }
}
