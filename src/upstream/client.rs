// ABOUTME: HTTP client for the ioFog Controller REST API
// ABOUTME: Logs in with OpenID client credentials and lists microservices

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tokio::sync::Mutex;

use super::models::{Microservice, MicroserviceList, TokenResponse};
use super::{SourcePoller, SourceRecord};

/// Service name and port the Controller listens on inside the namespace.
pub const CONTROLLER_SERVICE: &str = "controller";
pub const CONTROLLER_PORT: u16 = 51121;

/// Tokens are replaced this many seconds before the provider says they expire.
const TOKEN_EXPIRY_MARGIN_SECS: i64 = 30;
/// Upper bound on a token lifetime we are willing to trust.
const MAX_TOKEN_LIFETIME_SECS: u64 = 24 * 60 * 60;

#[derive(Debug, Clone)]
pub struct ClientCredentials {
    pub auth_url: String,
    pub realm: String,
    pub client_id: String,
    pub client_secret: String,
}

impl ClientCredentials {
    fn token_url(&self) -> String {
        format!(
            "{}/realms/{}/protocol/openid-connect/token",
            self.auth_url.trim_end_matches('/'),
            self.realm
        )
    }
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    /// None when the provider gave no lifetime; such a token lives until a 401.
    expires_at: Option<DateTime<Utc>>,
}

impl CachedToken {
    fn issued(response: TokenResponse, now: DateTime<Utc>) -> Self {
        let expires_at = response.expires_in.map(|secs| {
            let secs = secs.min(MAX_TOKEN_LIFETIME_SECS) as i64;
            now + chrono::Duration::seconds(secs)
        });
        Self {
            value: response.access_token,
            expires_at,
        }
    }

    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |at| {
            now + chrono::Duration::seconds(TOKEN_EXPIRY_MARGIN_SECS) < at
        })
    }
}

pub struct ControllerClient {
    client: Client,
    api_base_url: String,
    credentials: ClientCredentials,
    token: Mutex<Option<CachedToken>>,
}

impl ControllerClient {
    pub fn new(api_base_url: String, credentials: ClientCredentials) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            api_base_url: api_base_url.trim_end_matches('/').to_string(),
            credentials,
            token: Mutex::new(None),
        })
    }

    /// In-cluster address of the Controller API, e.g. `http://controller.edge:51121/api/v3`.
    pub fn default_base_url(scheme: &str, namespace: &str) -> String {
        format!(
            "{}://{}.{}:{}/api/v3",
            scheme, CONTROLLER_SERVICE, namespace, CONTROLLER_PORT
        )
    }

    pub fn base_url(&self) -> &str {
        &self.api_base_url
    }

    async fn login(&self) -> Result<TokenResponse> {
        let form = [
            ("grant_type", "client_credentials"),
            ("client_id", self.credentials.client_id.as_str()),
            ("client_secret", self.credentials.client_secret.as_str()),
        ];

        let response = self
            .client
            .post(self.credentials.token_url())
            .form(&form[..])
            .send()
            .await
            .context("Failed to reach the identity provider")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Login failed with status {}: {}", status, body);
        }

        let token: TokenResponse = response
            .json()
            .await
            .context("Failed to parse token response")?;
        match token.expires_in {
            Some(secs) => tracing::info!("Logged into Controller API, token valid for {}s", secs),
            None => tracing::info!("Logged into Controller API"),
        }
        Ok(token)
    }

    async fn access_token(&self) -> Result<String> {
        let mut token = self.token.lock().await;
        let now = Utc::now();
        match token.as_ref() {
            Some(existing) if existing.is_fresh(now) => return Ok(existing.value.clone()),
            Some(_) => tracing::debug!("Access token about to expire, logging in again"),
            None => {}
        }
        let fresh = CachedToken::issued(self.login().await?, Utc::now());
        let value = fresh.value.clone();
        *token = Some(fresh);
        Ok(value)
    }

    async fn invalidate_token(&self) {
        *self.token.lock().await = None;
    }

    pub async fn list_microservices(&self) -> Result<Vec<Microservice>> {
        let url = format!("{}/microservices", self.api_base_url);
        tracing::debug!("Polling Controller API at {}", url);

        let mut retried = false;
        loop {
            let token = self.access_token().await?;
            let response = self
                .client
                .get(&url)
                .bearer_auth(&token)
                .send()
                .await
                .context("Failed to list microservices from Controller API")?;

            // Tokens expire; log in again once before giving up.
            if response.status() == StatusCode::UNAUTHORIZED && !retried {
                tracing::warn!("Controller API rejected access token, logging in again");
                self.invalidate_token().await;
                retried = true;
                continue;
            }

            if !response.status().is_success() {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                anyhow::bail!(
                    "Listing microservices failed with status {}: {}",
                    status,
                    body
                );
            }

            let list: MicroserviceList = response
                .json()
                .await
                .context("Failed to parse microservice list")?;
            tracing::debug!("Found {} microservices", list.microservices.len());
            return Ok(list.microservices);
        }
    }
}

#[async_trait]
impl SourcePoller for ControllerClient {
    async fn poll(&self) -> Result<Vec<SourceRecord>> {
        let microservices = self.list_microservices().await?;
        Ok(microservices.into_iter().map(SourceRecord::from).collect())
    }
}
