//! REST client for the menu API.
//!
//! Every request carries the bearer token from the [`CredentialStore`]. A
//! missing token fails locally with [`SyncError::MissingToken`] before any
//! request is issued. Responses must be 2xx and `application/json`.

// Rust guideline compliant 2026-01

use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Response};
use serde_json::Value;

use crate::constants::HTTP_REQUEST_TIMEOUT;
use crate::error::SyncError;
use crate::models::Entity;
use crate::storage::CredentialStore;

/// Authenticated JSON client for one API base URL.
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    credentials: CredentialStore,
}

impl ApiClient {
    /// Build a client with the default request timeout.
    pub fn new(base_url: impl Into<String>, credentials: CredentialStore) -> Result<Self, SyncError> {
        let client = Client::builder().timeout(HTTP_REQUEST_TIMEOUT).build()?;
        Ok(Self::with_client(client, base_url, credentials))
    }

    /// Use an existing `reqwest` client.
    pub fn with_client(
        client: Client,
        base_url: impl Into<String>,
        credentials: CredentialStore,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials,
        }
    }

    /// Base URL without trailing slash.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// The underlying HTTP client.
    pub fn http(&self) -> &Client {
        &self.client
    }

    /// Absolute URL for `endpoint`. Absolute endpoints pass through.
    pub fn url(&self, endpoint: &str) -> String {
        if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            endpoint.to_string()
        } else {
            format!("{}/{}", self.base_url, endpoint.trim_start_matches('/'))
        }
    }

    fn bearer(&self) -> Result<String, SyncError> {
        let token = self
            .credentials
            .token()
            .map_err(|e| SyncError::Storage(e.to_string()))?
            .ok_or(SyncError::MissingToken)?;
        Ok(format!("Bearer {token}"))
    }

    /// GET `endpoint` and decode the JSON body.
    pub async fn get_json(&self, endpoint: &str) -> Result<Value, SyncError> {
        let auth = self.bearer()?;
        let url = self.url(endpoint);
        log::debug!("GET {url}");

        let response = self
            .client
            .get(&url)
            .header(AUTHORIZATION, auth)
            .send()
            .await?;
        read_json(response).await
    }

    /// PUT a JSON body to `endpoint` and decode the JSON reply.
    pub async fn put_json(&self, endpoint: &str, body: &Value) -> Result<Value, SyncError> {
        let auth = self.bearer()?;
        let url = self.url(endpoint);
        log::debug!("PUT {url}");

        let response = self
            .client
            .put(&url)
            .header(AUTHORIZATION, auth)
            .json(body)
            .send()
            .await?;
        read_json(response).await
    }

    /// GET a list of entities.
    ///
    /// Accepts a bare array or an object wrapping it in `data`.
    pub async fn fetch_collection(&self, endpoint: &str) -> Result<Vec<Entity>, SyncError> {
        let items = match self.get_json(endpoint).await? {
            Value::Array(items) => items,
            Value::Object(mut object) => match object.remove("data") {
                Some(Value::Array(items)) => items,
                _ => {
                    return Err(SyncError::Parse(format!(
                        "{endpoint}: expected an array or an object with a data array"
                    )))
                }
            },
            _ => {
                return Err(SyncError::Parse(format!("{endpoint}: expected an array")));
            }
        };

        items.into_iter().map(Entity::try_from).collect()
    }
}

async fn read_json(response: Response) -> Result<Value, SyncError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(SyncError::Http {
            status: status.as_u16(),
            body,
        });
    }

    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    if !content_type
        .to_ascii_lowercase()
        .starts_with("application/json")
    {
        return Err(SyncError::UnexpectedContentType(content_type));
    }

    let bytes = response.bytes().await?;
    Ok(serde_json::from_slice(&bytes)?)
}
