//! External key-value store the drop rules are fetched from.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::Deserialize;
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Lists every key/value pair under a prefix. Keys are returned relative to
/// the prefix (the remainder is the rule tag); values are raw bytes.
#[async_trait]
pub trait RuleStore: Send + Sync {
    async fn list(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError>;
}

/// Consul-style HTTP KV client: recursive listing under the prefix, values
/// base64 encoded in the response, optional datacenter and access token.
pub struct HttpRuleStore {
    client: reqwest::Client,
    base_url: String,
    datacenter: Option<String>,
    token: Option<String>,
}

#[derive(Deserialize)]
struct KvPair {
    #[serde(rename = "Key")]
    key: String,
    #[serde(rename = "Value")]
    value: Option<String>,
}

impl HttpRuleStore {
    pub fn new(address: &str, datacenter: Option<String>, token: Option<String>) -> Self {
        let base_url = if address.starts_with("http://") || address.starts_with("https://") {
            address.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", address.trim_end_matches('/'))
        };
        Self {
            client: reqwest::Client::new(),
            base_url,
            datacenter,
            token,
        }
    }
}

#[async_trait]
impl RuleStore for HttpRuleStore {
    async fn list(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let url = format!("{}/v1/kv/{}", self.base_url, prefix);
        let mut request = self.client.get(&url).query(&[("recurse", "true")]);
        if let Some(dc) = &self.datacenter {
            request = request.query(&[("dc", dc.as_str())]);
        }
        if let Some(token) = &self.token {
            request = request.header("X-Consul-Token", token);
        }

        let response = request.send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let pairs: Vec<KvPair> = response.error_for_status()?.json().await?;

        let mut out = Vec::with_capacity(pairs.len());
        for pair in pairs {
            // The prefix key itself comes back in a recursive listing; only
            // keys strictly below it name a tag.
            let tag = match pair.key.strip_prefix(prefix).map(|k| k.trim_start_matches('/')) {
                Some(tag) if !tag.is_empty() => tag.to_string(),
                _ => continue,
            };
            let Some(value) = pair.value else { continue };
            match BASE64.decode(value.as_bytes()) {
                Ok(decoded) => out.push((tag, decoded)),
                Err(e) => {
                    warn!(key = %pair.key, error = %e, "undecodable value in rule store, skipping");
                }
            }
        }
        Ok(out)
    }
}
