//! Authentication material fetched fresh for every connection attempt.

use std::time::Duration;

use async_trait::async_trait;
use dicefeed_core::{AuthBundle, FeedError};
use secrecy::SecretString;
use serde_json::Value;
use tracing::{debug, info, warn};

const FETCH_TIMEOUT: Duration = Duration::from_secs(15);
const USER_AGENT: &str = "dicefeed/0.1";

/// Source of [`AuthBundle`]s.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn fetch(&self) -> Result<AuthBundle, FeedError>;
}

/// Fetches a JSON document over HTTP and reads the positional `data` array.
pub struct HttpCredentialProvider {
    client: reqwest::Client,
    url: String,
}

impl HttpCredentialProvider {
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_client(http_client(), url)
    }

    pub fn with_client(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl CredentialProvider for HttpCredentialProvider {
    async fn fetch(&self) -> Result<AuthBundle, FeedError> {
        if self.url.is_empty() {
            return Err(FeedError::Credential("credentials url not configured".into()));
        }
        debug!("fetching credentials");

        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| FeedError::Credential(format!("request: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(FeedError::Credential(format!("bad status {}", status.as_u16())));
        }
        let doc: Value = response
            .json()
            .await
            .map_err(|e| FeedError::Credential(format!("body: {e}")))?;

        let bundle = parse_credentials(&doc)?;
        info!("credentials fetched");
        Ok(bundle)
    }
}

/// Extract an [`AuthBundle`] from `{"data": [_, _, identity1, identity2, {info, signature}]}`.
///
/// `info` is itself a JSON string whose `wsToken` field is the socket token.
pub fn parse_credentials(doc: &Value) -> Result<AuthBundle, FeedError> {
    let data = doc
        .get("data")
        .and_then(Value::as_array)
        .ok_or_else(|| missing("data"))?;

    let identity1 = data.get(2).and_then(Value::as_str).ok_or_else(|| missing("data[2]"))?;
    let identity2 = data.get(3).and_then(Value::as_str).ok_or_else(|| missing("data[3]"))?;
    let auth = data
        .get(4)
        .and_then(Value::as_object)
        .ok_or_else(|| missing("data[4]"))?;

    let info = auth.get("info").and_then(Value::as_str).ok_or_else(|| missing("info"))?;
    let signature = auth
        .get("signature")
        .and_then(Value::as_str)
        .ok_or_else(|| missing("signature"))?;

    let info_doc: Value = serde_json::from_str(info)
        .map_err(|e| FeedError::Credential(format!("info is not JSON: {e}")))?;
    let ws_token = info_doc
        .get("wsToken")
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| missing("info.wsToken"))?;

    Ok(AuthBundle {
        ws_token: SecretString::from(ws_token.to_string()),
        identity1: identity1.to_string(),
        identity2: identity2.to_string(),
        info: info.to_string(),
        signature: SecretString::from(signature.to_string()),
    })
}

/// Client with the fetch timeout and user agent. Falls back to reqwest's
/// defaults, loudly, if the builder is rejected.
fn http_client() -> reqwest::Client {
    match reqwest::Client::builder()
        .timeout(FETCH_TIMEOUT)
        .user_agent(USER_AGENT)
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            warn!(error = %e, "credential http client build failed, using defaults without timeout");
            reqwest::Client::new()
        }
    }
}

fn missing(field: &str) -> FeedError {
    FeedError::Credential(format!("missing or malformed {field}"))
}
