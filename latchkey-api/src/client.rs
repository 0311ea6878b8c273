//! Authenticated HTTP client for the Latchkey REST API.
//!
//! Every request carries the access token as a bearer header. A 401 triggers
//! one refresh through `token/refresh/` and one retry; concurrent callers
//! share a single refresh.

use std::sync::Arc;

use reqwest::{Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;

use latchkey_engine::{LockId, RemoteConfig};

use crate::ApiError;

/// Access/refresh token pair
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tokens {
    pub access: Option<String>,
    pub refresh: Option<String>,
}

#[derive(Deserialize)]
struct RefreshResponse {
    access: String,
    #[serde(default)]
    refresh: Option<String>,
}

#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: Url,
    tokens: Arc<Mutex<Tokens>>,
}

impl ApiClient {
    /// `base_url` is the API root, e.g. `https://latchkey.example.com/api/`
    pub fn new(base_url: &str, tokens: Tokens) -> Result<Self, ApiError> {
        Self::with_client(reqwest::Client::new(), base_url, tokens)
    }

    pub fn with_client(
        http: reqwest::Client,
        base_url: &str,
        tokens: Tokens,
    ) -> Result<Self, ApiError> {
        // joining relative paths needs the trailing slash
        let base_url = if base_url.ends_with('/') {
            Url::parse(base_url)?
        } else {
            Url::parse(&format!("{base_url}/"))?
        };
        Ok(Self { http, base_url, tokens: Arc::new(Mutex::new(tokens)) })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Current tokens, including any rotated by a refresh
    pub async fn tokens(&self) -> Tokens {
        self.tokens.lock().await.clone()
    }

    fn url(&self, path: &str) -> Result<Url, ApiError> {
        Ok(self.base_url.join(path)?)
    }

    // ── Request helpers ──────────────────────────────────────────────

    async fn execute(
        &self,
        method: &Method,
        url: &Url,
        body: Option<&Value>,
        access: Option<&str>,
    ) -> Result<Response, ApiError> {
        debug!("{method} {url}");
        let mut request = self.http.request(method.clone(), url.clone());
        if let Some(access) = access {
            request = request.bearer_auth(access);
        }
        if let Some(body) = body {
            request = request.json(body);
        }
        Ok(request.send().await?)
    }

    /// Send with the current access token, refreshing once on a 401
    pub async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Response, ApiError> {
        let url = self.url(path)?;
        let access = self.tokens.lock().await.access.clone();

        let response = self.execute(&method, &url, body, access.as_deref()).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        debug!(%url, "access token rejected");
        let access = self.refresh(access.as_deref()).await?;
        self.execute(&method, &url, body, Some(&access)).await
    }

    /// Exchange the refresh token for a new access token.
    ///
    /// `rejected` is the access token the server just refused; if another
    /// caller already replaced it, that token is reused.
    async fn refresh(&self, rejected: Option<&str>) -> Result<String, ApiError> {
        let mut tokens = self.tokens.lock().await;

        if let Some(access) = &tokens.access {
            if Some(access.as_str()) != rejected {
                return Ok(access.clone());
            }
        }
        let Some(refresh) = tokens.refresh.clone() else {
            warn!("no refresh token available");
            return Err(ApiError::SessionExpired);
        };

        let url = self.url("token/refresh/")?;
        let body = json!({ "refresh": refresh });
        let response = self.execute(&Method::POST, &url, Some(&body), None).await?;
        if !response.status().is_success() {
            warn!(status = %response.status(), "token refresh rejected");
            tokens.access = None;
            return Err(ApiError::SessionExpired);
        }

        let refreshed: RefreshResponse = decode(response).await?;
        tokens.access = Some(refreshed.access.clone());
        if let Some(rotated) = refreshed.refresh {
            tokens.refresh = Some(rotated);
        }
        info!("access token refreshed");
        Ok(refreshed.access)
    }

    // ── Lock network config ──────────────────────────────────────────

    /// `None` when the lock has no network config (404 or an empty object)
    pub async fn get_network_config(&self, lock: &LockId) -> Result<Option<RemoteConfig>, ApiError> {
        let response = self.send(Method::GET, &network_path(lock), None).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let value: Value = decode(check(response).await?).await?;
        if value.as_object().is_none_or(|o| o.is_empty()) {
            return Ok(None);
        }
        serde_json::from_value(value.clone())
            .map(Some)
            .map_err(|e| ApiError::Deserialization { message: e.to_string(), body: value.to_string() })
    }

    pub async fn create_network_config(
        &self,
        lock: &LockId,
        config: &RemoteConfig,
    ) -> Result<(), ApiError> {
        let body = serde_json::to_value(config)?;
        check(self.send(Method::POST, &network_path(lock), Some(&body)).await?).await?;
        Ok(())
    }

    pub async fn update_network_config(
        &self,
        lock: &LockId,
        config: &RemoteConfig,
    ) -> Result<(), ApiError> {
        let body = serde_json::to_value(config)?;
        check(self.send(Method::PATCH, &network_path(lock), Some(&body)).await?).await?;
        Ok(())
    }
}

fn network_path(lock: &LockId) -> String {
    format!("locks/{lock}/network/")
}

/// Turn a non-2xx response into [`ApiError::Status`]
async fn check(response: Response) -> Result<Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ApiError::Status { status: status.as_u16(), body })
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ApiError> {
    let body = response.text().await?;
    serde_json::from_str(&body)
        .map_err(|e| ApiError::Deserialization { message: e.to_string(), body })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_gets_trailing_slash() {
        let client = ApiClient::new("https://locks.example.com/api", Tokens::default()).unwrap();
        assert_eq!(client.base_url().as_str(), "https://locks.example.com/api/");

        let lock = LockId::parse("6f1c1a52-3b8e-4a55-9f3e-2a6b1d0c9e11").unwrap();
        assert_eq!(
            client.url(&network_path(&lock)).unwrap().as_str(),
            "https://locks.example.com/api/locks/6f1c1a52-3b8e-4a55-9f3e-2a6b1d0c9e11/network/"
        );
    }

    #[test]
    fn rejects_invalid_base_url() {
        assert!(matches!(
            ApiClient::new("not a url", Tokens::default()),
            Err(ApiError::InvalidUrl(_))
        ));
    }
}
