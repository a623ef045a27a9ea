use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::StatusCode;
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use super::types::{ApiRequest, UpsertResponse, HEALTH_DAILY_PATH};
use super::{DataSource, HealthSubmitter};
use crate::config::{ApiConfig, Config};
use crate::error::FetchError;
use crate::health::DailyHealthMetrics;

/// Longest slice of an error body kept in messages
const MAX_ERROR_BODY: usize = 512;

/// HTTP client for the insight backend.
#[derive(Clone)]
pub struct ApiClient {
  http: reqwest::Client,
  base_url: Url,
}

impl ApiClient {
  /// Build a client using the token from the environment.
  pub fn from_config(config: &ApiConfig) -> Result<Self> {
    let token = Config::get_api_token()?;
    Self::new(config, &token)
  }

  pub fn new(config: &ApiConfig, token: &str) -> Result<Self> {
    let base = config
      .base_url
      .as_deref()
      .ok_or_else(|| eyre!("api.base_url is not configured"))?;
    let base_url =
      Url::parse(base).map_err(|e| eyre!("Invalid api.base_url '{}': {}", base, e))?;

    let mut bearer = HeaderValue::from_str(&format!("Bearer {}", token))
      .map_err(|e| eyre!("API token is not a valid header value: {}", e))?;
    bearer.set_sensitive(true);
    let mut headers = HeaderMap::new();
    headers.insert(AUTHORIZATION, bearer);

    let http = reqwest::Client::builder()
      .default_headers(headers)
      .timeout(config.timeout())
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { http, base_url })
  }

  fn url_for(&self, path: &str) -> Result<Url, FetchError> {
    self
      .base_url
      .join(path)
      .map_err(|e| FetchError::Decode(format!("invalid request path {}: {}", path, e)))
  }

  async fn read_json<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
  ) -> Result<T, FetchError> {
    let status = response.status();
    if !status.is_success() {
      let body = response.text().await.unwrap_or_default();
      return Err(classify_status(status, &body));
    }

    response
      .json::<T>()
      .await
      .map_err(|e| FetchError::Decode(e.to_string()))
  }
}

#[async_trait]
impl DataSource for ApiClient {
  async fn fetch(&self, request: &ApiRequest) -> Result<Value, FetchError> {
    let url = self.url_for(&request.endpoint.path())?;
    debug!(url = %url, params = request.params.len(), "GET");

    let response = self
      .http
      .get(url)
      .query(&request.params)
      .send()
      .await
      .map_err(classify_transport)?;

    Self::read_json(response).await
  }
}

#[async_trait]
impl HealthSubmitter for ApiClient {
  async fn submit_daily(&self, records: &[DailyHealthMetrics]) -> Result<UpsertResponse, FetchError> {
    let url = self.url_for(HEALTH_DAILY_PATH)?;
    debug!(url = %url, records = records.len(), "POST");

    let response = self
      .http
      .post(url)
      .json(records)
      .send()
      .await
      .map_err(classify_transport)?;

    Self::read_json(response).await
  }
}

/// Map a non-2xx status onto the error taxonomy.
pub fn classify_status(status: StatusCode, body: &str) -> FetchError {
  let message = truncate(body.trim(), MAX_ERROR_BODY);
  match status {
    StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
      FetchError::Auth(format!("{}: {}", status, message))
    }
    _ => {
      if status.is_client_error() {
        warn!(status = status.as_u16(), "backend rejected request");
      }
      FetchError::Server {
        status: status.as_u16(),
        message,
      }
    }
  }
}

fn classify_transport(err: reqwest::Error) -> FetchError {
  if let Some(status) = err.status() {
    return classify_status(status, "");
  }
  if err.is_decode() || err.is_builder() {
    return FetchError::Decode(err.to_string());
  }
  // Timeouts, refused connections, DNS and TLS failures
  FetchError::Network(err.to_string())
}

fn truncate(s: &str, max: usize) -> String {
  if s.len() <= max {
    return s.to_string();
  }
  let mut end = max;
  while !s.is_char_boundary(end) {
    end -= 1;
  }
  format!("{}...", &s[..end])
}
