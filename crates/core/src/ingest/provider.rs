use crate::config::Settings;
use crate::ingest::types::{ConsensusFigures, FetchKey, ProviderData, ProviderKind, Quote, RawRating};
use anyhow::Context;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::StatusCode;
use serde_json::Value;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProviderError {
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("provider rate limited")]
    RateLimited,

    #[error("invalid or unsupported symbol: {0}")]
    InvalidSymbol(String),

    #[error("failed to decode provider response: {0}")]
    Decode(String),
}

impl ProviderError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::RateLimited)
    }
}

/// Opaque source of quotes, analyst ratings and consensus figures.
#[async_trait::async_trait]
pub trait Provider: Send + Sync {
    fn provider_name(&self) -> &'static str;

    async fn fetch(&self, kind: ProviderKind, key: &FetchKey) -> Result<ProviderData, ProviderError>;
}

#[derive(Debug, Clone)]
pub struct HttpJsonProvider {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    retries: u32,
}

impl HttpJsonProvider {
    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let base_url = settings.require_data_provider_base_url()?.to_string();

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.data_provider_timeout_secs))
            .build()
            .context("failed to build data provider http client")?;

        Ok(Self {
            http,
            base_url,
            api_key: settings.data_provider_api_key.clone(),
            retries: settings.data_provider_retries.max(1),
        })
    }

    fn url(&self, kind: ProviderKind) -> String {
        format!("{}/v1/{}", self.base_url.trim_end_matches('/'), kind.as_str())
    }

    fn headers(&self) -> Result<HeaderMap, ProviderError> {
        let mut headers = HeaderMap::new();
        if let Some(api_key) = &self.api_key {
            let value = HeaderValue::from_str(api_key)
                .map_err(|e| ProviderError::Unavailable(format!("invalid api key header: {e}")))?;
            headers.insert("x-api-key", value);
        }
        Ok(headers)
    }

    async fn fetch_once(&self, kind: ProviderKind, key: &FetchKey) -> Result<ProviderData, ProviderError> {
        let mut query = vec![("ticker", key.ticker.clone())];
        if let Some(on) = key.on {
            query.push(("date", on.to_string()));
        }

        let res = self
            .http
            .get(self.url(kind))
            .headers(self.headers()?)
            .query(&query)
            .send()
            .await
            .map_err(|e| ProviderError::Unavailable(format!("request failed: {e}")))?;

        let status = res.status();
        let text = res
            .text()
            .await
            .map_err(|e| ProviderError::Unavailable(format!("failed to read response: {e}")))?;

        match status {
            s if s.is_success() => {}
            StatusCode::NOT_FOUND => return Err(ProviderError::InvalidSymbol(key.ticker.clone())),
            StatusCode::TOO_MANY_REQUESTS => return Err(ProviderError::RateLimited),
            s => return Err(ProviderError::Unavailable(format!("HTTP {s}: {text}"))),
        }

        let raw = serde_json::from_str::<Value>(&text)
            .map_err(|e| ProviderError::Decode(format!("response is not valid JSON: {e}")))?;
        decode(kind, raw)
    }
}

#[async_trait::async_trait]
impl Provider for HttpJsonProvider {
    fn provider_name(&self) -> &'static str {
        "external_http_json"
    }

    async fn fetch(&self, kind: ProviderKind, key: &FetchKey) -> Result<ProviderData, ProviderError> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.fetch_once(kind, key).await {
                Ok(data) => return Ok(data),
                Err(err) if err.is_retryable() && attempt < self.retries => {
                    let backoff = Duration::from_secs(1 << (attempt - 1));
                    tracing::warn!(
                        kind = kind.as_str(),
                        %key,
                        attempt,
                        ?backoff,
                        error = %err,
                        "provider fetch failed; retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Single adapter boundary: every response shape becomes a `ProviderData`.
pub fn decode(kind: ProviderKind, raw: Value) -> Result<ProviderData, ProviderError> {
    let decode_err = |e: serde_json::Error| ProviderError::Decode(format!("{}: {e}", kind.as_str()));
    match kind {
        ProviderKind::Quote => serde_json::from_value::<Quote>(raw)
            .map(ProviderData::Quote)
            .map_err(decode_err),
        ProviderKind::AnalystRatings => {
            // Either a bare array or {"items": [...]}.
            let rows = match raw {
                Value::Object(mut m) => m.remove("items").unwrap_or(Value::Array(Vec::new())),
                Value::Null => Value::Array(Vec::new()),
                other => other,
            };
            serde_json::from_value::<Vec<RawRating>>(rows)
                .map(ProviderData::Ratings)
                .map_err(decode_err)
        }
        ProviderKind::Consensus => serde_json::from_value::<ConsensusFigures>(raw)
            .map(ProviderData::Consensus)
            .map_err(decode_err),
    }
}
