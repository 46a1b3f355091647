use std::time::SystemTime;

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use url::Url;

const DEFAULT_BASE_URL: &str = "https://api.cropsync.app";

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("base url cannot carry path segments: {0}")]
    InvalidBaseUrl(String),
    #[error("payload for {table} has no record id")]
    MissingRecordId { table: String },
    #[error("api returned {status}: {body}")]
    Api {
        status: StatusCode,
        body: String,
        retry_after_secs: Option<u64>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    RateLimit,
    Transient,
    Permanent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mutation {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordRequest<'a> {
    pub mutation: Mutation,
    pub table: &'a str,
    pub payload: &'a Value,
    pub overwrite: bool,
}

/// Server-side state of a record that rejected a write.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RemoteRecord {
    /// `None` when the remote side deleted the record.
    #[serde(default)]
    pub current: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    Applied,
    Conflict(RemoteRecord),
}

#[derive(Clone)]
pub struct RecordClient {
    http: Client,
    base_url: Url,
    token: String,
}

impl RecordClient {
    pub fn new(token: impl Into<String>) -> Result<Self, ApiError> {
        Self::with_base_url(DEFAULT_BASE_URL, token)
    }

    pub fn with_base_url(base_url: &str, token: impl Into<String>) -> Result<Self, ApiError> {
        let base_url = Url::parse(base_url)?;
        if base_url.cannot_be_a_base() {
            return Err(ApiError::InvalidBaseUrl(base_url.to_string()));
        }
        Ok(Self {
            http: Client::new(),
            base_url,
            token: token.into(),
        })
    }

    pub async fn ping(&self) -> Result<(), ApiError> {
        let url = self.endpoint(&["v1", "health"])?;
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::api_error(response).await)
        }
    }

    pub async fn apply(&self, request: &RecordRequest<'_>) -> Result<ApplyOutcome, ApiError> {
        let overwrite = if request.overwrite { "true" } else { "false" };
        let builder = match request.mutation {
            Mutation::Create => {
                let mut url = self.endpoint(&["v1", "tables", request.table, "records"])?;
                url.query_pairs_mut().append_pair("overwrite", overwrite);
                self.http.post(url).json(request.payload)
            }
            Mutation::Update | Mutation::Delete => {
                let id = record_id(request.payload).ok_or_else(|| ApiError::MissingRecordId {
                    table: request.table.to_string(),
                })?;
                let mut url =
                    self.endpoint(&["v1", "tables", request.table, "records", id.as_str()])?;
                url.query_pairs_mut().append_pair("overwrite", overwrite);
                if request.mutation == Mutation::Update {
                    self.http.put(url).json(request.payload)
                } else {
                    self.http.delete(url)
                }
            }
        };

        let response = builder
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            return Ok(ApplyOutcome::Applied);
        }
        // Deleting something that is already gone converges.
        if status == StatusCode::NOT_FOUND && request.mutation == Mutation::Delete {
            return Ok(ApplyOutcome::Applied);
        }
        if status == StatusCode::CONFLICT {
            let body = response.text().await.unwrap_or_default();
            return match serde_json::from_str::<RemoteRecord>(&body) {
                Ok(remote) => Ok(ApplyOutcome::Conflict(remote)),
                Err(_) => Err(ApiError::Api {
                    status,
                    body,
                    retry_after_secs: None,
                }),
            };
        }
        Err(Self::api_error(response).await)
    }

    fn auth_header_value(&self) -> String {
        format!("Bearer {}", self.token)
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, ApiError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ApiError::InvalidBaseUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn api_error(response: reqwest::Response) -> ApiError {
        let status = response.status();
        let retry_after_secs = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_retry_after);
        let body = response.text().await.unwrap_or_default();
        ApiError::Api {
            status,
            body,
            retry_after_secs,
        }
    }
}

impl ApiError {
    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            ApiError::Api { status, .. } => Some(classify_api_status(*status)),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::Request(_) => true,
            _ => matches!(
                self.classification(),
                Some(ApiErrorClass::RateLimit | ApiErrorClass::Transient)
            ),
        }
    }

    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            ApiError::Api {
                retry_after_secs, ..
            } => *retry_after_secs,
            _ => None,
        }
    }
}

fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ApiErrorClass::Auth
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ApiErrorClass::RateLimit
    } else if status.is_server_error()
        || matches!(
            status,
            StatusCode::REQUEST_TIMEOUT | StatusCode::CONFLICT | StatusCode::TOO_EARLY
        )
    {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

/// Accepts both delta-seconds and HTTP-date forms.
fn parse_retry_after(value: &str) -> Option<u64> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(seconds);
    }
    let at = httpdate::parse_http_date(value).ok()?;
    Some(
        at.duration_since(SystemTime::now())
            .map(|delay| delay.as_secs())
            .unwrap_or(0),
    )
}

fn record_id(payload: &Value) -> Option<String> {
    match payload.get("id")? {
        Value::String(id) if !id.is_empty() => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn classifies_statuses() {
        assert_eq!(
            classify_api_status(StatusCode::UNAUTHORIZED),
            ApiErrorClass::Auth
        );
        assert_eq!(
            classify_api_status(StatusCode::TOO_MANY_REQUESTS),
            ApiErrorClass::RateLimit
        );
        assert_eq!(
            classify_api_status(StatusCode::BAD_GATEWAY),
            ApiErrorClass::Transient
        );
        assert_eq!(
            classify_api_status(StatusCode::UNPROCESSABLE_ENTITY),
            ApiErrorClass::Permanent
        );
    }

    #[test]
    fn retry_after_accepts_seconds_and_past_dates() {
        assert_eq!(parse_retry_after("17"), Some(17));
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"),
            Some(0)
        );
        assert_eq!(parse_retry_after("soon"), None);
    }

    #[test]
    fn record_id_reads_string_and_numeric_ids() {
        assert_eq!(record_id(&json!({"id": "g-1"})), Some("g-1".to_string()));
        assert_eq!(record_id(&json!({"id": 7})), Some("7".to_string()));
        assert_eq!(record_id(&json!({"id": ""})), None);
        assert_eq!(record_id(&json!({"name": "x"})), None);
    }

    #[test]
    fn endpoint_keeps_base_path_prefix() {
        let client = RecordClient::with_base_url("https://example.test/api/", "t").unwrap();
        let url = client.endpoint(&["v1", "tables", "goals"]).unwrap();
        assert_eq!(url.as_str(), "https://example.test/api/v1/tables/goals");
    }
}
