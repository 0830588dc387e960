//! Paginated OData client for the external production source.

use crate::config::{Credentials, SourceConfig};
use crate::ingest::record::RawRecord;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source request timed out: {0}")]
    Timeout(String),
    #[error("source transport error: {0}")]
    Transport(String),
    #[error("source returned server error {status}: {body}")]
    Server { status: StatusCode, body: String },
    #[error("source rejected credentials with status {status}")]
    Unauthorized { status: StatusCode },
    #[error("source returned client error {status}: {body}")]
    Client { status: StatusCode, body: String },
    #[error("failed to decode source response: {0}")]
    Decode(String),
    #[error("failed to build source client: {0}")]
    Setup(String),
    #[error("could not build source request: {0}")]
    InvalidRequest(String),
}

impl SourceError {
    /// Whether the same request may succeed if sent again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SourceError::Timeout(_) | SourceError::Transport(_) | SourceError::Server { .. }
        )
    }

    fn from_status(status: StatusCode, body: String) -> Self {
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                SourceError::Unauthorized { status }
            }
            status if status.is_server_error() => SourceError::Server { status, body },
            status => SourceError::Client { status, body },
        }
    }
}

impl From<reqwest::Error> for SourceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_builder() {
            SourceError::InvalidRequest(err.to_string())
        } else if err.is_timeout() {
            SourceError::Timeout(err.to_string())
        } else if err.is_decode() {
            SourceError::Decode(err.to_string())
        } else {
            SourceError::Transport(err.to_string())
        }
    }
}

/// Contract for anything that can supply raw records to an import.
#[async_trait::async_trait]
pub trait RecordSource: Send + Sync {
    async fn fetch(&self, filters: &SourceFilters) -> Result<Vec<RawRecord>, SourceError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum FilterOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Contains,
}

impl FilterOp {
    fn as_odata(self) -> &'static str {
        match self {
            FilterOp::Eq => "eq",
            FilterOp::Ne => "ne",
            FilterOp::Gt => "gt",
            FilterOp::Ge => "ge",
            FilterOp::Lt => "lt",
            FilterOp::Le => "le",
            FilterOp::Contains => "contains",
        }
    }
}

impl FromStr for FilterOp {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "eq" => Ok(FilterOp::Eq),
            "ne" => Ok(FilterOp::Ne),
            "gt" => Ok(FilterOp::Gt),
            "ge" | "gte" => Ok(FilterOp::Ge),
            "lt" => Ok(FilterOp::Lt),
            "le" | "lte" => Ok(FilterOp::Le),
            "contains" | "like" => Ok(FilterOp::Contains),
            other => Err(format!("unsupported filter operator '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct FilterClause {
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

impl FilterClause {
    fn to_odata(&self) -> Option<String> {
        let literal = match &self.value {
            Value::String(text) => format!("'{}'", text.replace('\'', "''")),
            Value::Number(number) => number.to_string(),
            Value::Bool(flag) => flag.to_string(),
            Value::Null => "null".to_string(),
            other => {
                log::warn!(
                    "skipping filter on {}: unsupported value {}",
                    self.field,
                    other
                );
                return None;
            }
        };

        Some(match self.op {
            FilterOp::Contains => format!("contains({}, {})", self.field, literal),
            op => format!("{} {} {}", self.field, op.as_odata(), literal),
        })
    }
}

/// Parses `field:op:value`. Numbers and booleans keep their type.
impl FromStr for FilterClause {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let mut parts = value.splitn(3, ':');
        let (Some(field), Some(op), Some(raw)) = (parts.next(), parts.next(), parts.next()) else {
            return Err(format!("expected field:op:value, got '{}'", value));
        };
        if field.trim().is_empty() {
            return Err("filter field must not be empty".to_string());
        }

        let value = match serde_json::from_str::<Value>(raw) {
            Ok(parsed @ (Value::Number(_) | Value::Bool(_))) => parsed,
            _ => Value::String(raw.to_string()),
        };

        Ok(Self {
            field: field.trim().to_string(),
            op: op.parse()?,
            value,
        })
    }
}

/// Conjunction of filter clauses sent as the OData `$filter`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SourceFilters {
    #[serde(default)]
    pub clauses: Vec<FilterClause>,
}

impl SourceFilters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, field: impl Into<String>, op: FilterOp, value: impl Into<Value>) -> Self {
        self.clauses.push(FilterClause {
            field: field.into(),
            op,
            value: value.into(),
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    pub fn to_odata(&self) -> Option<String> {
        let expressions: Vec<String> = self
            .clauses
            .iter()
            .filter_map(FilterClause::to_odata)
            .collect();
        if expressions.is_empty() {
            None
        } else {
            Some(expressions.join(" and "))
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SourceHealth {
    pub status: String,
    pub base_url: String,
    pub page_size: usize,
    pub checked_at: DateTime<Utc>,
}

enum PageRequest {
    First { filter: Option<String> },
    Next(String),
}

impl fmt::Display for PageRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PageRequest::First { .. } => write!(f, "first page"),
            PageRequest::Next(url) => write!(f, "{}", url),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PageBody {
    Bare(Vec<RawRecord>),
    Wrapped {
        value: Vec<RawRecord>,
        #[serde(rename = "@odata.nextLink", default)]
        next_link: Option<String>,
    },
}

impl PageBody {
    fn parse(body: &[u8]) -> Result<(Vec<RawRecord>, Option<String>), SourceError> {
        let parsed: PageBody =
            serde_json::from_slice(body).map_err(|e| SourceError::Decode(e.to_string()))?;
        Ok(match parsed {
            PageBody::Bare(records) => (records, None),
            PageBody::Wrapped { value, next_link } => (value, next_link),
        })
    }
}

/// Resolve a possibly relative `@odata.nextLink` against the URL of the page
/// that returned it.
fn resolve_next_link(current: &str, next_link: &str) -> Result<String, SourceError> {
    reqwest::Url::parse(current)
        .and_then(|base| base.join(next_link))
        .map(|url| url.to_string())
        .map_err(|e| SourceError::Decode(format!("invalid next link {:?}: {}", next_link, e)))
}

#[derive(Clone)]
pub struct FetchClient {
    http: reqwest::Client,
    config: SourceConfig,
}

impl FetchClient {
    pub fn new(config: SourceConfig) -> Result<Self, SourceError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(Duration::from_secs(10))
            .user_agent("ingest-server/0.1")
            .build()
            .map_err(|e| SourceError::Setup(e.to_string()))?;

        Ok(Self { http, config })
    }

    /// Fetch every page, following `@odata.nextLink` until it is absent or a
    /// page comes back empty.
    pub async fn fetch_all(
        &self,
        credentials: Option<&Credentials>,
        filters: &SourceFilters,
    ) -> Result<Vec<RawRecord>, SourceError> {
        let started = Instant::now();
        let mut records = Vec::new();
        let mut pages = 0usize;
        let mut request = PageRequest::First {
            filter: filters.to_odata(),
        };

        log::info!("fetching records from {}", self.config.endpoint());

        loop {
            let (page, next_link) = self.fetch_page(&request, credentials).await?;
            pages += 1;

            if page.is_empty() {
                log::debug!("page {} empty, stopping pagination", pages);
                break;
            }
            records.extend(page);

            let Some(next_link) = next_link else {
                break;
            };
            let current = match &request {
                PageRequest::First { .. } => self.config.endpoint(),
                PageRequest::Next(url) => url.clone(),
            };
            let next = resolve_next_link(&current, &next_link)?;
            if next == current {
                log::warn!("source returned the same next link twice, stopping: {}", next);
                break;
            }
            request = PageRequest::Next(next);
        }

        log::info!(
            "fetched {} records in {} page(s) in {:?}",
            records.len(),
            pages,
            started.elapsed()
        );

        Ok(records)
    }

    /// Check the source with a single-record request. Never errors.
    pub async fn validate_connection(&self) -> bool {
        let mut builder = self
            .http
            .get(self.config.endpoint())
            .query(&[("$top", "1"), ("$format", "json")])
            .timeout(self.config.check_timeout);
        if let Some(credentials) = &self.config.credentials {
            builder = builder.basic_auth(&credentials.username, Some(&credentials.password));
        }

        match builder.send().await {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                log::warn!(
                    "source connection check failed with status {}",
                    response.status()
                );
                false
            }
            Err(err) => {
                log::warn!("source connection check failed: {}", err);
                false
            }
        }
    }

    pub async fn health(&self) -> SourceHealth {
        let healthy = self.validate_connection().await;
        SourceHealth {
            status: if healthy { "healthy" } else { "unhealthy" }.to_string(),
            base_url: self.config.base_url.clone(),
            page_size: self.config.page_size,
            checked_at: Utc::now(),
        }
    }

    async fn fetch_page(
        &self,
        request: &PageRequest,
        credentials: Option<&Credentials>,
    ) -> Result<(Vec<RawRecord>, Option<String>), SourceError> {
        let mut attempt: u32 = 0;
        loop {
            match self.send_once(request, credentials).await {
                Ok(page) => return Ok(page),
                Err(err) if err.is_retryable() && attempt < self.config.max_retries => {
                    attempt += 1;
                    log::warn!(
                        "source request for {} failed (attempt {}/{}), retrying: {}",
                        request,
                        attempt,
                        self.config.max_retries + 1,
                        err
                    );
                    tokio::time::sleep(self.config.retry_delay * attempt).await;
                }
                Err(err) => {
                    log::error!("source request for {} failed: {}", request, err);
                    return Err(err);
                }
            }
        }
    }

    async fn send_once(
        &self,
        request: &PageRequest,
        credentials: Option<&Credentials>,
    ) -> Result<(Vec<RawRecord>, Option<String>), SourceError> {
        let mut builder = match request {
            PageRequest::First { filter } => {
                let mut query = vec![
                    ("$top", self.config.page_size.to_string()),
                    ("$format", "json".to_string()),
                ];
                if let Some(filter) = filter {
                    query.push(("$filter", filter.clone()));
                }
                self.http.get(self.config.endpoint()).query(&query)
            }
            PageRequest::Next(url) => self.http.get(url),
        };
        if let Some(credentials) = credentials {
            builder = builder.basic_auth(&credentials.username, Some(&credentials.password));
        }

        let response = builder.send().await?;
        let status = response.status();
        if status.is_success() {
            let body = response.bytes().await?;
            return PageBody::parse(&body);
        }

        let body = response.text().await.unwrap_or_default();
        Err(SourceError::from_status(status, body))
    }
}

#[async_trait::async_trait]
impl RecordSource for FetchClient {
    async fn fetch(&self, filters: &SourceFilters) -> Result<Vec<RawRecord>, SourceError> {
        self.fetch_all(self.config.credentials.as_ref(), filters)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_classification() {
        assert!(matches!(
            SourceError::from_status(StatusCode::UNAUTHORIZED, String::new()),
            SourceError::Unauthorized { .. }
        ));
        assert!(matches!(
            SourceError::from_status(StatusCode::FORBIDDEN, String::new()),
            SourceError::Unauthorized { .. }
        ));
        assert!(
            SourceError::from_status(StatusCode::SERVICE_UNAVAILABLE, String::new()).is_retryable()
        );
        assert!(!SourceError::from_status(StatusCode::NOT_FOUND, String::new()).is_retryable());
        assert!(!SourceError::Decode("bad".into()).is_retryable());
        assert!(SourceError::Timeout("slow".into()).is_retryable());
    }

    #[test]
    fn request_build_errors_are_not_retried() {
        let err = reqwest::Client::new()
            .get("WellProduction?$skiptoken=1")
            .build()
            .expect_err("relative URL cannot be requested");
        let err = SourceError::from(err);
        assert!(matches!(err, SourceError::InvalidRequest(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn next_links_resolve_against_current_page() {
        let current = "http://host/odata/WellProduction?$top=100&$format=json";
        assert_eq!(
            resolve_next_link(current, "WellProduction?$skiptoken=1").expect("resolves"),
            "http://host/odata/WellProduction?$skiptoken=1"
        );
        assert_eq!(
            resolve_next_link(current, "/other/WellProduction?$skiptoken=2").expect("resolves"),
            "http://host/other/WellProduction?$skiptoken=2"
        );
        assert_eq!(
            resolve_next_link(current, "https://mirror/odata/WellProduction?$skiptoken=3")
                .expect("resolves"),
            "https://mirror/odata/WellProduction?$skiptoken=3"
        );
        assert!(resolve_next_link("not a url", "WellProduction").is_err());
    }

    #[test]
    fn filters_render_as_odata() {
        let filters = SourceFilters::new()
            .with("field_code", FilterOp::Eq, 7)
            .with("production_period", FilterOp::Ge, "2024-01")
            .with("well_name", FilterOp::Contains, "O'Neil");

        assert_eq!(
            filters.to_odata().as_deref(),
            Some(
                "field_code eq 7 and production_period ge '2024-01' and contains(well_name, 'O''Neil')"
            )
        );
        assert_eq!(SourceFilters::new().to_odata(), None);
    }

    #[test]
    fn unsupported_filter_values_are_skipped() {
        let filters = SourceFilters::new().with("tags", FilterOp::Eq, json!(["a"]));
        assert_eq!(filters.to_odata(), None);
    }

    #[test]
    fn filter_clause_parses_from_cli_syntax() {
        let clause: FilterClause = "field_code:gte:12".parse().expect("clause parses");
        assert_eq!(clause.field, "field_code");
        assert_eq!(clause.op, FilterOp::Ge);
        assert_eq!(clause.value, json!(12));

        let clause: FilterClause = "production_period:eq:2024-01".parse().expect("clause parses");
        assert_eq!(clause.value, json!("2024-01"));

        assert!("missing_parts".parse::<FilterClause>().is_err());
        assert!("f:between:1".parse::<FilterClause>().is_err());
    }

    #[test]
    fn page_body_accepts_wrapped_and_bare_arrays() {
        let (records, next) = PageBody::parse(
            br#"{"value": [{"well_code": 1}], "@odata.nextLink": "http://source/next"}"#,
        )
        .expect("wrapped page parses");
        assert_eq!(records.len(), 1);
        assert_eq!(next.as_deref(), Some("http://source/next"));

        let (records, next) =
            PageBody::parse(br#"[{"well_code": 1}, {"well_code": 2}]"#).expect("bare page parses");
        assert_eq!(records.len(), 2);
        assert!(next.is_none());

        assert!(matches!(
            PageBody::parse(b"not json"),
            Err(SourceError::Decode(_))
        ));
    }
}
