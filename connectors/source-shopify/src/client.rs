use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, LINK, RETRY_AFTER};
use reqwest::StatusCode;
use shopsync_types::dataset::DatasetDescriptor;
use shopsync_types::record::RawRecord;
use shopsync_types::source::{Page, PagePosition, PageRequest, PageSource, SourceError};

use crate::headers;

/// Connection settings for one Shopify store.
#[derive(Clone)]
pub struct ShopifyConfig {
    /// Store name, the `<store>` in `<store>.myshopify.com`.
    pub store: String,
    pub api_key: String,
    pub password: String,
    pub api_version: String,
    /// Replaces `https://<store>.myshopify.com/admin/api/<version>`.
    pub base_url: Option<String>,
    pub timeout: Duration,
}

impl std::fmt::Debug for ShopifyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShopifyConfig")
            .field("store", &self.store)
            .field("api_version", &self.api_version)
            .field("base_url", &self.base_url)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl ShopifyConfig {
    fn resolved_base_url(&self) -> String {
        match &self.base_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!(
                "https://{}.myshopify.com/admin/api/{}",
                self.store, self.api_version
            ),
        }
    }
}

/// Shopify Admin REST API client.
///
/// Authenticates with HTTP basic auth (private app key and password) and
/// follows cursor pagination through the `Link` response header.
#[derive(Clone)]
pub struct ShopifySource {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    password: String,
}

impl ShopifySource {
    /// Build a client for the configured store.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Fatal`] if the HTTP client cannot be built.
    pub fn new(config: &ShopifyConfig) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.timeout)
            .build()
            .map_err(|e| SourceError::Fatal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: config.resolved_base_url(),
            api_key: config.api_key.clone(),
            password: config.password.clone(),
        })
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint_url(&self, dataset: &DatasetDescriptor) -> String {
        format!("{}/{}.json", self.base_url, dataset.endpoint)
    }

    fn build_request(
        &self,
        dataset: &DatasetDescriptor,
        request: &PageRequest,
    ) -> reqwest::RequestBuilder {
        let builder = match &request.position {
            PagePosition::First { since } => {
                let mut query = vec![("limit", request.page_size.to_string())];
                if let Some(value) = since.filter_value() {
                    query.push((dataset.since_param.as_str(), value));
                }
                self.client.get(self.endpoint_url(dataset)).query(&query)
            }
            PagePosition::Next(url) => self.client.get(url),
        };
        builder.basic_auth(&self.api_key, Some(&self.password))
    }
}

#[async_trait]
impl PageSource for ShopifySource {
    async fn fetch_page(
        &self,
        dataset: &DatasetDescriptor,
        request: &PageRequest,
    ) -> Result<Page, SourceError> {
        let resp = self
            .build_request(dataset, request)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = resp.status();
        let headers = resp.headers().clone();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, &headers, &body));
        }

        let body = resp.text().await.map_err(classify_transport)?;
        let records = parse_records(&body, &dataset.response_key)?;
        let page = page_from_headers(records, &headers);
        tracing::debug!(
            dataset = dataset.kind.as_str(),
            records = page.records.len(),
            last = page.is_last(),
            quota_exhausted = page.quota_exhausted,
            "Fetched page"
        );
        Ok(page)
    }
}

fn classify_transport(err: reqwest::Error) -> SourceError {
    if err.is_builder() {
        SourceError::Fatal(format!("invalid request: {err}"))
    } else {
        SourceError::Transient(format!("request failed: {err}"))
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: impl reqwest::header::AsHeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn classify_status(status: StatusCode, headers: &HeaderMap, body: &str) -> SourceError {
    let detail = if body.is_empty() {
        format!("HTTP {status}")
    } else {
        format!("HTTP {status}: {}", body.chars().take(200).collect::<String>())
    };
    match status {
        StatusCode::TOO_MANY_REQUESTS => SourceError::RateLimited {
            retry_after: header_str(headers, RETRY_AFTER).and_then(headers::retry_after),
        },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => SourceError::Auth(detail),
        s if s.is_server_error() => SourceError::Transient(detail),
        _ => SourceError::Fatal(detail),
    }
}

fn parse_records(body: &str, response_key: &str) -> Result<Vec<RawRecord>, SourceError> {
    let mut json: serde_json::Value = serde_json::from_str(body)
        .map_err(|e| SourceError::Fatal(format!("response is not valid JSON: {e}")))?;
    let items = match json.get_mut(response_key).map(serde_json::Value::take) {
        Some(serde_json::Value::Array(items)) => items,
        Some(_) => {
            return Err(SourceError::Fatal(format!(
                "response key '{response_key}' is not an array"
            )))
        }
        None => {
            return Err(SourceError::Fatal(format!(
                "response is missing key '{response_key}'"
            )))
        }
    };
    items
        .into_iter()
        .map(|item| match item {
            serde_json::Value::Object(map) => Ok(map),
            other => Err(SourceError::Fatal(format!(
                "expected an object in '{response_key}', got {other}"
            ))),
        })
        .collect()
}

fn page_from_headers(records: Vec<RawRecord>, headers: &HeaderMap) -> Page {
    let next = header_str(headers, LINK).and_then(headers::next_link);
    let quota_exhausted = header_str(headers, headers::CALL_LIMIT)
        .and_then(headers::call_limit)
        .is_some_and(|(used, max)| used >= max);
    let retry_after = if quota_exhausted {
        header_str(headers, RETRY_AFTER).and_then(headers::retry_after)
    } else {
        None
    };
    Page {
        records,
        next,
        quota_exhausted,
        retry_after,
    }
}
