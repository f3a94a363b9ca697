//! Link-header pagination over the source API
//!
//! [`Paginator::pages`] walks a resource from its start URL, following the
//! `Link: <...>; rel="next"` header of each response until there is none.
//! Every page request is retried on transient failures with a fixed delay
//! between attempts and can be cancelled at any point.

use futures::stream::{self, Stream};
use reqwest::header::{HeaderMap, ACCEPT, LINK};
use reqwest::Client;
use serde_json::Value;
use std::collections::HashSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::config::HttpConfig;
use crate::error::{FetchError, HttpError, PipelineError};
use crate::record::Record;

/// Object fields that may wrap the record array of a response
const ENVELOPE_FIELDS: [&str; 4] = ["data", "results", "items", "records"];

/// One fetched page
#[derive(Debug, Clone)]
pub struct Page {
    /// 1-based position in the pagination sequence
    pub number: usize,
    /// URL this page was fetched from
    pub url: Url,
    pub records: Vec<Record>,
    /// Resolved `rel="next"` target, `None` on the last page
    pub next_cursor: Option<Url>,
}

/// HTTP client for paginated resources
#[derive(Clone)]
pub struct Paginator {
    client: Client,
    config: HttpConfig,
    base_url: Url,
    cancel: CancellationToken,
}

impl Paginator {
    pub fn new(config: &HttpConfig, cancel: CancellationToken) -> Result<Self, PipelineError> {
        let client = Client::builder()
            .timeout(config.timeout())
            .user_agent(config.user_agent.as_str())
            .build()?;
        Self::with_client(client, config, cancel)
    }

    /// Use a preconfigured client; its timeout should match `config`
    pub fn with_client(
        client: Client,
        config: &HttpConfig,
        cancel: CancellationToken,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        Ok(Self {
            client,
            base_url: config.base_url()?,
            config: config.clone(),
            cancel,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Same client and settings, stopped by `cancel` instead
    pub fn with_cancel(&self, cancel: CancellationToken) -> Self {
        Self {
            cancel,
            ..self.clone()
        }
    }

    /// Lazily fetch every page starting at `start_url`.
    ///
    /// The stream ends after the last page or after the first error, which is
    /// yielded as its final item. A next link pointing back at an already
    /// visited page also ends it.
    pub fn pages(&self, start_url: Url) -> impl Stream<Item = Result<Page, FetchError>> + Send + 'static {
        self.walk(start_url, None)
    }

    /// Like [`pages`](Self::pages), but a single object carrying a scalar
    /// `primary_key` is kept as one record even when it holds an
    /// `items`/`data`/`results`/`records` array.
    pub fn keyed_pages(
        &self,
        start_url: Url,
        primary_key: impl Into<String>,
    ) -> impl Stream<Item = Result<Page, FetchError>> + Send + 'static {
        self.walk(start_url, Some(primary_key.into()))
    }

    fn walk(
        &self,
        start_url: Url,
        primary_key: Option<String>,
    ) -> impl Stream<Item = Result<Page, FetchError>> + Send + 'static {
        let state = WalkState {
            paginator: self.clone(),
            next: Some(start_url),
            number: 0,
            visited: HashSet::new(),
            primary_key,
        };

        stream::unfold(state, |mut state| async move {
            let url = state.next.take()?;
            if !state.visited.insert(url.clone()) {
                warn!(%url, "Next link points to an already fetched page, stopping");
                return None;
            }

            state.number += 1;
            match state
                .paginator
                .fetch_page(state.number, url, state.primary_key.as_deref())
                .await
            {
                Ok(page) => {
                    state.next = page.next_cursor.clone();
                    Some((Ok(page), state))
                },
                Err(e) => Some((Err(e), state)),
            }
        })
    }

    async fn fetch_page(
        &self,
        number: usize,
        url: Url,
        primary_key: Option<&str>,
    ) -> Result<Page, FetchError> {
        let (headers, body) = self.fetch_with_retry(&url).await?;
        let records = records_from_body(&url, &body, primary_key)?;

        let next_cursor = match next_link(&headers) {
            Ok(Some(target)) => self.resolve(&url, &target),
            Ok(None) => None,
            Err(reason) => {
                warn!(%url, %reason, "Malformed Link header, treating page as the last one");
                None
            },
        };

        debug!(
            %url,
            page = number,
            records = records.len(),
            has_next = next_cursor.is_some(),
            "Fetched page"
        );

        Ok(Page {
            number,
            url,
            records,
            next_cursor,
        })
    }

    fn resolve(&self, url: &Url, target: &str) -> Option<Url> {
        match self.base_url.join(target) {
            Ok(next) if matches!(next.scheme(), "http" | "https") => Some(next),
            Ok(next) => {
                warn!(%url, next = %next, "Next link is not an HTTP URL, treating page as the last one");
                None
            },
            Err(e) => {
                warn!(%url, target, error = %e, "Next link does not resolve, treating page as the last one");
                None
            },
        }
    }

    async fn fetch_with_retry(&self, url: &Url) -> Result<(HeaderMap, Vec<u8>), FetchError> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut last_cause = None;

        for attempt in 1..=max_attempts {
            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(FetchError::Cancelled { url: url.clone() }),
                result = self.attempt(url) => result,
            };

            match result {
                Ok(response) => return Ok(response),
                Err(cause) if !cause.is_retryable(self.config.retry_client_errors) => {
                    warn!(%url, attempt, max_attempts, error = %cause, "Request rejected, not retrying");
                    return Err(FetchError::Rejected {
                        url: url.clone(),
                        cause,
                    });
                },
                Err(cause) => {
                    warn!(%url, attempt, max_attempts, error = %cause, "Request attempt failed");
                    last_cause = Some(cause);

                    if attempt < max_attempts {
                        tokio::select! {
                            biased;
                            _ = self.cancel.cancelled() => {
                                return Err(FetchError::Cancelled { url: url.clone() })
                            },
                            _ = tokio::time::sleep(self.config.retry_delay()) => {},
                        }
                    }
                },
            }
        }

        Err(FetchError::Exhausted {
            url: url.clone(),
            attempts: max_attempts,
            last_cause: last_cause
                .unwrap_or_else(|| HttpError::Network("no attempt was made".to_string())),
        })
    }

    /// One GET, reading the whole body so a dropped connection mid-body is
    /// retried like any other network error.
    async fn attempt(&self, url: &Url) -> Result<(HeaderMap, Vec<u8>), HttpError> {
        let timeout_ms = self.config.timeout_ms;

        let response = self
            .client
            .get(url.clone())
            .header(ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| HttpError::from_reqwest(e, timeout_ms))?;

        let status = response.status();
        if !status.is_success() {
            return Err(HttpError::Status {
                status: status.as_u16(),
            });
        }

        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| HttpError::from_reqwest(e, timeout_ms))?;

        Ok((headers, body.to_vec()))
    }
}

struct WalkState {
    paginator: Paginator,
    next: Option<Url>,
    number: usize,
    visited: HashSet<Url>,
    primary_key: Option<String>,
}

/// Records of a response body: a JSON array of objects, an object wrapping
/// such an array, or one object. An empty or `null` body is an empty page.
///
/// With a `primary_key`, an object holding that key as a scalar is a record
/// in its own right and is never unwrapped.
pub fn records_from_body(
    url: &Url,
    body: &[u8],
    primary_key: Option<&str>,
) -> Result<Vec<Record>, FetchError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }

    let decode_error = |reason: String| FetchError::Decode {
        url: url.clone(),
        reason,
    };

    let value: Value = serde_json::from_slice(body).map_err(|e| decode_error(e.to_string()))?;

    match value {
        Value::Null => Ok(Vec::new()),
        Value::Array(items) => into_records(items).map_err(decode_error),
        Value::Object(mut object) => {
            let keyed = primary_key.is_some_and(|key| {
                matches!(
                    object.get(key),
                    Some(Value::String(_) | Value::Number(_) | Value::Bool(_))
                )
            });
            if keyed {
                return Ok(vec![object]);
            }

            let envelope = ENVELOPE_FIELDS
                .iter()
                .find(|field| matches!(object.get(**field), Some(Value::Array(_))));

            match envelope.and_then(|field| object.remove(*field)) {
                Some(Value::Array(items)) => into_records(items).map_err(decode_error),
                _ => Ok(vec![object]),
            }
        },
        other => Err(decode_error(format!(
            "expected a JSON array or object, got {}",
            json_kind(&other)
        ))),
    }
}

fn into_records(items: Vec<Value>) -> Result<Vec<Record>, String> {
    items
        .into_iter()
        .enumerate()
        .map(|(index, item)| match item {
            Value::Object(record) => Ok(record),
            other => Err(format!("item {index} is {}, not an object", json_kind(&other))),
        })
        .collect()
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a bool",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// The unresolved `rel="next"` target of the `Link` headers.
///
/// `Ok(None)` when no link has rel `next`; `Err` when the header cannot be
/// read or the next link is not of the form `<uri>; rel="next"`.
pub fn next_link(headers: &HeaderMap) -> Result<Option<String>, String> {
    for header in headers.get_all(LINK) {
        let header = header
            .to_str()
            .map_err(|_| "Link header is not valid ASCII".to_string())?;

        for link in split_unquoted(header, ',') {
            let mut parts = split_unquoted(link, ';').into_iter().map(str::trim);
            let target = parts.next().unwrap_or_default();

            let is_next = parts.any(|param| {
                let Some((name, value)) = param.split_once('=') else {
                    return false;
                };
                name.trim().eq_ignore_ascii_case("rel")
                    && value
                        .trim()
                        .trim_matches('"')
                        .split_ascii_whitespace()
                        .any(|rel| rel.eq_ignore_ascii_case("next"))
            });
            if !is_next {
                continue;
            }

            let uri = target
                .strip_prefix('<')
                .and_then(|t| t.strip_suffix('>'))
                .map(str::trim)
                .filter(|uri| !uri.is_empty())
                .ok_or_else(|| format!("next link target {target:?} is not of the form <uri>"))?;
            return Ok(Some(uri.to_string()));
        }
    }

    Ok(None)
}

/// Split on `separator` outside of `<...>` and double quotes
fn split_unquoted(input: &str, separator: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;
    let mut in_angle = false;

    for (i, c) in input.char_indices() {
        match c {
            '"' if !in_angle => in_quotes = !in_quotes,
            '<' if !in_quotes => in_angle = true,
            '>' if !in_quotes => in_angle = false,
            c if c == separator && !in_quotes && !in_angle => {
                parts.push(input[start..i].trim());
                start = i + c.len_utf8();
            },
            _ => {},
        }
    }
    parts.push(input[start..].trim());
    parts.retain(|p| !p.is_empty());
    parts
}
