use std::thread::sleep;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use serde_json::{Value, json};

use crate::config::{self, MigrationConfig};

/// Metadata for a page that does not exist downstream yet.
#[derive(Debug, Clone)]
pub struct NewPage<'a> {
    pub path: &'a str,
    pub title: &'a str,
    pub content: &'a str,
    pub locale: &'a str,
}

/// Downstream seam: a page store with a delete-then-recreate lifecycle.
/// The driver looks pages up by path, clears leftovers from earlier runs,
/// creates once and updates for every later revision.
pub trait PageStore {
    fn find_page(&mut self, path: &str) -> Result<Option<i64>>;
    fn delete_page(&mut self, id: i64) -> Result<()>;
    fn create_page(&mut self, page: &NewPage<'_>) -> Result<i64>;
    fn update_page(&mut self, id: i64, content: &str) -> Result<()>;
    fn request_count(&self) -> usize;
}

const LIST_PAGES_QUERY: &str = "\
query {
  pages {
    list {
      id
      path
    }
  }
}";

const CREATE_PAGE_MUTATION: &str = "\
mutation (
  $content: String!, $description: String!, $editor: String!,
  $isPublished: Boolean!, $isPrivate: Boolean!, $locale: String!,
  $path: String!, $tags: [String]!, $title: String!
) {
  pages {
    create(
      content: $content, description: $description, editor: $editor,
      isPublished: $isPublished, isPrivate: $isPrivate, locale: $locale,
      path: $path, tags: $tags, title: $title
    ) {
      responseResult {
        succeeded
        errorCode
        message
      }
      page {
        id
      }
    }
  }
}";

const UPDATE_PAGE_MUTATION: &str = "\
mutation ($id: Int!, $content: String!, $isPublished: Boolean!, $isPrivate: Boolean!) {
  pages {
    update(id: $id, content: $content, isPublished: $isPublished, isPrivate: $isPrivate) {
      responseResult {
        succeeded
        errorCode
        message
      }
    }
  }
}";

const DELETE_PAGE_MUTATION: &str = "\
mutation ($id: Int!) {
  pages {
    delete(id: $id) {
      responseResult {
        succeeded
        errorCode
        message
      }
    }
  }
}";

#[derive(Debug, Clone)]
pub struct WikiJsClientConfig {
    pub host: String,
    pub token: String,
    pub timeout_ms: u64,
    pub rate_limit_ms: u64,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
}

impl WikiJsClientConfig {
    pub fn from_config(config: &MigrationConfig) -> Self {
        Self {
            host: config.destination_host().unwrap_or_default(),
            token: config.destination_token().unwrap_or_default(),
            timeout_ms: config::env_value_u64("WIKIJS_HTTP_TIMEOUT_MS").unwrap_or(30_000),
            rate_limit_ms: config::env_value_u64("WIKIJS_RATE_LIMIT_MS").unwrap_or(200),
            max_retries: config::env_value_usize("WIKIJS_HTTP_RETRIES").unwrap_or(2),
            retry_delay_ms: config::env_value_u64("WIKIJS_HTTP_RETRY_DELAY_MS").unwrap_or(500),
        }
    }
}

#[derive(Debug)]
pub struct WikiJsClient {
    client: Client,
    config: WikiJsClientConfig,
    last_request_at: Option<Instant>,
    request_count: usize,
}

impl WikiJsClient {
    pub fn new(config: WikiJsClientConfig) -> Result<Self> {
        if config.host.trim().is_empty() {
            bail!("Wiki.js host is not configured (set WIKIJS_HOST or [destination] host)");
        }
        if config.token.trim().is_empty() {
            bail!("Wiki.js API token is not configured (set WIKIJS_TOKEN)");
        }
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .context("failed to build Wiki.js HTTP client")?;

        Ok(Self {
            client,
            config,
            last_request_at: None,
            request_count: 0,
        })
    }

    fn graphql_url(&self) -> String {
        format!("{}/graphql", self.config.host.trim_end_matches('/'))
    }

    fn request_graphql(&mut self, query: &str, variables: Value) -> Result<Value> {
        let body = json!({ "query": query, "variables": variables });

        for attempt in 0..=self.config.max_retries {
            self.apply_rate_limit();
            let response = self
                .client
                .post(self.graphql_url())
                .bearer_auth(&self.config.token)
                .json(&body)
                .send();

            match response {
                Ok(response) => {
                    let status = response.status();
                    if !status.is_success() {
                        if attempt < self.config.max_retries && is_retryable_status(status) {
                            self.wait_before_retry(attempt);
                            continue;
                        }
                        bail!("Wiki.js GraphQL request failed with HTTP {status}");
                    }

                    let payload: Value = response
                        .json()
                        .context("failed to decode Wiki.js GraphQL response")?;
                    if let Some(message) = first_graphql_error(&payload) {
                        bail!("Wiki.js GraphQL error: {message}");
                    }
                    return Ok(payload);
                }
                Err(error) => {
                    if attempt < self.config.max_retries && is_retryable_error(&error) {
                        self.wait_before_retry(attempt);
                        continue;
                    }
                    return Err(error).context("failed to call Wiki.js GraphQL API");
                }
            }
        }

        bail!("Wiki.js GraphQL request exhausted retry budget")
    }

    fn apply_rate_limit(&mut self) {
        let delay = Duration::from_millis(self.config.rate_limit_ms);
        if let Some(last) = self.last_request_at {
            let elapsed = last.elapsed();
            if elapsed < delay {
                sleep(delay - elapsed);
            }
        }
        self.last_request_at = Some(Instant::now());
        self.request_count += 1;
    }

    fn wait_before_retry(&self, attempt: usize) {
        let exponent = u32::try_from(attempt).unwrap_or(16);
        let base = self
            .config
            .retry_delay_ms
            .saturating_mul(2u64.saturating_pow(exponent));
        let jitter = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| u64::from(duration.subsec_millis() % 100))
            .unwrap_or(0);
        sleep(Duration::from_millis(base.saturating_add(jitter)));
    }
}

impl PageStore for WikiJsClient {
    fn find_page(&mut self, path: &str) -> Result<Option<i64>> {
        let payload = self.request_graphql(LIST_PAGES_QUERY, json!({}))?;
        let list = payload
            .pointer("/data/pages/list")
            .ok_or_else(|| anyhow::anyhow!("missing page list in Wiki.js response"))?;
        Ok(page_id_from_list(list, path))
    }

    fn delete_page(&mut self, id: i64) -> Result<()> {
        let payload = self.request_graphql(DELETE_PAGE_MUTATION, json!({ "id": id }))?;
        ensure_succeeded(&payload, "/data/pages/delete/responseResult", "page delete")
    }

    fn create_page(&mut self, page: &NewPage<'_>) -> Result<i64> {
        let variables = json!({
            "content": page.content,
            "description": "",
            "editor": "markdown",
            "isPublished": true,
            "isPrivate": false,
            "locale": page.locale,
            "path": page.path,
            "tags": [],
            "title": page.title,
        });
        let payload = self.request_graphql(CREATE_PAGE_MUTATION, variables)?;
        ensure_succeeded(&payload, "/data/pages/create/responseResult", "page create")?;
        payload
            .pointer("/data/pages/create/page/id")
            .and_then(Value::as_i64)
            .ok_or_else(|| anyhow::anyhow!("page create did not return an id for {}", page.path))
    }

    fn update_page(&mut self, id: i64, content: &str) -> Result<()> {
        let variables = json!({
            "id": id,
            "content": content,
            "isPublished": true,
            "isPrivate": false,
        });
        let payload = self.request_graphql(UPDATE_PAGE_MUTATION, variables)?;
        ensure_succeeded(&payload, "/data/pages/update/responseResult", "page update")
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}

fn page_id_from_list(list: &Value, path: &str) -> Option<i64> {
    list.as_array()?.iter().find_map(|entry| {
        let entry_path = entry.get("path").and_then(Value::as_str)?;
        if entry_path == path {
            entry.get("id").and_then(Value::as_i64)
        } else {
            None
        }
    })
}

fn first_graphql_error(payload: &Value) -> Option<String> {
    payload
        .get("errors")
        .and_then(Value::as_array)
        .and_then(|errors| errors.first())
        .map(|error| {
            error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown GraphQL error")
                .to_string()
        })
}

fn ensure_succeeded(payload: &Value, pointer: &str, operation: &str) -> Result<()> {
    let result = payload
        .pointer(pointer)
        .ok_or_else(|| anyhow::anyhow!("missing responseResult for {operation}"))?;
    let succeeded = result
        .get("succeeded")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    if !succeeded {
        let code = result
            .get("errorCode")
            .and_then(Value::as_i64)
            .unwrap_or_default();
        let message = result
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        bail!("Wiki.js {operation} failed [{code}]: {message}");
    }
    Ok(())
}

fn is_retryable_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::REQUEST_TIMEOUT
            | StatusCode::TOO_MANY_REQUESTS
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

fn is_retryable_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect() || error.is_request()
}
