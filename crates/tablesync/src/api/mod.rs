//! Paginated HTTP endpoint extraction.
//!
//! Fetches pages for a configured [`Endpoint`], classifies failures
//! through the endpoint's error policy, and streams row batches to the
//! caller. Retries apply here and only here; the merge phase never
//! retries.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::classify::{classify_http_error, ErrorClass, ExitAction, RETRY_BUDGET};
use crate::conn::Row;
use crate::error::{Result, SyncError};
use crate::extract::{Endpoint, Method, ResponseType};

const RETRY_DELAY: Duration = Duration::from_millis(200);

/// Streams rows out of one HTTP endpoint.
pub struct ApiExtractor {
    client: reqwest::Client,
    endpoint: Endpoint,
}

impl ApiExtractor {
    pub fn new(endpoint: Endpoint) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| SyncError::Config(format!("HTTP client: {e}")))?;
        Ok(Self { client, endpoint })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Fetch every page, sending one row batch per page.
    ///
    /// All failures travel through the channel so the consuming bulk
    /// loader observes them in stream order.
    pub async fn fetch(&self, cancel: &CancellationToken, batches: mpsc::Sender<Result<Vec<Row>>>) {
        match self.run(cancel, &batches).await {
            Ok(rows) => debug!(url = %self.endpoint.url, rows, "endpoint extraction complete"),
            Err(e) => {
                let _ = batches.send(Err(e)).await;
            }
        }
    }

    /// Fetch every page and collect all rows. Intended for small result
    /// sets and tests; prefer [`fetch`](Self::fetch) for streaming.
    pub async fn fetch_all(&self, cancel: &CancellationToken) -> Result<Vec<Row>> {
        let (tx, mut rx) = mpsc::channel(16);
        let collect = async {
            let mut rows = Vec::new();
            while let Some(batch) = rx.recv().await {
                rows.extend(batch?);
            }
            Ok(rows)
        };
        let ((), rows) = tokio::join!(self.fetch(cancel, tx), collect);
        rows
    }

    async fn run(
        &self,
        cancel: &CancellationToken,
        batches: &mpsc::Sender<Result<Vec<Row>>>,
    ) -> Result<u64> {
        let columns = self.endpoint.column_names();
        let mut url = self.endpoint.url.clone();
        let mut page: u64 = 1;
        let mut total: u64 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }

            let body = self.fetch_page(&url, cancel).await?;
            let rows = self.rows_from_body(&body, &columns)?;
            debug!(url = %url, page, rows = rows.len(), "fetched page");
            total += rows.len() as u64;
            if !rows.is_empty() && batches.send(Ok(rows)).await.is_err() {
                // Receiver gone means the loader side already failed.
                return Err(SyncError::Cancelled);
            }

            let Some(paginate) = &self.endpoint.paginate else {
                break;
            };
            match self
                .endpoint
                .script
                .call_paginate(paginate, &url, page, &body)?
            {
                Some(next) => {
                    url = next;
                    page += 1;
                }
                None => break,
            }
        }
        Ok(total)
    }

    /// Fetch and parse one page, retrying per the endpoint's error policy.
    async fn fetch_page(&self, url: &str, cancel: &CancellationToken) -> Result<serde_json::Value> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let (class, message) = match self.request(url).await {
                Ok(body) => return Ok(body),
                Err(failure) => failure,
            };

            let action = self.endpoint.error_policy.action_for(class);
            if action == ExitAction::Retry && attempt < RETRY_BUDGET && !cancel.is_cancelled() {
                warn!(url, class = %class, attempt, "extraction failed, retrying");
                tokio::time::sleep(RETRY_DELAY * attempt).await;
                continue;
            }
            return Err(SyncError::extraction(class, message, action.code()));
        }
    }

    async fn request(&self, url: &str) -> std::result::Result<serde_json::Value, (ErrorClass, String)> {
        let mut request = match self.endpoint.method {
            Method::Get => self.client.get(url),
            Method::Post => self.client.post(url),
        };
        for (key, value) in &self.endpoint.headers {
            request = request.header(key, value);
        }
        if let Some((user, password)) = &self.endpoint.basic_auth {
            request = request.basic_auth(user, Some(password));
        }

        let response = request
            .send()
            .await
            .map_err(|e| (classify_http_error(&e), e.to_string()))?;

        let status = response.status();
        if let Some(class) = ErrorClass::from_status(status.as_u16()) {
            return Err((class, format!("HTTP {status} from {url}")));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| (ErrorClass::NetworkError, e.to_string()))?;

        match self.endpoint.response_type {
            ResponseType::Json => serde_json::from_slice(&bytes)
                .map_err(|e| (ErrorClass::InvalidBodyError, format!("invalid JSON body: {e}"))),
            ResponseType::Csv => {
                csv_to_json(&bytes).map_err(|e| (ErrorClass::InvalidBodyError, e))
            }
        }
    }

    /// Map a parsed body to rows in table-definition column order.
    fn rows_from_body(&self, body: &serde_json::Value, columns: &[String]) -> Result<Vec<Row>> {
        if let Some(transform) = &self.endpoint.transform {
            return self
                .endpoint
                .script
                .call_body_transform(transform, body, columns);
        }

        let Some(items) = body.as_array() else {
            let class = ErrorClass::InvalidBodyError;
            let action = self.endpoint.error_policy.action_for(class);
            return Err(SyncError::extraction(
                class,
                "response body is not a row array and no Transform() is configured",
                action.code(),
            ));
        };

        let mut rows = Vec::with_capacity(items.len());
        for item in items {
            let mut row = Vec::with_capacity(columns.len());
            for column in columns {
                row.push(json_cell(item.get(column).unwrap_or(&serde_json::Value::Null))?);
            }
            rows.push(row);
        }
        Ok(rows)
    }
}

fn json_cell(value: &serde_json::Value) -> Result<Option<String>> {
    match value {
        serde_json::Value::Null => Ok(None),
        serde_json::Value::String(s) => Ok(Some(s.clone())),
        serde_json::Value::Number(n) => Ok(Some(n.to_string())),
        serde_json::Value::Bool(b) => Ok(Some(b.to_string())),
        other => Err(SyncError::Script(format!(
            "cannot map nested JSON value to a cell: {other}"
        ))),
    }
}

/// Parse a CSV body into an array of header-keyed objects so the same
/// row-mapping path serves both response types.
fn csv_to_json(bytes: &[u8]) -> std::result::Result<serde_json::Value, String> {
    let mut reader = csv::ReaderBuilder::new().from_reader(bytes);
    let headers = reader
        .headers()
        .map_err(|e| format!("invalid CSV header: {e}"))?
        .clone();

    let mut items = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| format!("invalid CSV record: {e}"))?;
        let mut object = serde_json::Map::new();
        for (header, field) in headers.iter().zip(record.iter()) {
            object.insert(
                header.to_string(),
                serde_json::Value::String(field.to_string()),
            );
        }
        items.push(serde_json::Value::Object(object));
    }
    Ok(serde_json::Value::Array(items))
}
