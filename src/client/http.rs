// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

//! Generic HTTP transport underpinning the B2 operations
//!
//! Every operation in this crate reduces to a single [`HttpRequest`]
//! dispatched through an [`HttpService`]. The production implementation
//! is [`ReqwestService`]; tests substitute in-memory services.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use reqwest::header::{HeaderMap, CONTENT_LENGTH};
use reqwest::{Method, StatusCode};
use snafu::{ResultExt, Snafu};
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

/// Observer for transfer progress, invoked with
/// `(bytes_so_far, total_bytes)`
///
/// `total_bytes` is `0` when the total is unknown. Progress observation
/// never affects completion semantics.
pub type ProgressCallback = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// A transport-level failure
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum HttpError {
    #[snafu(display("Error sending request to {}: {}", url, source))]
    Send { url: String, source: reqwest::Error },

    #[snafu(display("Error reading response body from {}: {}", url, source))]
    ReceiveBody { url: String, source: reqwest::Error },
}

/// A single HTTP request description: method, URL, headers, body and
/// optional progress observers
pub struct HttpRequest {
    /// Request method
    pub method: Method,
    /// Absolute request URL
    pub url: String,
    /// Request headers, including authorization
    pub headers: HeaderMap,
    /// Request body, empty for GET requests
    pub body: Bytes,
    /// Invoked with cumulative bytes transmitted while sending the body
    pub upload_progress: Option<ProgressCallback>,
    /// Invoked with cumulative bytes received while reading the response
    pub download_progress: Option<ProgressCallback>,
}

impl HttpRequest {
    /// Create a request with no headers, body or progress observers
    pub fn new(method: Method, url: String) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            upload_progress: None,
            download_progress: None,
        }
    }
}

impl Debug for HttpRequest {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpRequest")
            .field("method", &self.method)
            .field("url", &self.url)
            .field("headers", &self.headers)
            .field("body_len", &self.body.len())
            .finish()
    }
}

/// An HTTP response: status, headers and collected body
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// Response status
    pub status: StatusCode,
    /// Response headers
    pub headers: HeaderMap,
    /// Collected response body
    pub body: Bytes,
}

/// Performs a single HTTP round trip
///
/// Implementations perform no retries; transient failures surface as
/// [`HttpError`] and retry policy belongs to the caller.
#[async_trait]
pub trait HttpService: Send + Sync + Debug + 'static {
    /// Dispatch `request`, returning the response or a transport error
    ///
    /// Any response with a status code is returned as `Ok`, including
    /// server errors; `Err` is reserved for failures to complete the
    /// round trip
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, HttpError>;
}

/// [`HttpService`] backed by a [`reqwest::Client`]
#[derive(Debug, Clone, Default)]
pub struct ReqwestService {
    client: reqwest::Client,
}

impl ReqwestService {
    /// Create a service from an existing [`reqwest::Client`]
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

/// Granularity at which upload progress is reported
const PROGRESS_CHUNK_SIZE: usize = 64 * 1024;

/// Splits `body` into chunks, invoking `progress` with the cumulative
/// byte count as each chunk is yielded to the connection
fn progress_chunks(
    body: Bytes,
    progress: ProgressCallback,
) -> impl futures::Stream<Item = Result<Bytes, HttpError>> + Send {
    let total = body.len() as u64;
    let mut chunks = Vec::with_capacity(body.len() / PROGRESS_CHUNK_SIZE + 1);
    let mut offset = 0;
    while offset < body.len() {
        let end = (offset + PROGRESS_CHUNK_SIZE).min(body.len());
        chunks.push((body.slice(offset..end), end as u64));
        offset = end;
    }

    futures::stream::iter(chunks.into_iter().map(move |(chunk, sent)| {
        progress(sent, total);
        Ok(chunk)
    }))
}

fn observed_body(body: Bytes, progress: ProgressCallback) -> reqwest::Body {
    reqwest::Body::wrap_stream(progress_chunks(body, progress))
}

#[async_trait]
impl HttpService for ReqwestService {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, HttpError> {
        let HttpRequest {
            method,
            url,
            headers,
            body,
            upload_progress,
            download_progress,
        } = request;

        let mut builder = self
            .client
            .request(method, &url)
            .headers(headers)
            .header(CONTENT_LENGTH, body.len());

        builder = match upload_progress {
            Some(progress) if !body.is_empty() => builder.body(observed_body(body, progress)),
            _ => builder.body(body),
        };

        let response = builder
            .send()
            .await
            .context(SendSnafu { url: url.as_str() })?;

        let status = response.status();
        let response_headers = response.headers().clone();

        let body = match download_progress {
            Some(progress) => {
                let total = response.content_length().unwrap_or_default();
                let mut collected = Vec::with_capacity(total as usize);
                let mut stream = response.bytes_stream();
                while let Some(chunk) = stream.next().await {
                    let chunk = chunk.context(ReceiveBodySnafu { url: url.as_str() })?;
                    collected.extend_from_slice(&chunk);
                    progress(collected.len() as u64, total);
                }
                collected.into()
            }
            None => response
                .bytes()
                .await
                .context(ReceiveBodySnafu { url: url.as_str() })?,
        };

        Ok(HttpResponse {
            status,
            headers: response_headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    #[tokio::test]
    async fn progress_chunks_reports_cumulative_progress() {
        let reported = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let observer = Arc::clone(&reported);
        let progress: ProgressCallback = Arc::new(move |sent, total| {
            observer.lock().push((sent, total));
        });

        let data = Bytes::from(vec![7_u8; 2 * PROGRESS_CHUNK_SIZE + 10]);
        let total = data.len() as u64;

        let chunks: Vec<_> = progress_chunks(data.clone(), progress)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(chunks.concat(), data);

        let reported = reported.lock();
        assert_eq!(
            *reported,
            vec![
                (PROGRESS_CHUNK_SIZE as u64, total),
                (2 * PROGRESS_CHUNK_SIZE as u64, total),
                (total, total),
            ]
        );
    }

    #[tokio::test]
    async fn progress_chunks_of_empty_body_is_empty() {
        let progress: ProgressCallback = Arc::new(|_, _| panic!("no progress expected"));
        let chunks: Vec<_> = progress_chunks(Bytes::new(), progress)
            .try_collect()
            .await
            .unwrap();
        assert!(chunks.is_empty());
    }
}
