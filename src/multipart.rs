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

//! Large-file multipart uploads
//!
//! A large file is uploaded as a session: [`B2Client::start_large_file`]
//! opens it, parts are transmitted through per-part
//! [`UploadPartSlot`]s, and [`B2Client::finish_large_file`] commits the
//! ordered parts into a single file. A session ends exactly once, in
//! either commit or [`B2Client::cancel_large_file`]; every operation
//! after that fails with
//! [`Error::InvalidSessionState`](crate::Error::InvalidSessionState).
//!
//! [`LargeFileUpload`] layers a streaming writer on top of these
//! operations, buffering to a fixed part size and uploading parts
//! concurrently.

use bytes::Bytes;
use reqwest::header::AUTHORIZATION;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use snafu::{ensure, ResultExt};
use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};
use std::num::NonZeroU32;
use std::sync::Arc;
use tokio::task::JoinSet;

use crate::checksum::hex_sha1;
use crate::client::http::{HttpRequest, ProgressCallback};
use crate::client::{header_value, B2Client};
use crate::file::B2File;
use crate::headers::{FileMetadata, CONTENT_SHA1_HEADER, PART_NUMBER_HEADER};
use crate::{
    EmptyPartSnafu, InvalidPartSequenceSnafu, JoinSnafu, Result, AUTO_CONTENT_TYPE,
};

/// Default part size for [`LargeFileUpload`]
const DEFAULT_PART_SIZE: usize = 10 * 1024 * 1024;

/// Default number of parts [`LargeFileUpload`] transmits concurrently
const DEFAULT_CONCURRENCY: usize = 8;

/// An open large-file session, as returned by
/// [`B2Client::start_large_file`]
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LargeFileSession {
    /// Session id; identifies the file under assembly
    pub file_id: String,
    /// Logical name the committed file will have
    pub file_name: String,
    /// Bucket the file is assembled in
    #[serde(default)]
    pub bucket_id: Option<String>,
    /// MIME type recorded for the committed file
    #[serde(default)]
    pub content_type: Option<String>,
    /// Metadata recorded when the session was opened
    #[serde(default)]
    pub file_info: BTreeMap<String, String>,
}

/// An upload destination for a single part, issued by
/// [`B2Client::get_upload_part_url`]
///
/// Slots must not serve two uploads at the same time; concurrent part
/// uploads each acquire their own slot.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadPartSlot {
    /// Session this slot uploads into
    pub file_id: String,
    /// Destination URL
    pub upload_url: String,
    /// Token scoped to [`Self::upload_url`]
    pub authorization_token: String,
}

/// Parameters for [`B2Client::start_large_file`]
#[derive(Debug, Clone)]
pub struct StartLargeFile {
    /// Bucket to assemble the file in
    pub bucket_id: String,
    /// Logical file name
    pub file_name: String,
    /// MIME type; defaults to the `b2/x-auto` auto-detect sentinel
    pub content_type: Option<String>,
    /// Metadata recorded for the committed file
    pub file_info: FileMetadata,
}

impl StartLargeFile {
    /// Open a session for `file_name` in `bucket_id` with defaults for
    /// everything else
    pub fn new(bucket_id: impl Into<String>, file_name: impl Into<String>) -> Self {
        Self {
            bucket_id: bucket_id.into(),
            file_name: file_name.into(),
            content_type: None,
            file_info: FileMetadata::new(),
        }
    }
}

/// Proof that a part was uploaded and verified
///
/// [`B2Client::finish_large_file`] consumes the digests of all parts,
/// ordered by part number, as the commit manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartResult {
    /// 1-based position of the part within the file
    pub part_number: NonZeroU32,
    /// Hex SHA-1 of the part content, computed before transmission
    pub content_sha1: String,
}

/// Parameters for [`B2Client::list_parts`]
#[derive(Debug, Clone)]
pub struct ListParts {
    /// Session to list
    pub file_id: String,
    /// First part number to return
    pub start_part_number: Option<u32>,
    /// Maximum number of entries to return; defaults to 100
    pub max_part_count: Option<u32>,
}

impl ListParts {
    /// List the parts of `file_id` from the beginning
    pub fn new(file_id: impl Into<String>) -> Self {
        Self {
            file_id: file_id.into(),
            start_part_number: None,
            max_part_count: None,
        }
    }
}

/// A part the server has accepted, as reported by `b2_list_parts`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct B2Part {
    /// Session the part belongs to
    pub file_id: String,
    /// 1-based position of the part
    pub part_number: u32,
    /// Size in bytes
    #[serde(default)]
    pub content_length: Option<u64>,
    /// Hex SHA-1 of the part content
    #[serde(default)]
    pub content_sha1: Option<String>,
    /// Upload time in milliseconds since the epoch
    #[serde(default)]
    pub upload_timestamp: Option<u64>,
}

/// One page of parts
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartListing {
    /// Parts in this page, in part-number order
    pub parts: Vec<B2Part>,
    /// Pass as `start_part_number` to fetch the next page
    #[serde(default)]
    pub next_part_number: Option<u32>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StartLargeFileBody<'a> {
    bucket_id: &'a str,
    file_name: &'a str,
    content_type: &'a str,
    file_info: BTreeMap<&'a str, &'a str>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FileIdBody<'a> {
    file_id: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FinishLargeFileBody<'a> {
    file_id: &'a str,
    part_sha1_array: &'a [String],
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ListPartsBody<'a> {
    file_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    start_part_number: Option<u32>,
    max_part_count: u32,
}

impl B2Client {
    /// Open a large-file session
    pub async fn start_large_file(&self, request: StartLargeFile) -> Result<LargeFileSession> {
        let resource = format!("file {}", request.file_name);
        let body = StartLargeFileBody {
            bucket_id: &request.bucket_id,
            file_name: &request.file_name,
            content_type: request.content_type.as_deref().unwrap_or(AUTO_CONTENT_TYPE),
            file_info: request
                .file_info
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str()))
                .collect(),
        };
        self.post_api_request("b2_start_large_file", &body, &resource)
            .await
    }

    /// Obtain an [`UploadPartSlot`] for the session `file_id`
    pub async fn get_upload_part_url(&self, file_id: &str) -> Result<UploadPartSlot> {
        let resource = format!("file {file_id}");
        self.post_api_request("b2_get_upload_part_url", &FileIdBody { file_id }, &resource)
            .await
    }

    /// Upload one part of a large file
    ///
    /// Computes the SHA-1 of `data` before transmission and sends it as
    /// the integrity header; the server verifies the digest against the
    /// bytes it received and rejects the part on mismatch, leaving the
    /// session open for a retransmit under the same part number.
    pub async fn upload_part(
        &self,
        slot: &UploadPartSlot,
        part_number: NonZeroU32,
        data: Bytes,
        progress: Option<ProgressCallback>,
    ) -> Result<PartResult> {
        let resource = format!("part {} of file {}", part_number, slot.file_id);
        ensure!(
            !data.is_empty(),
            EmptyPartSnafu {
                part_number: part_number.get(),
            }
        );

        let content_sha1 = hex_sha1(&data);

        let mut request = HttpRequest::new(Method::POST, slot.upload_url.clone());
        let headers = &mut request.headers;
        headers.insert(
            AUTHORIZATION,
            header_value(&slot.authorization_token, "authorization", &resource)?,
        );
        headers.insert(
            PART_NUMBER_HEADER,
            header_value(&part_number.to_string(), PART_NUMBER_HEADER, &resource)?,
        );
        headers.insert(
            CONTENT_SHA1_HEADER,
            header_value(&content_sha1, CONTENT_SHA1_HEADER, &resource)?,
        );
        request.body = data;
        request.upload_progress = progress;

        self.send_checked(request, &resource).await?;
        Ok(PartResult {
            part_number,
            content_sha1,
        })
    }

    /// Commit a session into a single file
    ///
    /// `part_sha1_array` carries the digest of every uploaded part in
    /// part-number order. The server validates the manifest against the
    /// parts it holds and commits atomically; on any failure the session
    /// stays open.
    pub async fn finish_large_file(
        &self,
        file_id: &str,
        part_sha1_array: Vec<String>,
    ) -> Result<B2File> {
        let resource = format!("file {file_id}");
        let body = FinishLargeFileBody {
            file_id,
            part_sha1_array: &part_sha1_array,
        };
        self.post_api_request("b2_finish_large_file", &body, &resource)
            .await
    }

    /// Cancel a session, discarding its uploaded parts
    pub async fn cancel_large_file(&self, file_id: &str) -> Result<()> {
        let resource = format!("file {file_id}");
        let _: serde_json::Value = self
            .post_api_request("b2_cancel_large_file", &FileIdBody { file_id }, &resource)
            .await?;
        Ok(())
    }

    /// List the parts the server holds for a session, one page per call
    pub async fn list_parts(&self, request: ListParts) -> Result<PartListing> {
        let resource = format!("file {}", request.file_id);
        let body = ListPartsBody {
            file_id: &request.file_id,
            start_part_number: request.start_part_number,
            max_part_count: request.max_part_count.unwrap_or(100),
        };
        self.post_api_request("b2_list_parts", &body, &resource)
            .await
    }
}

/// Collects [`PartResult`]s from concurrent part uploads and assembles
/// the commit manifest
#[derive(Debug, Default)]
pub struct Parts(parking_lot::Mutex<Vec<PartResult>>);

impl Parts {
    /// Record the result of a completed part upload
    pub fn put(&self, part: PartResult) {
        self.0.lock().push(part)
    }

    /// Produce the manifest of part digests in part-number order
    ///
    /// Fails if the collected parts do not form the contiguous sequence
    /// `1..=expected`.
    pub fn finish(&self, expected: usize, file_id: &str) -> Result<Vec<String>> {
        let mut parts = std::mem::take(&mut *self.0.lock());
        ensure!(
            parts.len() == expected,
            InvalidPartSequenceSnafu {
                resource: format!("file {file_id}"),
                message: format!("expected {expected} parts, got {}", parts.len()),
            }
        );
        parts.sort_unstable_by_key(|p| p.part_number);
        for (index, part) in parts.iter().enumerate() {
            ensure!(
                part.part_number.get() as usize == index + 1,
                InvalidPartSequenceSnafu {
                    resource: format!("file {file_id}"),
                    message: format!("part {} missing or duplicated", index + 1),
                }
            );
        }
        Ok(parts.into_iter().map(|p| p.content_sha1).collect())
    }
}

/// Streaming writer uploading a large file in concurrently transmitted
/// parts
///
/// Data written through [`Self::write`] is buffered to a fixed part
/// size; each full part is uploaded in a background task through its
/// own [`UploadPartSlot`]. [`Self::finish`] flushes the remainder,
/// waits for all parts and commits the session; [`Self::abort`]
/// cancels it.
pub struct LargeFileUpload {
    client: Arc<B2Client>,
    session: LargeFileSession,
    parts: Arc<Parts>,
    tasks: JoinSet<Result<()>>,
    buffer: Vec<u8>,
    part_size: usize,
    max_concurrency: usize,
    next_part_number: NonZeroU32,
    progress: Option<ProgressCallback>,
}

impl Debug for LargeFileUpload {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LargeFileUpload")
            .field("session", &self.session)
            .field("buffered", &self.buffer.len())
            .field("part_size", &self.part_size)
            .field("in_flight", &self.tasks.len())
            .field("next_part_number", &self.next_part_number)
            .finish()
    }
}

impl LargeFileUpload {
    /// Open a session and wrap it in a writer with default part size
    /// and concurrency
    pub async fn begin(client: Arc<B2Client>, request: StartLargeFile) -> Result<Self> {
        let session = client.start_large_file(request).await?;
        Ok(Self::new(client, session))
    }

    /// Wrap an already open session
    pub fn new(client: Arc<B2Client>, session: LargeFileSession) -> Self {
        Self {
            client,
            session,
            parts: Arc::new(Parts::default()),
            tasks: JoinSet::new(),
            buffer: Vec::new(),
            part_size: DEFAULT_PART_SIZE,
            max_concurrency: DEFAULT_CONCURRENCY,
            next_part_number: NonZeroU32::MIN,
            progress: None,
        }
    }

    /// Override the part size
    ///
    /// All parts except the last will have exactly this size. B2
    /// requires at least 5 MB for all parts but the last.
    pub fn with_part_size(mut self, part_size: usize) -> Self {
        self.part_size = part_size;
        self
    }

    /// Override the number of parts transmitted concurrently
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    /// Observe per-part transmission progress
    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = Some(progress);
        self
    }

    /// The session this writer uploads into
    pub fn session(&self) -> &LargeFileSession {
        &self.session
    }

    /// Buffer `data`, spawning a part upload whenever a full part is
    /// accumulated
    ///
    /// Applies back pressure: returns only once the number of in-flight
    /// parts is below the concurrency limit. Fails eagerly if an
    /// already spawned part upload has failed.
    pub async fn write(&mut self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            let take = (self.part_size - self.buffer.len()).min(data.len());
            self.buffer.extend_from_slice(&data[..take]);
            data = &data[take..];

            if self.buffer.len() == self.part_size {
                self.wait_for_capacity(self.max_concurrency - 1).await?;
                let part = Bytes::from(std::mem::take(&mut self.buffer));
                self.spawn_part(part);
            }
        }
        Ok(())
    }

    /// Wait until at most `max_concurrency` part uploads are in flight
    pub async fn wait_for_capacity(&mut self, max_concurrency: usize) -> Result<()> {
        while self.tasks.len() > max_concurrency {
            if let Some(joined) = self.tasks.join_next().await {
                joined.context(JoinSnafu)??;
            }
        }
        Ok(())
    }

    fn spawn_part(&mut self, data: Bytes) {
        let part_number = self.next_part_number;
        self.next_part_number = part_number.saturating_add(1);

        let client = Arc::clone(&self.client);
        let file_id = self.session.file_id.clone();
        let parts = Arc::clone(&self.parts);
        let progress = self.progress.clone();
        self.tasks.spawn(async move {
            let slot = client.get_upload_part_url(&file_id).await?;
            let part = client.upload_part(&slot, part_number, data, progress).await?;
            parts.put(part);
            Ok(())
        });
    }

    /// Flush the remaining buffer, wait for all parts and commit the
    /// session
    pub async fn finish(mut self) -> Result<B2File> {
        if !self.buffer.is_empty() {
            let part = Bytes::from(std::mem::take(&mut self.buffer));
            self.spawn_part(part);
        }
        self.wait_for_capacity(0).await?;

        let expected = (self.next_part_number.get() - 1) as usize;
        let manifest = self.parts.finish(expected, &self.session.file_id)?;
        self.client
            .finish_large_file(&self.session.file_id, manifest)
            .await
    }

    /// Abandon in-flight parts and cancel the session
    pub async fn abort(mut self) -> Result<()> {
        self.tasks.shutdown().await;
        self.client.cancel_large_file(&self.session.file_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{ok_json, recorded_client};
    use crate::Error;
    use serde_json::json;

    fn part_number(n: u32) -> NonZeroU32 {
        NonZeroU32::new(n).unwrap()
    }

    fn part(n: u32, sha: &str) -> PartResult {
        PartResult {
            part_number: part_number(n),
            content_sha1: sha.to_string(),
        }
    }

    #[tokio::test]
    async fn upload_part_sends_part_headers() {
        let (client, recorder) = recorded_client(vec![ok_json(json!({}))]);
        let slot = UploadPartSlot {
            file_id: "f-large".to_string(),
            upload_url: "https://pod.example/part/f-large".to_string(),
            authorization_token: "part-token".to_string(),
        };

        let result = client
            .upload_part(&slot, part_number(3), Bytes::from_static(b"hello world"), None)
            .await
            .unwrap();
        assert_eq!(result.part_number.get(), 3);
        assert_eq!(
            result.content_sha1,
            "2aae6c35c94fcfb415dbe95f408b9ce91ee846ed"
        );

        let requests = recorder.take();
        assert_eq!(requests.len(), 1);
        let sent = &requests[0];
        assert_eq!(sent.url, "https://pod.example/part/f-large");
        assert_eq!(sent.headers[AUTHORIZATION], "part-token");
        assert_eq!(sent.headers[PART_NUMBER_HEADER], "3");
        assert_eq!(
            sent.headers[CONTENT_SHA1_HEADER],
            "2aae6c35c94fcfb415dbe95f408b9ce91ee846ed"
        );
        assert_eq!(sent.body, &b"hello world"[..]);
    }

    #[tokio::test]
    async fn empty_parts_are_rejected_before_transmission() {
        let (client, recorder) = recorded_client(vec![]);
        let slot = UploadPartSlot {
            file_id: "f-large".to_string(),
            upload_url: "https://pod.example/part/f-large".to_string(),
            authorization_token: "part-token".to_string(),
        };

        let err = client
            .upload_part(&slot, part_number(1), Bytes::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::EmptyPart { part_number: 1 }), "{err}");
        assert!(recorder.take().is_empty());
    }

    #[tokio::test]
    async fn start_large_file_defaults_to_auto_content_type() {
        let (client, recorder) = recorded_client(vec![ok_json(json!({
            "fileId": "f-large",
            "fileName": "big.bin",
            "bucketId": "b1",
        }))]);

        let mut request = StartLargeFile::new("b1", "big.bin");
        request.file_info.insert("Color", "blue").unwrap();
        let session = client.start_large_file(request).await.unwrap();
        assert_eq!(session.file_id, "f-large");

        let requests = recorder.take();
        let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert_eq!(
            body,
            json!({
                "bucketId": "b1",
                "fileName": "big.bin",
                "contentType": "b2/x-auto",
                "fileInfo": {"Color": "blue"},
            })
        );
    }

    #[tokio::test]
    async fn finish_large_file_sends_ordered_manifest() {
        let (client, recorder) = recorded_client(vec![ok_json(json!({
            "fileId": "f-large",
            "fileName": "big.bin",
        }))]);

        client
            .finish_large_file("f-large", vec!["sha-1".to_string(), "sha-2".to_string()])
            .await
            .unwrap();

        let requests = recorder.take();
        assert_eq!(
            requests[0].url,
            "https://api.mock/b2api/v2/b2_finish_large_file"
        );
        let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert_eq!(
            body,
            json!({"fileId": "f-large", "partSha1Array": ["sha-1", "sha-2"]})
        );
    }

    #[test]
    fn parts_manifest_is_ordered_by_part_number() {
        let parts = Parts::default();
        parts.put(part(2, "sha-2"));
        parts.put(part(1, "sha-1"));
        parts.put(part(3, "sha-3"));

        let manifest = parts.finish(3, "f-large").unwrap();
        assert_eq!(manifest, vec!["sha-1", "sha-2", "sha-3"]);
    }

    #[test]
    fn parts_manifest_rejects_gaps_and_wrong_counts() {
        let parts = Parts::default();
        parts.put(part(1, "sha-1"));
        parts.put(part(3, "sha-3"));
        let err = parts.finish(2, "f-large").unwrap_err();
        assert!(matches!(err, Error::InvalidPartSequence { .. }), "{err}");

        let parts = Parts::default();
        parts.put(part(1, "sha-1"));
        let err = parts.finish(2, "f-large").unwrap_err();
        assert!(matches!(err, Error::InvalidPartSequence { .. }), "{err}");
    }
}
