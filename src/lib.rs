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

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::future_not_send,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

//! An async client for the Backblaze B2 native API
//!
//! The client covers the file operations of the v2 API: single-shot
//! uploads, large-file multipart uploads, listing, download, hide and
//! delete. Authentication (`b2_authorize_account`) is out of scope;
//! callers obtain a [`B2Credential`] elsewhere and thread it through a
//! [`CredentialProvider`].
//!
//! Every uploaded payload is hashed with SHA-1 before transmission and
//! the digest travels with the bytes, so the server can verify the
//! content it received. Large files are uploaded as sessions: start,
//! upload parts (concurrently, each through its own slot), then finish
//! with the ordered digest manifest or cancel. [`LargeFileUpload`]
//! wraps that lifecycle behind a streaming writer:
//!
//! ```no_run
//! # async fn example() -> b2_client::Result<()> {
//! use std::sync::Arc;
//! use b2_client::{
//!     B2Client, B2Credential, LargeFileUpload, StartLargeFile, StaticCredentialProvider,
//! };
//!
//! let credential = B2Credential {
//!     authorization_token: "token".to_string(),
//!     api_url: "https://api001.backblazeb2.com".to_string(),
//!     download_url: "https://f001.backblazeb2.com".to_string(),
//! };
//! let client = Arc::new(B2Client::new(Arc::new(StaticCredentialProvider::new(
//!     credential,
//! ))));
//!
//! let mut upload =
//!     LargeFileUpload::begin(client, StartLargeFile::new("bucket-id", "big.bin")).await?;
//! upload.write(&[0u8; 1024]).await?;
//! let file = upload.finish().await?;
//! # Ok(())
//! # }
//! ```

use snafu::Snafu;

mod checksum;
pub mod client;
pub mod credential;
pub mod file;
mod headers;
pub mod multipart;

pub use checksum::hex_sha1;
pub use client::http::{
    HttpError, HttpRequest, HttpResponse, HttpService, ProgressCallback, ReqwestService,
};
pub use client::B2Client;
pub use credential::{
    B2Credential, B2CredentialProvider, CredentialProvider, StaticCredentialProvider,
};
pub use file::{
    B2File, FileNameListing, FileVersionListing, ListFileNames, ListFileVersions, UploadFile,
    UploadSlot,
};
pub use headers::FileMetadata;
pub use multipart::{
    B2Part, LargeFileSession, LargeFileUpload, ListParts, PartListing, PartResult, Parts,
    StartLargeFile, UploadPartSlot,
};

/// Content-type sentinel instructing the server to detect the MIME type
/// from the file name and content
pub const AUTO_CONTENT_TYPE: &str = "b2/x-auto";

/// Error type for this crate
///
/// API failures are classified by the `code` field of the B2 error
/// body; combinations with no classification surface as
/// [`Error::Unexpected`] so no server response is silently discarded.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[allow(missing_docs)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("Authorization failed for {}: {}", resource, message))]
    Auth { resource: String, message: String },

    #[snafu(display("Authorization token expired for {}: {}", resource, message))]
    ExpiredToken { resource: String, message: String },

    #[snafu(display("Not found: {}: {}", resource, message))]
    NotFound { resource: String, message: String },

    #[snafu(display("Integrity verification failed for {}: {}", resource, message))]
    IntegrityMismatch { resource: String, message: String },

    #[snafu(display("Invalid part sequence for {}: {}", resource, message))]
    InvalidPartSequence { resource: String, message: String },

    #[snafu(display("Invalid part count for {}: {}", resource, message))]
    PartCount { resource: String, message: String },

    #[snafu(display("Session is no longer open for {}: {}", resource, message))]
    InvalidSessionState { resource: String, message: String },

    #[snafu(display("Request for {} failed: {}", resource, source))]
    Network { resource: String, source: HttpError },

    #[snafu(display("Part {} is empty, parts must contain at least one byte", part_number))]
    EmptyPart { part_number: u32 },

    #[snafu(display("Invalid metadata key {}: {}", key, reason))]
    InvalidMetadata { key: String, reason: String },

    #[snafu(display("Error serializing request for {}: {}", resource, source))]
    Encode {
        resource: String,
        source: serde_json::Error,
    },

    #[snafu(display("Error decoding response for {}: {}", resource, source))]
    InvalidResponse {
        resource: String,
        source: serde_json::Error,
    },

    #[snafu(display("Unexpected response for {} (status {}, code {}): {}", resource, status, code, message))]
    Unexpected {
        resource: String,
        status: u16,
        code: String,
        message: String,
    },

    #[snafu(display("Upload task failed to complete: {}", source))]
    Join { source: tokio::task::JoinError },
}

/// A specialized `Result` for this crate
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
pub(crate) mod test_util {
    use async_trait::async_trait;
    use bytes::Bytes;
    use reqwest::header::HeaderMap;
    use reqwest::StatusCode;
    use std::collections::VecDeque;
    use std::sync::Arc;

    use crate::client::http::{HttpError, HttpRequest, HttpResponse, HttpService};
    use crate::credential::{B2Credential, StaticCredentialProvider};
    use crate::B2Client;

    /// Captures the requests a [`RecordingService`] dispatched
    #[derive(Debug, Default)]
    pub(crate) struct Recorder {
        requests: parking_lot::Mutex<Vec<HttpRequest>>,
    }

    impl Recorder {
        pub(crate) fn take(&self) -> Vec<HttpRequest> {
            std::mem::take(&mut *self.requests.lock())
        }
    }

    /// [`HttpService`] that records every request and replays canned
    /// responses in order
    #[derive(Debug)]
    struct RecordingService {
        recorder: Arc<Recorder>,
        responses: parking_lot::Mutex<VecDeque<HttpResponse>>,
    }

    #[async_trait]
    impl HttpService for RecordingService {
        async fn send(&self, request: HttpRequest) -> Result<HttpResponse, HttpError> {
            self.recorder.requests.lock().push(request);
            Ok(self
                .responses
                .lock()
                .pop_front()
                .unwrap_or_else(|| ok_bytes(b"")))
        }
    }

    pub(crate) fn ok_json(body: serde_json::Value) -> HttpResponse {
        HttpResponse {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Bytes::from(serde_json::to_vec(&body).unwrap()),
        }
    }

    pub(crate) fn ok_bytes(body: &[u8]) -> HttpResponse {
        HttpResponse {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Bytes::copy_from_slice(body),
        }
    }

    /// A client wired to a fixed test credential and a recording
    /// transport replaying `responses`
    pub(crate) fn recorded_client(responses: Vec<HttpResponse>) -> (B2Client, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let service = RecordingService {
            recorder: Arc::clone(&recorder),
            responses: parking_lot::Mutex::new(responses.into()),
        };
        let credential = B2Credential {
            authorization_token: "account-token".to_string(),
            api_url: "https://api.mock".to_string(),
            download_url: "https://dl.mock".to_string(),
        };
        let client = B2Client::with_http(
            Arc::new(StaticCredentialProvider::new(credential)),
            Arc::new(service),
        );
        (client, recorder)
    }
}
