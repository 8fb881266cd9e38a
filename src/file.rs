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

//! File operations: single-shot upload, listing, download, hide and
//! delete
//!
//! Single-shot upload shares the hashing/integrity contract with part
//! uploads (compute the SHA-1 before transmission, send it as an
//! integrity header) but bypasses the large-file session lifecycle
//! entirely.

use bytes::Bytes;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};

use crate::checksum::hex_sha1;
use crate::client::http::{HttpRequest, ProgressCallback};
use crate::client::{decode_response, header_value, B2Client, API_VERSION_PATH};
use crate::headers::{FileMetadata, CONTENT_SHA1_HEADER, FILE_NAME_HEADER};
use crate::{Result, AUTO_CONTENT_TYPE};

/// Percent-encoding set for B2 file names: encode everything except
/// unreserved characters, keeping `/` as the segment separator
const FILE_NAME_ESCAPED: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'/')
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Returns the URL-safe encoding of a logical file name
pub(crate) fn url_encode_file_name(name: &str) -> String {
    utf8_percent_encode(name, FILE_NAME_ESCAPED).to_string()
}

/// A descriptor of a file version as reported by B2
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct B2File {
    /// Unique file version id; absent for folder placeholders in
    /// delimiter listings
    #[serde(default)]
    pub file_id: Option<String>,
    /// Logical file name
    pub file_name: String,
    /// Owning bucket
    #[serde(default)]
    pub bucket_id: Option<String>,
    /// Size in bytes
    #[serde(default)]
    pub content_length: Option<u64>,
    /// Hex SHA-1 of the content; `"none"` for large files
    #[serde(default)]
    pub content_sha1: Option<String>,
    /// MIME type
    #[serde(default)]
    pub content_type: Option<String>,
    /// Caller-supplied metadata recorded at upload time
    #[serde(default)]
    pub file_info: BTreeMap<String, String>,
    /// `"upload"`, `"hide"`, `"start"` or `"folder"`
    #[serde(default)]
    pub action: Option<String>,
    /// Upload time in milliseconds since the epoch
    #[serde(default)]
    pub upload_timestamp: Option<u64>,
}

/// An upload destination for single-shot uploads, issued by
/// `b2_get_upload_url`
///
/// The slot may be reused for consecutive uploads, but must not serve
/// two uploads at the same time.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSlot {
    /// Bucket this slot uploads into
    pub bucket_id: String,
    /// Destination URL
    pub upload_url: String,
    /// Token scoped to [`Self::upload_url`]
    pub authorization_token: String,
}

/// Parameters for [`B2Client::upload_file`]
pub struct UploadFile {
    /// Logical file name; URL-safe encoded before transmission
    pub file_name: String,
    /// File content
    pub data: Bytes,
    /// MIME type; defaults to the `b2/x-auto` auto-detect sentinel
    pub content_type: Option<String>,
    /// Caller-supplied metadata, transmitted as `X-Bz-Info-*` headers
    pub file_info: FileMetadata,
    /// Invoked with cumulative bytes transmitted
    pub progress: Option<ProgressCallback>,
}

impl UploadFile {
    /// Create an upload of `data` under `file_name` with defaults for
    /// everything else
    pub fn new(file_name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            file_name: file_name.into(),
            data: data.into(),
            content_type: None,
            file_info: FileMetadata::new(),
            progress: None,
        }
    }
}

impl Debug for UploadFile {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadFile")
            .field("file_name", &self.file_name)
            .field("data_len", &self.data.len())
            .field("content_type", &self.content_type)
            .field("file_info", &self.file_info)
            .finish()
    }
}

/// Parameters for [`B2Client::list_file_names`]
#[derive(Debug, Clone)]
pub struct ListFileNames {
    /// Bucket to list
    pub bucket_id: String,
    /// First file name to return; empty starts from the beginning
    pub start_file_name: Option<String>,
    /// Maximum number of entries to return; defaults to 100
    pub max_file_count: Option<u32>,
    /// Restrict the listing to names with this prefix
    pub prefix: Option<String>,
    /// Collapse names below this delimiter into folder placeholders
    pub delimiter: Option<String>,
}

impl ListFileNames {
    /// List `bucket_id` from the beginning with the server defaults
    pub fn new(bucket_id: impl Into<String>) -> Self {
        Self {
            bucket_id: bucket_id.into(),
            start_file_name: None,
            max_file_count: None,
            prefix: None,
            delimiter: None,
        }
    }
}

/// One page of file names, with the cursor for the next page
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileNameListing {
    /// Files in this page
    pub files: Vec<B2File>,
    /// Pass as `start_file_name` to fetch the next page; `None` when
    /// the listing is exhausted
    #[serde(default)]
    pub next_file_name: Option<String>,
}

/// Parameters for [`B2Client::list_file_versions`]
#[derive(Debug, Clone)]
pub struct ListFileVersions {
    /// Bucket to list
    pub bucket_id: String,
    /// First file name to return
    pub start_file_name: Option<String>,
    /// Maximum number of entries to return; defaults to 100
    pub max_file_count: Option<u32>,
}

impl ListFileVersions {
    /// List versions in `bucket_id` from the beginning
    pub fn new(bucket_id: impl Into<String>) -> Self {
        Self {
            bucket_id: bucket_id.into(),
            start_file_name: None,
            max_file_count: None,
        }
    }
}

/// One page of file versions
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileVersionListing {
    /// File versions in this page
    pub files: Vec<B2File>,
    /// Name cursor for the next page
    #[serde(default)]
    pub next_file_name: Option<String>,
    /// Id cursor for the next page
    #[serde(default)]
    pub next_file_id: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ListFileNamesBody<'a> {
    bucket_id: &'a str,
    start_file_name: &'a str,
    max_file_count: u32,
    prefix: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    delimiter: Option<&'a str>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ListFileVersionsBody<'a> {
    bucket_id: &'a str,
    start_file_name: &'a str,
    max_file_count: u32,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BucketIdBody<'a> {
    bucket_id: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FileIdBody<'a> {
    file_id: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BucketFileNameBody<'a> {
    bucket_id: &'a str,
    file_name: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FileIdNameBody<'a> {
    file_id: &'a str,
    file_name: &'a str,
}

impl B2Client {
    /// Obtain an [`UploadSlot`] for single-shot uploads into `bucket_id`
    pub async fn get_upload_url(&self, bucket_id: &str) -> Result<UploadSlot> {
        let resource = format!("bucket {bucket_id}");
        self.post_api_request(
            "b2_get_upload_url",
            &BucketIdBody { bucket_id },
            &resource,
        )
        .await
    }

    /// Upload a complete file in one request
    ///
    /// Computes the SHA-1 of `request.data` before transmission and
    /// sends it as the integrity header; the server independently
    /// verifies the digest against the bytes it received.
    pub async fn upload_file(&self, slot: &UploadSlot, request: UploadFile) -> Result<B2File> {
        let UploadFile {
            file_name,
            data,
            content_type,
            file_info,
            progress,
        } = request;
        let resource = format!("file {file_name}");

        let content_sha1 = hex_sha1(&data);
        let content_type = content_type.as_deref().unwrap_or(AUTO_CONTENT_TYPE);
        let encoded_name = url_encode_file_name(&file_name);

        let mut http_request = HttpRequest::new(Method::POST, slot.upload_url.clone());
        let headers = &mut http_request.headers;
        headers.insert(
            AUTHORIZATION,
            header_value(&slot.authorization_token, "authorization", &resource)?,
        );
        headers.insert(
            CONTENT_TYPE,
            header_value(content_type, "content type", &resource)?,
        );
        headers.insert(
            FILE_NAME_HEADER,
            header_value(&encoded_name, FILE_NAME_HEADER, &resource)?,
        );
        headers.insert(
            CONTENT_SHA1_HEADER,
            header_value(&content_sha1, CONTENT_SHA1_HEADER, &resource)?,
        );
        file_info.apply(headers)?;

        http_request.body = data;
        http_request.upload_progress = progress;

        let response = self.send_checked(http_request, &resource).await?;
        decode_response(response, &resource)
    }

    /// List file names in a bucket, one page per call
    pub async fn list_file_names(&self, request: ListFileNames) -> Result<FileNameListing> {
        let resource = format!("bucket {}", request.bucket_id);
        let body = ListFileNamesBody {
            bucket_id: &request.bucket_id,
            start_file_name: request.start_file_name.as_deref().unwrap_or(""),
            max_file_count: request.max_file_count.unwrap_or(100),
            prefix: request.prefix.as_deref().unwrap_or(""),
            delimiter: request.delimiter.as_deref(),
        };
        self.post_api_request("b2_list_file_names", &body, &resource)
            .await
    }

    /// List file versions in a bucket, one page per call
    pub async fn list_file_versions(
        &self,
        request: ListFileVersions,
    ) -> Result<FileVersionListing> {
        let resource = format!("bucket {}", request.bucket_id);
        let body = ListFileVersionsBody {
            bucket_id: &request.bucket_id,
            start_file_name: request.start_file_name.as_deref().unwrap_or(""),
            max_file_count: request.max_file_count.unwrap_or(100),
        };
        self.post_api_request("b2_list_file_versions", &body, &resource)
            .await
    }

    /// Hide a file so it does not show up in name listings
    pub async fn hide_file(&self, bucket_id: &str, file_name: &str) -> Result<B2File> {
        let resource = format!("file {file_name}");
        self.post_api_request(
            "b2_hide_file",
            &BucketFileNameBody {
                bucket_id,
                file_name,
            },
            &resource,
        )
        .await
    }

    /// Fetch the descriptor of a file version by id
    pub async fn get_file_info(&self, file_id: &str) -> Result<B2File> {
        let resource = format!("file {file_id}");
        self.post_api_request("b2_get_file_info", &FileIdBody { file_id }, &resource)
            .await
    }

    /// Delete a specific file version
    pub async fn delete_file_version(&self, file_id: &str, file_name: &str) -> Result<()> {
        let resource = format!("file {file_id}");
        let _: serde_json::Value = self
            .post_api_request(
                "b2_delete_file_version",
                &FileIdNameBody { file_id, file_name },
                &resource,
            )
            .await?;
        Ok(())
    }

    /// Download the newest version of a file by bucket and name
    pub async fn download_file_by_name(
        &self,
        bucket_name: &str,
        file_name: &str,
        progress: Option<ProgressCallback>,
    ) -> Result<Bytes> {
        let resource = format!("file {file_name}");
        let credential = self.get_credential().await?;
        let url = format!(
            "{}/file/{}/{}",
            credential.download_url,
            bucket_name,
            url_encode_file_name(file_name)
        );

        let mut request = HttpRequest::new(Method::GET, url);
        request.headers.insert(
            AUTHORIZATION,
            header_value(&credential.authorization_token, "authorization", &resource)?,
        );
        request.download_progress = progress;

        let response = self.send_checked(request, &resource).await?;
        Ok(response.body)
    }

    /// Download a specific file version by id
    pub async fn download_file_by_id(
        &self,
        file_id: &str,
        progress: Option<ProgressCallback>,
    ) -> Result<Bytes> {
        let resource = format!("file {file_id}");
        let credential = self.get_credential().await?;
        let url = format!(
            "{}{}/b2_download_file_by_id?fileId={}",
            credential.download_url, API_VERSION_PATH, file_id
        );

        let mut request = HttpRequest::new(Method::GET, url);
        request.headers.insert(
            AUTHORIZATION,
            header_value(&credential.authorization_token, "authorization", &resource)?,
        );
        request.download_progress = progress;

        let response = self.send_checked(request, &resource).await?;
        Ok(response.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{recorded_client, ok_json};
    use serde_json::json;

    #[test]
    fn file_names_are_url_safe_encoded() {
        assert_eq!(
            url_encode_file_name("photos/2021/spring time.jpg"),
            "photos/2021/spring%20time.jpg"
        );
        assert_eq!(url_encode_file_name("a+b=c.txt"), "a%2Bb%3Dc.txt");
        assert_eq!(url_encode_file_name("über/straße"), "%C3%BCber/stra%C3%9Fe");
        assert_eq!(url_encode_file_name("plain-name_1.0~x"), "plain-name_1.0~x");
    }

    #[tokio::test]
    async fn upload_file_sends_integrity_headers() {
        let (client, recorder) = recorded_client(vec![ok_json(json!({
            "fileId": "f-1",
            "fileName": "movie.mp4",
            "contentLength": 11,
            "contentSha1": "2aae6c35c94fcfb415dbe95f408b9ce91ee846ed",
        }))]);

        let slot = UploadSlot {
            bucket_id: "b1".to_string(),
            upload_url: "https://pod.example/upload/b1".to_string(),
            authorization_token: "slot-token".to_string(),
        };

        let mut request = UploadFile::new("dir/movie file.mp4", &b"hello world"[..]);
        request.file_info.insert("Color", "blue").unwrap();
        let uploaded = client.upload_file(&slot, request).await.unwrap();
        assert_eq!(uploaded.file_id.as_deref(), Some("f-1"));

        let requests = recorder.take();
        assert_eq!(requests.len(), 1);
        let sent = &requests[0];
        assert_eq!(sent.method, Method::POST);
        assert_eq!(sent.url, "https://pod.example/upload/b1");
        assert_eq!(sent.headers[AUTHORIZATION], "slot-token");
        assert_eq!(sent.headers[CONTENT_TYPE], "b2/x-auto");
        assert_eq!(sent.headers[FILE_NAME_HEADER], "dir/movie%20file.mp4");
        assert_eq!(
            sent.headers[CONTENT_SHA1_HEADER],
            "2aae6c35c94fcfb415dbe95f408b9ce91ee846ed"
        );
        assert_eq!(sent.headers["x-bz-info-color"], "blue");
        assert_eq!(sent.body, &b"hello world"[..]);
    }

    #[tokio::test]
    async fn list_file_names_applies_defaults() {
        let (client, recorder) = recorded_client(vec![ok_json(json!({
            "files": [],
            "nextFileName": null,
        }))]);

        let listing = client
            .list_file_names(ListFileNames::new("b1"))
            .await
            .unwrap();
        assert!(listing.files.is_empty());
        assert!(listing.next_file_name.is_none());

        let requests = recorder.take();
        let sent = &requests[0];
        assert_eq!(
            sent.url,
            "https://api.mock/b2api/v2/b2_list_file_names"
        );
        assert_eq!(sent.headers[AUTHORIZATION], "account-token");
        let body: serde_json::Value = serde_json::from_slice(&sent.body).unwrap();
        assert_eq!(
            body,
            json!({
                "bucketId": "b1",
                "startFileName": "",
                "maxFileCount": 100,
                "prefix": "",
            })
        );
    }

    #[tokio::test]
    async fn download_by_name_targets_download_url() {
        let (client, recorder) = recorded_client(vec![crate::test_util::ok_bytes(b"data")]);

        let body = client
            .download_file_by_name("my-bucket", "a b.txt", None)
            .await
            .unwrap();
        assert_eq!(body, &b"data"[..]);

        let requests = recorder.take();
        let sent = &requests[0];
        assert_eq!(sent.method, Method::GET);
        assert_eq!(sent.url, "https://dl.mock/file/my-bucket/a%20b.txt");
        assert_eq!(sent.headers[AUTHORIZATION], "account-token");
    }

    #[tokio::test]
    async fn download_by_id_uses_query_parameter() {
        let (client, recorder) = recorded_client(vec![crate::test_util::ok_bytes(b"data")]);

        client.download_file_by_id("f-9", None).await.unwrap();

        let requests = recorder.take();
        assert_eq!(
            requests[0].url,
            "https://dl.mock/b2api/v2/b2_download_file_by_id?fileId=f-9"
        );
    }
}
