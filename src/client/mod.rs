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

//! The B2 API client: URL construction, authorization-header injection,
//! JSON round trips and error-body mapping

pub(crate) mod http;

use reqwest::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Serialize;
use snafu::{OptionExt, ResultExt};
use std::sync::Arc;

use crate::client::http::{HttpRequest, HttpResponse, HttpService, ReqwestService};
use crate::credential::{B2Credential, B2CredentialProvider};
use crate::{
    AuthSnafu, EncodeSnafu, Error, ExpiredTokenSnafu, IntegrityMismatchSnafu,
    InvalidMetadataSnafu, InvalidPartSequenceSnafu, InvalidResponseSnafu,
    InvalidSessionStateSnafu, NetworkSnafu, NotFoundSnafu, PartCountSnafu, Result,
};

/// Version prefix of the native API endpoints
pub(crate) const API_VERSION_PATH: &str = "/b2api/v2";

/// Client for the B2 native API
///
/// Holds the configuration each operation needs — a credential provider
/// and a transport — and nothing else: no session state, no retry
/// policy, no caching. The client is stateless and reentrant; cheap to
/// share behind an [`Arc`].
#[derive(Debug)]
pub struct B2Client {
    credentials: B2CredentialProvider,
    http: Arc<dyn HttpService>,
}

impl B2Client {
    /// Create a client dispatching requests through [`ReqwestService`]
    pub fn new(credentials: B2CredentialProvider) -> Self {
        Self::with_http(credentials, Arc::new(ReqwestService::default()))
    }

    /// Create a client dispatching requests through a custom transport
    pub fn with_http(credentials: B2CredentialProvider, http: Arc<dyn HttpService>) -> Self {
        Self { credentials, http }
    }

    pub(crate) async fn get_credential(&self) -> Result<Arc<B2Credential>> {
        self.credentials.get_credential().await
    }

    /// Returns the URL of the named API operation, e.g.
    /// `{apiUrl}/b2api/v2/b2_start_large_file`
    pub(crate) fn api_url(credential: &B2Credential, operation: &str) -> String {
        format!("{}{}/{}", credential.api_url, API_VERSION_PATH, operation)
    }

    /// POST a JSON body to the named API operation with the account
    /// token and decode the JSON response
    pub(crate) async fn post_api_request<B, R>(
        &self,
        operation: &'static str,
        body: &B,
        resource: &str,
    ) -> Result<R>
    where
        B: Serialize + ?Sized + Sync,
        R: DeserializeOwned,
    {
        let credential = self.get_credential().await?;
        let mut request = HttpRequest::new(Method::POST, Self::api_url(&credential, operation));
        request.headers.insert(
            AUTHORIZATION,
            header_value(&credential.authorization_token, "authorization", resource)?,
        );
        request
            .headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        request.body = serde_json::to_vec(body).context(EncodeSnafu { resource })?.into();

        let response = self.send_checked(request, resource).await?;
        decode_response(response, resource)
    }

    /// Dispatch `request`, mapping transport failures and non-success
    /// statuses onto the crate error taxonomy
    pub(crate) async fn send_checked(
        &self,
        request: HttpRequest,
        resource: &str,
    ) -> Result<HttpResponse> {
        tracing::debug!(method = %request.method, url = %request.url, resource, "dispatching request");
        let response = self
            .http
            .send(request)
            .await
            .context(NetworkSnafu { resource })?;

        if response.status.is_success() {
            Ok(response)
        } else {
            Err(b2_error(&response, resource))
        }
    }
}

/// Decode a successful JSON response body
pub(crate) fn decode_response<R: DeserializeOwned>(
    response: HttpResponse,
    resource: &str,
) -> Result<R> {
    serde_json::from_slice(&response.body).context(InvalidResponseSnafu { resource })
}

/// Construct a [`HeaderValue`], surfacing invalid input as metadata
/// errors rather than panicking
pub(crate) fn header_value(value: &str, name: &str, resource: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .ok()
        .context(InvalidMetadataSnafu {
            key: name,
            reason: format!("not a valid header value for {resource}"),
        })
}

/// The error body returned by every B2 endpoint
#[derive(Debug, serde::Deserialize)]
struct B2ErrorBody {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

/// Maps a non-success response onto the crate error taxonomy
///
/// Matching is by the `code` field of the B2 error body, falling back to
/// the HTTP status; unmapped combinations surface as
/// [`Error::Unexpected`] carrying status, code and message.
fn b2_error(response: &HttpResponse, resource: &str) -> Error {
    let body: B2ErrorBody = serde_json::from_slice(&response.body).unwrap_or_else(|_| {
        B2ErrorBody {
            code: "unknown".to_string(),
            message: String::from_utf8_lossy(&response.body).into_owned(),
        }
    });

    let B2ErrorBody { code, message } = body;
    let status = response.status.as_u16();
    match (status, code.as_str()) {
        (401, "expired_auth_token") => ExpiredTokenSnafu { resource, message }.build(),
        (401, _) | (_, "bad_auth_token") | (_, "unauthorized") => {
            AuthSnafu { resource, message }.build()
        }
        (404, _) | (_, "not_found") | (_, "bad_bucket_id") | (_, "file_not_present") => {
            NotFoundSnafu { resource, message }.build()
        }
        (_, "sha1_mismatch") => IntegrityMismatchSnafu { resource, message }.build(),
        (_, "part_sha1_mismatch") | (_, "missing_part") | (_, "bad_part_sequence") => {
            InvalidPartSequenceSnafu { resource, message }.build()
        }
        (_, "part_count") => PartCountSnafu { resource, message }.build(),
        (_, "file_state") => InvalidSessionStateSnafu { resource, message }.build(),
        (status, _) => Error::Unexpected {
            resource: resource.to_string(),
            status,
            code: code.clone(),
            message,
        },
    }
}
