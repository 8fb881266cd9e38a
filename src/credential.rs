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

//! Credentials for the B2 API
//!
//! Acquiring a credential (`b2_authorize_account`) is out of scope for
//! this crate; callers obtain one elsewhere and thread it through a
//! [`CredentialProvider`], which is consulted before every API call.

use async_trait::async_trait;
use std::fmt::Debug;
use std::sync::Arc;

use crate::Result;

/// An authorization for the B2 API, as issued by `b2_authorize_account`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct B2Credential {
    /// Account-level authorization token sent as the `Authorization`
    /// header of API requests
    pub authorization_token: String,
    /// Base URL for API requests, e.g. `https://api001.backblazeb2.com`
    pub api_url: String,
    /// Base URL for file downloads
    pub download_url: String,
}

/// Provides the credential used to authorize B2 API requests
///
/// Invoked before each call, allowing implementations to renew the
/// credential out of band. An implementation that cannot produce a
/// valid credential should fail with [`Error::Auth`](crate::Error::Auth).
#[async_trait]
pub trait CredentialProvider: Send + Sync + Debug + 'static {
    /// Returns the current credential
    async fn get_credential(&self) -> Result<Arc<B2Credential>>;
}

/// A shared [`CredentialProvider`]
pub type B2CredentialProvider = Arc<dyn CredentialProvider>;

/// A [`CredentialProvider`] serving a fixed credential
#[derive(Debug)]
pub struct StaticCredentialProvider {
    credential: Arc<B2Credential>,
}

impl StaticCredentialProvider {
    /// Create a provider serving `credential`
    pub fn new(credential: B2Credential) -> Self {
        Self {
            credential: Arc::new(credential),
        }
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentialProvider {
    async fn get_credential(&self) -> Result<Arc<B2Credential>> {
        Ok(Arc::clone(&self.credential))
    }
}
