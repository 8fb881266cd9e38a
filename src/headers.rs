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

//! Caller-supplied file metadata transmitted as `X-Bz-Info-*` headers

use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use snafu::{ensure, OptionExt};
use std::collections::btree_map::Iter;
use std::collections::BTreeMap;

use crate::{InvalidMetadataSnafu, Result};

/// Prefix B2 uses for caller-supplied metadata headers
pub(crate) const INFO_HEADER_PREFIX: &str = "x-bz-info-";

/// Header carrying the URL-safe encoded logical file name
pub(crate) const FILE_NAME_HEADER: &str = "x-bz-file-name";

/// Header carrying the hex SHA-1 digest of the transmitted bytes
pub(crate) const CONTENT_SHA1_HEADER: &str = "x-bz-content-sha1";

/// Header carrying the 1-based part number of a large file part
pub(crate) const PART_NUMBER_HEADER: &str = "x-bz-part-number";

/// B2 rejects uploads carrying more than this many info headers
const MAX_ENTRIES: usize = 10;

/// Characters that must be percent-encoded in header values
///
/// Everything outside visible ASCII, plus `%` itself so decoding is
/// unambiguous
const VALUE_ESCAPED: &AsciiSet = &CONTROLS.add(b' ').add(b'%').add(b'"').add(b'\x7f');

/// A bounded mapping of caller-supplied metadata attached to an upload
///
/// Keys are restricted to ASCII alphanumerics, `-`, `_` and `.` so the
/// resulting `X-Bz-Info-{key}` header name is always valid; values are
/// percent-encoded before transmission. At most 10 entries are accepted,
/// matching the B2 service limit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileMetadata(BTreeMap<String, String>);

impl FileMetadata {
    /// Create an empty [`FileMetadata`]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a metadata entry, replacing any previous value for `key`
    ///
    /// Returns an error if the key is not header-safe or the entry limit
    /// would be exceeded
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Result<()> {
        let key = key.into();
        ensure!(
            !key.is_empty(),
            InvalidMetadataSnafu {
                key,
                reason: "key must be non-empty",
            }
        );
        ensure!(
            key.bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'.'),
            InvalidMetadataSnafu {
                key,
                reason: "key must contain only ASCII alphanumerics, '-', '_' or '.'",
            }
        );
        ensure!(
            self.0.len() < MAX_ENTRIES || self.0.contains_key(&key),
            InvalidMetadataSnafu {
                key,
                reason: "at most 10 info entries are allowed",
            }
        );
        self.0.insert(key, value.into());
        Ok(())
    }

    /// Returns the number of entries
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if there are no entries
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over the entries in key order
    pub fn iter(&self) -> Iter<'_, String, String> {
        self.0.iter()
    }

    /// Merge the entries into `headers` as `X-Bz-Info-{key}` headers
    pub(crate) fn apply(&self, headers: &mut HeaderMap) -> Result<()> {
        for (key, value) in &self.0 {
            let name = format!("{}{}", INFO_HEADER_PREFIX, key.to_ascii_lowercase());
            let name = HeaderName::from_bytes(name.as_bytes()).ok().context(
                InvalidMetadataSnafu {
                    key: key.clone(),
                    reason: "key is not a valid header name",
                },
            )?;
            let encoded = utf8_percent_encode(value, VALUE_ESCAPED).to_string();
            let value =
                HeaderValue::from_str(&encoded)
                    .ok()
                    .context(InvalidMetadataSnafu {
                        key: key.clone(),
                        reason: "value is not a valid header value",
                    })?;
            headers.insert(name, value);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn accepts_valid_entries() {
        let mut info = FileMetadata::new();
        info.insert("src_last_modified_millis", "1634000000000").unwrap();
        info.insert("Color", "blue").unwrap();
        assert_eq!(info.len(), 2);
    }

    #[test]
    fn rejects_unsafe_keys() {
        let mut info = FileMetadata::new();
        for key in ["", "with space", "newline\n", "naïve"] {
            let err = info.insert(key, "v").unwrap_err();
            assert!(matches!(err, Error::InvalidMetadata { .. }), "{err}");
        }
    }

    #[test]
    fn bounded_to_ten_entries() {
        let mut info = FileMetadata::new();
        for i in 0..10 {
            info.insert(format!("key-{i}"), "v").unwrap();
        }
        let err = info.insert("key-10", "v").unwrap_err();
        assert!(matches!(err, Error::InvalidMetadata { .. }), "{err}");

        // Replacing an existing key is still allowed at the limit
        info.insert("key-3", "replaced").unwrap();
        assert_eq!(info.len(), 10);
    }

    #[test]
    fn applies_prefixed_and_encoded_headers() {
        let mut info = FileMetadata::new();
        info.insert("Author", "Ferris the Crab").unwrap();
        info.insert("pct", "50%").unwrap();

        let mut headers = HeaderMap::new();
        info.apply(&mut headers).unwrap();

        assert_eq!(headers["x-bz-info-author"], "Ferris%20the%20Crab");
        assert_eq!(headers["x-bz-info-pct"], "50%25");
    }
}
