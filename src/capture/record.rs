//! Captured exchange records
//!
//! A [`CaptureRecord`] describes one observed proxy exchange: the request that
//! came in, what the origin answered (if anything), and how long it took.
//! Engines fill a record locally and hand it to the store once complete; from
//! then on it is shared read-only behind an `Arc`.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use hyper::HeaderMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

/// Header name -> values in arrival order. Names are canonical Title-Case.
pub type HeaderMultimap = BTreeMap<String, Vec<String>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub method: String,
    pub url: String,
    pub host: String,
    pub path: String,
    #[serde(default)]
    pub protocol: String,
    #[serde(default)]
    pub client_addr: String,
    pub request_headers: HeaderMultimap,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "base64_body")]
    pub request_body: Option<Bytes>,

    pub status_code: u16,
    pub response_headers: HeaderMultimap,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "base64_body")]
    pub response_body: Option<Bytes>,

    #[serde(rename = "duration_ms", with = "duration_millis")]
    pub duration: Duration,

    pub is_https: bool,
    pub is_tunnel: bool,
}

impl CaptureRecord {
    /// Start a record for a new exchange with a fresh id and capture timestamp.
    pub fn begin(method: impl Into<String>, client_addr: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            method: method.into(),
            url: String::new(),
            host: String::new(),
            path: String::new(),
            protocol: String::new(),
            client_addr: client_addr.into(),
            request_headers: HeaderMultimap::new(),
            request_body: None,
            status_code: 0,
            response_headers: HeaderMultimap::new(),
            response_body: None,
            duration: Duration::ZERO,
            is_https: false,
            is_tunnel: false,
        }
    }

    pub fn duration_ms(&self) -> u64 {
        self.duration.as_millis() as u64
    }
}

/// Empty bodies are recorded as absent so they are omitted from the JSON form.
pub fn captured_body(bytes: Bytes) -> Option<Bytes> {
    if bytes.is_empty() {
        None
    } else {
        Some(bytes)
    }
}

/// Copy a header map into the record's multimap form.
///
/// Duplicate headers keep every value in the order they appeared. Values that
/// are not valid UTF-8 are converted lossily.
pub fn header_multimap(headers: &HeaderMap) -> HeaderMultimap {
    let mut map = HeaderMultimap::new();
    for (name, value) in headers {
        map.entry(canonical_header_name(name.as_str()))
            .or_default()
            .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }
    map
}

/// Request headers as recorded. `Host` is left out: it is already captured in
/// the record's `host` field.
pub fn request_header_multimap(headers: &HeaderMap) -> HeaderMultimap {
    let mut map = header_multimap(headers);
    map.remove("Host");
    map
}

/// `x-forwarded-for` -> `X-Forwarded-For`.
pub fn canonical_header_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = true;
    for c in name.chars() {
        if upper {
            out.extend(c.to_uppercase());
        } else {
            out.extend(c.to_lowercase());
        }
        upper = c == '-';
    }
    out
}

mod base64_body {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &Option<Bytes>, serializer: S) -> Result<S::Ok, S::Error> {
        match body {
            Some(bytes) => serializer.serialize_str(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Bytes>, D::Error> {
        let encoded: Option<String> = Option::deserialize(deserializer)?;
        encoded
            .map(|s| {
                STANDARD
                    .decode(s.as_bytes())
                    .map(Bytes::from)
                    .map_err(serde::de::Error::custom)
            })
            .transpose()
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
