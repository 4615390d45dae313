use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::jwt::decode_bearer_claims;

/// Snapshot of an HTTP request as it crosses the tunnel. Header keys keep
/// the casing they arrived with; lookups are case-insensitive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct HttpRequestInfo {
    pub uri: String,
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "opt_base64"
    )]
    pub payload: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorization: Option<Map<String, Value>>,
}

impl HttpRequestInfo {
    pub fn new(method: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            method: method.into(),
            ..Self::default()
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Attaches decoded bearer-JWT claims so filters can match on them.
    /// A missing or undecodable token leaves the field unset.
    pub fn with_decoded_authorization(mut self) -> Self {
        self.authorization = decode_bearer_claims(&self.headers);
        self
    }

    pub fn payload_text(&self) -> Option<String> {
        self.payload
            .as_deref()
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct HttpResponseInfo {
    pub http_status: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "opt_base64"
    )]
    pub payload: Option<Vec<u8>>,
}

impl HttpResponseInfo {
    pub fn with_status(http_status: u16) -> Self {
        Self {
            http_status,
            ..Self::default()
        }
    }

    /// Hop-framing headers are invalid once the body has been fully
    /// buffered for replay; the writer recomputes Content-Length itself.
    pub fn remove_encoding_headers(&mut self) {
        self.headers.retain(|name, _| {
            !name.eq_ignore_ascii_case("transfer-encoding")
                && !name.eq_ignore_ascii_case("content-encoding")
        });
    }

    pub fn body_len(&self) -> usize {
        self.payload.as_deref().map_or(0, <[u8]>::len)
    }
}

mod opt_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match bytes {
            Some(bytes) => serializer.serialize_str(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = Option::<String>::deserialize(deserializer)?;
        match text {
            Some(text) => STANDARD
                .decode(text.as_bytes())
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}
