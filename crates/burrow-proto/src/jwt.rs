use std::collections::BTreeMap;

use base64::engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD};
use base64::Engine;
use serde_json::{Map, Value};

/// Decodes the claims segment of a bearer JWT from the Authorization
/// header, without verifying the signature. Filters only need the claim
/// values; an absent or malformed token is simply no claims.
pub fn decode_bearer_claims(headers: &BTreeMap<String, String>) -> Option<Map<String, Value>> {
    let raw = headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("authorization"))
        .map(|(_, value)| value.as_str())?;

    let token = raw
        .strip_prefix("Bearer ")
        .or_else(|| raw.strip_prefix("bearer "))
        .unwrap_or(raw)
        .trim();

    let mut segments = token.split('.');
    let _header = segments.next()?;
    let claims_segment = segments.next()?;

    let claims_bytes = decode_jwt_segment(claims_segment)?;
    match serde_json::from_slice::<Value>(&claims_bytes) {
        Ok(Value::Object(map)) => Some(map),
        Ok(_) | Err(_) => {
            tracing::debug!("authorization token claims segment was not a JSON object");
            None
        }
    }
}

fn decode_jwt_segment(segment: &str) -> Option<Vec<u8>> {
    let trimmed = segment.trim_end_matches('=');
    URL_SAFE_NO_PAD
        .decode(trimmed.as_bytes())
        .or_else(|_| STANDARD_NO_PAD.decode(trimmed.as_bytes()))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bearer_header(token: &str) -> BTreeMap<String, String> {
        let mut headers = BTreeMap::new();
        headers.insert("Authorization".to_string(), format!("Bearer {token}"));
        headers
    }

    fn token_with_claims(claims: &str) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256","typ":"JWT"}"#);
        let body = URL_SAFE_NO_PAD.encode(claims.as_bytes());
        format!("{header}.{body}.signature")
    }

    #[test]
    fn decodes_claims_from_bearer_token() {
        let headers = bearer_header(&token_with_claims(r#"{"sub":"dev-user","scope":"admin"}"#));
        let claims = decode_bearer_claims(&headers).expect("claims");
        assert_eq!(claims.get("sub").and_then(Value::as_str), Some("dev-user"));
        assert_eq!(claims.get("scope").and_then(Value::as_str), Some("admin"));
    }

    #[test]
    fn header_name_lookup_ignores_case() {
        let mut headers = BTreeMap::new();
        headers.insert(
            "authorization".to_string(),
            format!("Bearer {}", token_with_claims(r#"{"sub":"x"}"#)),
        );
        assert!(decode_bearer_claims(&headers).is_some());
    }

    #[test]
    fn missing_header_or_malformed_token_yields_none() {
        assert!(decode_bearer_claims(&BTreeMap::new()).is_none());
        assert!(decode_bearer_claims(&bearer_header("not-a-jwt")).is_none());
        assert!(decode_bearer_claims(&bearer_header("only-one.segment%%%")).is_none());
    }

    #[test]
    fn non_object_claims_segment_yields_none() {
        let headers = bearer_header(&token_with_claims(r#""just a string""#));
        assert!(decode_bearer_claims(&headers).is_none());
    }
}
