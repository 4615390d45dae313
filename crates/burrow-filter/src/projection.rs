use burrow_proto::HttpRequestInfo;
use serde_json::{Map, Value};

/// Projects a request into the JSON document filters are evaluated
/// against. The shape is part of the filter contract: `$.uri`, `$.method`,
/// `$.headers.<Name>`, `$.payload`, `$.authorization.<claim>`.
pub fn project_request(request: &HttpRequestInfo) -> Value {
    let mut document = Map::new();
    document.insert("uri".to_string(), Value::String(request.uri.clone()));
    document.insert("method".to_string(), Value::String(request.method.clone()));

    let headers: Map<String, Value> = request
        .headers
        .iter()
        .map(|(name, value)| (name.clone(), Value::String(value.clone())))
        .collect();
    document.insert("headers".to_string(), Value::Object(headers));

    if let Some(payload) = request.payload_text() {
        document.insert("payload".to_string(), Value::String(payload));
    }
    if let Some(claims) = request.authorization.clone() {
        document.insert("authorization".to_string(), Value::Object(claims));
    }

    Value::Object(document)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::FilterPattern;

    #[test]
    fn projection_exposes_uri_method_headers_and_payload() {
        let mut request = HttpRequestInfo::new("POST", "/api/orders?id=7");
        request
            .headers
            .insert("Content-Type".to_string(), "application/json".to_string());
        request.payload = Some(b"{\"qty\":3}".to_vec());

        let document = project_request(&request);
        assert_eq!(document["uri"], "/api/orders?id=7");
        assert_eq!(document["method"], "POST");
        assert_eq!(document["headers"]["Content-Type"], "application/json");
        assert_eq!(document["payload"], "{\"qty\":3}");
    }

    #[test]
    fn authorization_claims_are_matchable() {
        let mut request = HttpRequestInfo::new("GET", "/api/private");
        request.authorization = Some(
            serde_json::from_str(r#"{"sub": "dev-user", "tenant": "acme"}"#).expect("claims"),
        );

        let document = project_request(&request);
        let pattern =
            FilterPattern::compiled("$.authorization.tenant", "acme").expect("compile");
        assert!(pattern.matches(&document));
    }

    #[test]
    fn absent_optional_fields_are_omitted() {
        let document = project_request(&HttpRequestInfo::new("GET", "/health"));
        assert!(document.get("payload").is_none());
        assert!(document.get("authorization").is_none());
    }
}
