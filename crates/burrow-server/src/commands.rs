use std::collections::BTreeMap;
use std::path::Path;

use burrow_proto::{
    CommandResponse, HttpRequestInfo, HttpResponseInfo, STATUS_INTERNAL_ERROR, STATUS_NOT_FOUND,
    STATUS_NO_CONTENT,
};

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("invalid HTTP method {0:?}")]
    InvalidMethod(String),
    #[error("invalid target URL {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("outbound HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
}

pub fn env_snapshot() -> BTreeMap<String, String> {
    std::env::vars().collect()
}

/// File download with the endpoint's status conventions: 404 for a blank
/// path, 204 with a diagnostic for a missing or non-regular file, 500 for
/// a read failure, 200 with the raw bytes otherwise.
pub fn download_file(file_path: &str) -> CommandResponse {
    if file_path.trim().is_empty() {
        return CommandResponse {
            status: STATUS_NOT_FOUND,
            payload: None,
        };
    }

    let path = Path::new(file_path);
    if !path.exists() {
        return CommandResponse::error(STATUS_NO_CONTENT, format!("{file_path} does not exist"));
    }
    if !path.is_file() {
        return CommandResponse::error(STATUS_NO_CONTENT, format!("{file_path} not a file"));
    }

    match std::fs::read(path) {
        Ok(bytes) => CommandResponse::ok_bytes(bytes),
        Err(error) => CommandResponse::error(STATUS_INTERNAL_ERROR, error.to_string()),
    }
}

/// Executes the decoded request against its absolute target URL and
/// captures status, headers and body for the reply frame.
pub async fn execute_http_request(
    client: &reqwest::Client,
    request: &HttpRequestInfo,
) -> Result<HttpResponseInfo, CommandError> {
    let method = reqwest::Method::from_bytes(request.method.as_bytes())
        .map_err(|_| CommandError::InvalidMethod(request.method.clone()))?;
    let url = reqwest::Url::parse(&request.uri).map_err(|error| CommandError::InvalidUrl {
        url: request.uri.clone(),
        reason: error.to_string(),
    })?;

    let mut builder = client.request(method, url);
    for (name, value) in &request.headers {
        // The transport recomputes framing; a stale Host would fight the
        // resolved target.
        if name.eq_ignore_ascii_case("content-length") || name.eq_ignore_ascii_case("host") {
            continue;
        }
        builder = builder.header(name, value);
    }
    if let Some(payload) = &request.payload {
        builder = builder.body(payload.clone());
    }

    let response = builder.send().await?;
    let http_status = response.status().as_u16();
    let mut headers = BTreeMap::new();
    for (name, value) in response.headers() {
        let rendered = String::from_utf8_lossy(value.as_bytes()).into_owned();
        headers
            .entry(name.to_string())
            .and_modify(|existing: &mut String| {
                existing.push(';');
                existing.push_str(&rendered);
            })
            .or_insert(rendered);
    }
    let payload = response.bytes().await?;

    let mut info = HttpResponseInfo {
        http_status,
        headers,
        payload: (!payload.is_empty()).then(|| payload.to_vec()),
    };
    info.remove_encoding_headers();
    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn blank_path_is_not_found() {
        let response = download_file("   ");
        assert_eq!(response.status, STATUS_NOT_FOUND);
        assert!(response.payload.is_none());
    }

    #[test]
    fn missing_file_reports_no_content_with_diagnostic() {
        let response = download_file("/definitely/not/a/real/file.txt");
        assert_eq!(response.status, STATUS_NO_CONTENT);
        let text = response.payload_text().expect("diagnostic text");
        assert!(text.contains("does not exist"), "{text}");
    }

    #[test]
    fn directory_is_not_a_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let response = download_file(&dir.path().to_string_lossy());
        assert_eq!(response.status, STATUS_NO_CONTENT);
        let text = response.payload_text().expect("diagnostic text");
        assert!(text.contains("not a file"), "{text}");
    }

    #[test]
    fn regular_file_returns_its_bytes() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        file.write_all(b"binary\x00content\xff").expect("write");

        let response = download_file(&file.path().to_string_lossy());
        assert_eq!(response.status, 200);
        assert_eq!(response.payload, Some(b"binary\x00content\xff".to_vec()));
    }

    #[test]
    fn env_snapshot_reflects_the_live_environment() {
        std::env::set_var("BURROW_COMMANDS_TEST_ENV", "present");
        let snapshot = env_snapshot();
        assert_eq!(
            snapshot.get("BURROW_COMMANDS_TEST_ENV").map(String::as_str),
            Some("present")
        );
    }

    #[tokio::test]
    async fn execute_rejects_garbage_method_and_url() {
        let client = reqwest::Client::new();

        let mut request = HttpRequestInfo::new("NOT A METHOD", "http://127.0.0.1:1/");
        let error = execute_http_request(&client, &request)
            .await
            .expect_err("bad method");
        assert!(matches!(error, CommandError::InvalidMethod(_)));

        request = HttpRequestInfo::new("GET", "not-a-url");
        let error = execute_http_request(&client, &request)
            .await
            .expect_err("bad url");
        assert!(matches!(error, CommandError::InvalidUrl { .. }));
    }
}
