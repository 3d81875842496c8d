//! Image payload helpers: base64 / data-URL decoding, MIME sniffing and
//! downloading provider-hosted images.

use std::time::Duration;

use base64::Engine;
use bytes::Bytes;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use tracing::warn;

const DOWNLOAD_MAX_ATTEMPTS: usize = 3;
const DOWNLOAD_BASE_DELAY_MS: u64 = 400;

/// Decodes either a bare base64 string or a `data:<mime>;base64,<payload>` URL.
pub fn decode_base64_payload(value: &str) -> Result<Bytes, base64::DecodeError> {
    let payload = match value.trim().strip_prefix("data:") {
        Some(rest) => rest.split_once(',').map(|(_, data)| data).unwrap_or(rest),
        None => value.trim(),
    };
    let cleaned: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
    base64::engine::general_purpose::STANDARD
        .decode(cleaned.as_bytes())
        .map(Bytes::from)
}

/// Best guess at an image MIME type from magic bytes.
pub fn detect_mime_type(data: &[u8]) -> String {
    if looks_like_svg(data) {
        return "image/svg+xml".to_string();
    }
    image::guess_format(data)
        .map(|format| format.to_mime_type().to_string())
        .unwrap_or_else(|_| "image/png".to_string())
}

fn looks_like_svg(data: &[u8]) -> bool {
    let head = &data[..data.len().min(256)];
    let text = String::from_utf8_lossy(head);
    let text = text.trim_start();
    text.starts_with("<svg") || (text.starts_with("<?xml") && text.contains("<svg"))
}

pub fn to_data_url(mime_type: &str, data: &[u8]) -> String {
    format!(
        "data:{};base64,{}",
        mime_type,
        base64::engine::general_purpose::STANDARD.encode(data)
    )
}

/// Shortens a string for log output.
pub fn truncate_for_log(value: &str, limit: usize) -> String {
    if value.chars().count() <= limit {
        return value.to_string();
    }
    let truncated: String = value.chars().take(limit).collect();
    format!("{truncated}...[{} chars]", value.chars().count())
}

/// Shortens long base64-looking strings inside a JSON value so it can be logged.
pub fn redact_base64(value: &mut Value) {
    match value {
        Value::String(s) => {
            let looks_encoded = s.len() > 100
                && s.trim_start_matches("data:")
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '/' | '=' | ';' | ',' | ':' | '-'));
            if looks_encoded {
                *s = format!("{}...[truncated {} chars]", &s[..50], s.len() - 50);
            }
        }
        Value::Object(map) => map.values_mut().for_each(redact_base64),
        Value::Array(items) => items.iter_mut().for_each(redact_base64),
        _ => {}
    }
}

fn should_retry_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

/// Fetches an image, retrying transient failures. `None` when every attempt failed.
pub async fn download_image(client: &Client, url: &str) -> Option<(Bytes, String)> {
    for attempt in 0..DOWNLOAD_MAX_ATTEMPTS {
        let last = attempt + 1 == DOWNLOAD_MAX_ATTEMPTS;
        let delay = Duration::from_millis(DOWNLOAD_BASE_DELAY_MS << attempt);

        let response = match client.get(url).send().await {
            Ok(resp) => resp,
            Err(err) => {
                warn!(
                    "Failed to fetch image {url}: {err} (attempt={}/{})",
                    attempt + 1,
                    DOWNLOAD_MAX_ATTEMPTS
                );
                if last || !(err.is_connect() || err.is_timeout()) {
                    return None;
                }
                tokio::time::sleep(delay).await;
                continue;
            }
        };

        let status = response.status();
        if !status.is_success() {
            warn!("Image download from {url} answered {status}");
            if last || !should_retry_status(status) {
                return None;
            }
            tokio::time::sleep(delay).await;
            continue;
        }

        let header_mime = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_string())
            .filter(|v| v.starts_with("image/"));

        return match response.bytes().await {
            Ok(bytes) => {
                let mime = header_mime.unwrap_or_else(|| detect_mime_type(&bytes));
                Some((bytes, mime))
            }
            Err(err) => {
                warn!("Failed to read image body from {url}: {err}");
                None
            }
        };
    }
    None
}
