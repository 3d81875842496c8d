//! Turns whatever the provider answered into a list of images.
//!
//! Recognized shapes, first match wins:
//! 1. raw image body (`Content-Type: image/*` or image magic bytes)
//! 2. inline base64 field (`image_base64`, `b64_json`, `base64`, `image`, `data` as a string)
//! 3. `outputs` list
//! 4. `images` list
//! 5. `output` list (or a single `output` string)
//! 6. `data` list
//! 7. top-level list
//!
//! List items may be URL strings, data URLs, bare base64 strings or objects
//! carrying `url` / `b64_json` / `base64` / `image`. A field that is present but
//! yields nothing usable does not stop the search.

use bytes::Bytes;
use serde_json::Value;
use thiserror::Error;

use crate::media::decode_base64_payload;
use crate::models::ImageRef;

const INLINE_FIELDS: [&str; 5] = ["image_base64", "b64_json", "base64", "image", "data"];
const LIST_FIELDS: [&str; 4] = ["outputs", "images", "output", "data"];
const ITEM_INLINE_FIELDS: [&str; 4] = ["b64_json", "base64", "image_base64", "image"];

#[derive(Debug, Error)]
pub enum NormalizationError {
    #[error("no image data in provider response (fields: {0})")]
    NoImageData(String),
    #[error("provider response is neither an image nor JSON: {0}")]
    Unreadable(String),
}

/// A provider answer before interpretation.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub content_type: Option<String>,
    pub body: Bytes,
}

impl RawResponse {
    pub fn new(content_type: Option<String>, body: impl Into<Bytes>) -> Self {
        Self { content_type, body: body.into() }
    }

    #[cfg(test)]
    pub fn json(value: &Value) -> Self {
        Self::new(Some("application/json".into()), value.to_string())
    }

    pub async fn read(response: reqwest::Response) -> Result<Self, reqwest::Error> {
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().await?;
        Ok(Self { content_type, body })
    }

    pub fn is_image(&self) -> bool {
        let declared = self
            .content_type
            .as_deref()
            .is_some_and(|ct| ct.trim().to_ascii_lowercase().starts_with("image/"));
        declared || image::guess_format(&self.body).is_ok()
    }

    pub fn to_json(&self) -> Result<Value, NormalizationError> {
        serde_json::from_slice(&self.body).map_err(|e| NormalizationError::Unreadable(e.to_string()))
    }
}

pub fn extract_images(raw: &RawResponse) -> Result<Vec<ImageRef>, NormalizationError> {
    if raw.is_image() {
        return Ok(vec![ImageRef::inline(raw.body.clone())]);
    }
    let value = raw.to_json()?;
    extract_from_value(&value)
}

/// Same search as [`extract_images`] over an already parsed JSON body.
pub fn extract_from_value(value: &Value) -> Result<Vec<ImageRef>, NormalizationError> {
    match value {
        Value::Object(map) => {
            for field in INLINE_FIELDS {
                if let Some(Value::String(s)) = map.get(field) {
                    if let Some(image) = string_to_image(s) {
                        return Ok(vec![image]);
                    }
                }
            }
            for field in LIST_FIELDS {
                let images = match map.get(field) {
                    Some(Value::Array(items)) => items_to_images(items),
                    Some(Value::String(s)) if field == "output" => string_to_image(s).into_iter().collect(),
                    _ => Vec::new(),
                };
                if !images.is_empty() {
                    return Ok(images);
                }
            }
            let keys: Vec<&str> = map.keys().map(String::as_str).collect();
            Err(NormalizationError::NoImageData(keys.join(", ")))
        }
        Value::Array(items) => {
            let images = items_to_images(items);
            if images.is_empty() {
                Err(NormalizationError::NoImageData("top-level list without images".into()))
            } else {
                Ok(images)
            }
        }
        other => Err(NormalizationError::NoImageData(format!("unexpected JSON {}", json_kind(other)))),
    }
}

fn items_to_images(items: &[Value]) -> Vec<ImageRef> {
    items.iter().filter_map(item_to_image).collect()
}

fn item_to_image(item: &Value) -> Option<ImageRef> {
    match item {
        Value::String(s) => string_to_image(s),
        Value::Object(map) => {
            if let Some(Value::String(url)) = map.get("url") {
                if let Some(image) = string_to_image(url) {
                    return Some(image);
                }
            }
            ITEM_INLINE_FIELDS.iter().find_map(|field| match map.get(*field) {
                Some(Value::String(s)) => string_to_image(s),
                _ => None,
            })
        }
        _ => None,
    }
}

fn string_to_image(value: &str) -> Option<ImageRef> {
    let value = value.trim();
    if value.starts_with("http://") || value.starts_with("https://") {
        return Some(ImageRef::Url(value.to_string()));
    }
    if value.is_empty() {
        return None;
    }
    decode_base64_payload(value)
        .ok()
        .filter(|bytes| !bytes.is_empty())
        .map(ImageRef::inline)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
