//! Best-effort helpers run before prompt construction: translating customer
//! wishes to English and describing a reference photo. Every failure here is
//! logged and swallowed; the caller falls back to the raw input.

use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};
use whatlang::Lang;

use crate::config::{PreprocessConfig, ServiceEndpoint};
use crate::media::truncate_for_log;

const PREPROCESS_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Deserialize)]
struct TranslateResponse {
    #[serde(rename = "translatedText")]
    translated_text: String,
}

#[derive(Clone)]
pub struct Preprocessor {
    client: Client,
    translate: Option<ServiceEndpoint>,
    caption: Option<ServiceEndpoint>,
}

impl Preprocessor {
    pub fn new(client: Client, config: &PreprocessConfig) -> Self {
        Self {
            client,
            translate: config.translate.clone(),
            caption: config.caption.clone(),
        }
    }

    pub fn disabled(client: Client) -> Self {
        Self::new(client, &PreprocessConfig::default())
    }

    /// English rendering of `text`, or `text` itself when translation is
    /// unavailable, unnecessary or fails.
    pub async fn translate(&self, text: &str) -> String {
        let Some(endpoint) = &self.translate else {
            return text.to_string();
        };
        if is_english(text) {
            return text.to_string();
        }
        match self.call_translate(endpoint, text).await {
            Ok(translated) if !translated.trim().is_empty() => {
                info!("🌐 Translated wishes: {}", truncate_for_log(&translated, 120));
                translated
            }
            Ok(_) => text.to_string(),
            Err(e) => {
                warn!("⚠️ Translation failed, using original text: {}", e);
                text.to_string()
            }
        }
    }

    async fn call_translate(&self, endpoint: &ServiceEndpoint, text: &str) -> Result<String, reqwest::Error> {
        let mut body = json!({
            "q": text,
            "source": "auto",
            "target": "en",
            "format": "text",
        });
        if let Some(key) = &endpoint.api_key {
            body["api_key"] = json!(key);
        }
        let response: TranslateResponse = self
            .client
            .post(&endpoint.url)
            .timeout(PREPROCESS_TIMEOUT)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response.translated_text)
    }

    /// Short description of a reference photo, if a captioning model is configured.
    pub async fn describe(&self, image: &[u8]) -> Option<String> {
        let endpoint = self.caption.as_ref()?;
        let mut request = self
            .client
            .post(&endpoint.url)
            .timeout(PREPROCESS_TIMEOUT)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(image.to_vec());
        if let Some(key) = &endpoint.api_key {
            request = request.bearer_auth(key);
        }

        let result: Result<Value, reqwest::Error> = async move {
            request.send().await?.error_for_status()?.json::<Value>().await
        }
        .await;

        match result {
            Ok(value) => {
                let caption = caption_from_value(&value);
                if caption.is_none() {
                    warn!("⚠️ Caption service answered without text: {}", truncate_for_log(&value.to_string(), 200));
                }
                caption
            }
            Err(e) => {
                warn!("⚠️ Image captioning failed: {}", e);
                None
            }
        }
    }
}

fn is_english(text: &str) -> bool {
    whatlang::detect(text).is_some_and(|info| info.lang() == Lang::Eng && info.is_reliable())
}

/// Accepts `[{"generated_text": ..}]`, `{"generated_text": ..}` and `{"caption": ..}`.
fn caption_from_value(value: &Value) -> Option<String> {
    let item = match value {
        Value::Array(items) => items.first()?,
        other => other,
    };
    ["generated_text", "caption", "text"]
        .iter()
        .find_map(|field| item.get(*field).and_then(Value::as_str))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::tests::serve;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};
    use pretty_assertions::assert_eq;

    fn with_endpoints(translate: Option<String>, caption: Option<String>) -> Preprocessor {
        let endpoint = |url: String| ServiceEndpoint { url, api_key: Some("k".into()) };
        Preprocessor::new(
            Client::new(),
            &PreprocessConfig {
                translate: translate.map(endpoint),
                caption: caption.map(endpoint),
            },
        )
    }

    #[tokio::test]
    async fn translates_non_english_text() {
        let app = Router::new().route(
            "/translate",
            post(|Json(body): Json<Value>| async move {
                assert_eq!(body["target"], "en");
                Json(json!({"translatedText": "Add white roses and gold leaf"}))
            }),
        );
        let base = serve(app).await;
        let pre = with_endpoints(Some(format!("{base}/translate")), None);
        let text = "Ajoutez des roses blanches et des feuilles d'or sur chaque étage du gâteau";
        assert_eq!(pre.translate(text).await, "Add white roses and gold leaf");
    }

    #[tokio::test]
    async fn translation_failure_keeps_original() {
        let app = Router::new().route("/translate", post(|| async { StatusCode::SERVICE_UNAVAILABLE }));
        let base = serve(app).await;
        let pre = with_endpoints(Some(format!("{base}/translate")), None);
        let text = "Ajoutez des roses blanches et des feuilles d'or sur chaque étage du gâteau";
        assert_eq!(pre.translate(text).await, text);
    }

    #[tokio::test]
    async fn no_translator_is_identity() {
        let pre = Preprocessor::disabled(Client::new());
        assert_eq!(pre.translate("des fleurs").await, "des fleurs");
        assert_eq!(pre.describe(b"img").await, None);
    }

    #[tokio::test]
    async fn describes_reference_image() {
        let app = Router::new().route(
            "/caption",
            post(|| async { Json(json!([{"generated_text": " a three tier white cake "}])) }),
        );
        let base = serve(app).await;
        let pre = with_endpoints(None, Some(format!("{base}/caption")));
        assert_eq!(pre.describe(b"img").await.as_deref(), Some("a three tier white cake"));
    }

    #[tokio::test]
    async fn caption_failure_is_none() {
        let app = Router::new().route("/caption", post(|| async { StatusCode::INTERNAL_SERVER_ERROR }));
        let base = serve(app).await;
        let pre = with_endpoints(None, Some(format!("{base}/caption")));
        assert_eq!(pre.describe(b"img").await, None);
    }

    #[test]
    fn caption_shapes() {
        assert_eq!(caption_from_value(&json!({"caption": "cake"})).as_deref(), Some("cake"));
        assert_eq!(caption_from_value(&json!([])), None);
        assert_eq!(caption_from_value(&json!({"generated_text": "  "})), None);
    }
}
