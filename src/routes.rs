use std::sync::Arc;
use std::time::Duration;

use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, Request, State};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Serialize;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::error::AppError;
use crate::gateway::GenerationGateway;
use crate::media::{decode_base64_payload, detect_mime_type, truncate_for_log};
use crate::models::{
    non_blank, GenerateRequest, GenerateResponse, OrderConfiguration, OrderSubmission, SendOrderRequest,
    SendOrderResponse,
};
use crate::notify::MessagingChannel;

pub const MISSING_CHANNEL: &str = "Messaging channel is not configured: set TELEGRAM_BOT_TOKEN and TELEGRAM_CHAT_ID, \
or WHATSAPP_TOKEN, WHATSAPP_PHONE_ID and WHATSAPP_RECIPIENT";

#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<GenerationGateway>,
    pub notifier: Option<Arc<dyn MessagingChannel>>,
}

pub fn router(state: AppState, server: &ServerConfig) -> Router {
    // liveness stays outside the concurrency limit so busy workers never hide it
    let work = Router::new()
        .route("/generate", post(generate))
        .route("/send-order", post(send_order))
        .layer(GlobalConcurrencyLimitLayer::new(server.max_concurrent_requests))
        .layer(middleware::from_fn_with_state(server.request_timeout, enforce_deadline));

    Router::new()
        .route("/", get(home))
        .route("/health", get(health))
        .merge(work)
        .layer(DefaultBodyLimit::max(server.max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Answers 504 with the usual JSON error body once a request runs past `limit`.
async fn enforce_deadline(State(limit): State<Duration>, request: Request, next: Next) -> Response {
    match tokio::time::timeout(limit, next.run(request)).await {
        Ok(response) => response,
        Err(_) => AppError::Timeout(limit).into_response(),
    }
}

pub async fn home() -> &'static str {
    "Victoria cake generation API is running"
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: &'static str,
    timestamp: String,
    version: &'static str,
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        timestamp: Utc::now().to_rfc3339(),
        version: env!("CARGO_PKG_VERSION"),
    })
}

pub async fn generate(
    State(state): State<AppState>,
    payload: Result<Json<GenerateRequest>, JsonRejection>,
) -> Result<Json<GenerateResponse>, AppError> {
    let Json(body) = payload.map_err(|e| AppError::Validation(e.body_text()))?;
    let config = OrderConfiguration::try_from(body)
        .map_err(|e| AppError::Validation(format!("Invalid image_base64: {e}")))?;

    let request_id = Uuid::new_v4();
    let span = info_span!("generate", %request_id);
    async move {
        info!(
            "🚀 Generating designs: {} tiers, style '{}', event '{}', reference image: {}",
            config.tiers,
            config.style,
            config.event,
            config.reference_image.is_some()
        );

        let result = state.gateway.generate(&config).await?;
        let response = GenerateResponse::from(&result);
        if !result.failures.is_empty() {
            warn!("⚠️ Placeholders substituted: {}", result.failures.join("; "));
        }

        let summary: Vec<String> = result
            .images
            .iter()
            .zip(&response.images)
            .map(|(image, encoded)| format!("{}: {}", image.label, truncate_for_log(encoded, 50)))
            .collect();
        info!(
            "✅ Returning {} image(s), {} placeholder(s): {}",
            response.images.len(),
            result.placeholder_count(),
            summary.join(", ")
        );
        Ok::<_, AppError>(Json(response))
    }
    .instrument(span)
    .await
}

pub async fn send_order(
    State(state): State<AppState>,
    payload: Result<Json<SendOrderRequest>, JsonRejection>,
) -> Result<Json<SendOrderResponse>, AppError> {
    let Json(body) = payload.map_err(|e| AppError::Validation(e.body_text()))?;
    let submission = validate_order(body)?;

    let notifier = state
        .notifier
        .as_ref()
        .ok_or_else(|| AppError::Configuration(MISSING_CHANNEL.to_string()))?;

    info!("📦 Forwarding order from {} via {}", submission.name, notifier.name());
    let message_id = notifier.send(&submission).await?;
    Ok(Json(SendOrderResponse { success: true, message_id }))
}

fn validate_order(body: SendOrderRequest) -> Result<OrderSubmission, AppError> {
    fn require(value: Option<String>, name: &str) -> Result<String, AppError> {
        non_blank(value).ok_or_else(|| AppError::missing_field(name))
    }

    let image_base64 = require(body.image_base64, "image_base64")?;
    let name = require(body.name, "name")?;
    let contact = require(body.contact, "contact")?;
    let order_details = require(body.order_details, "order_details")?;
    let selected_design = require(body.selected_design, "selected_design")?;

    let image = decode_base64_payload(&image_base64)
        .map_err(|e| AppError::Validation(format!("Invalid image_base64: {e}")))?;
    let mime_type = detect_mime_type(&image);

    Ok(OrderSubmission { image, mime_type, name, contact, order_details, selected_design })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::models::MessageId;
    use crate::notify::NotifyError;
    use crate::preprocess::Preprocessor;
    use crate::provider::{GenerationError, ProviderAdapter};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use reqwest::Client;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    const PNG_PIXEL: &str = "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAYAAAAfFcSJAAAADUlEQVR42mP8z8BQDwAEhQGAhKmMIQAAAABJRU5ErkJggg==";

    struct TimingOut;

    #[async_trait]
    impl ProviderAdapter for TimingOut {
        fn name(&self) -> &str {
            "timing-out"
        }

        async fn generate(
            &self,
            _request: &crate::models::GenerationRequest,
        ) -> Result<Vec<crate::models::ImageRef>, GenerationError> {
            Err(GenerationError::Timeout("job not finished after 30 polls".into()))
        }
    }

    /// Adapter that never answers.
    struct Hanging;

    #[async_trait]
    impl ProviderAdapter for Hanging {
        fn name(&self) -> &str {
            "hanging"
        }

        async fn generate(
            &self,
            _request: &crate::models::GenerationRequest,
        ) -> Result<Vec<crate::models::ImageRef>, GenerationError> {
            std::future::pending().await
        }
    }

    #[derive(Default)]
    struct RecordingChannel {
        sent: Mutex<Vec<OrderSubmission>>,
    }

    #[async_trait]
    impl MessagingChannel for RecordingChannel {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn send(&self, order: &OrderSubmission) -> Result<MessageId, NotifyError> {
            self.sent.lock().push(order.clone());
            Ok(MessageId::Numeric(99))
        }
    }

    fn empty_config() -> AppConfig {
        AppConfig::from_lookup(|_| None)
    }

    fn app_with(adapters: Vec<Arc<dyn ProviderAdapter>>, notifier: Option<Arc<dyn MessagingChannel>>) -> Router {
        app_from(empty_config(), adapters, notifier)
    }

    fn app_from(
        config: AppConfig,
        adapters: Vec<Arc<dyn ProviderAdapter>>,
        notifier: Option<Arc<dyn MessagingChannel>>,
    ) -> Router {
        let gateway = GenerationGateway::new(
            adapters,
            Preprocessor::disabled(Client::new()),
            Client::new(),
            &config.provider,
        );
        router(AppState { gateway: Arc::new(gateway), notifier }, &config.server)
    }

    async fn call(app: Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value, String) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(body.map(|b| Body::from(b.to_string())).unwrap_or_else(Body::empty))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        let json = serde_json::from_str(&text).unwrap_or(Value::Null);
        (status, json, text)
    }

    fn order_body() -> Value {
        json!({
            "image_base64": format!("data:image/png;base64,{PNG_PIXEL}"),
            "name": "Claire",
            "contact": "claire@example.com",
            "order_details": "3 tiers",
            "selected_design": "standard",
        })
    }

    #[tokio::test]
    async fn liveness_endpoints() {
        let (status, _, text) = call(app_with(Vec::new(), None), "GET", "/", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(text.contains("running"));

        let (status, json, _) = call(app_with(Vec::new(), None), "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn generate_without_api_key_is_500() {
        let (status, json, _) =
            call(app_with(Vec::new(), None), "POST", "/generate", Some(json!({"etages": "3"}))).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(json["error"].as_str().unwrap().contains("IMAGE_API_KEY"));
    }

    #[tokio::test]
    async fn generate_pads_with_placeholders() {
        let app = app_with(vec![Arc::new(TimingOut) as Arc<dyn ProviderAdapter>], None);
        let (status, json, _) = call(
            app,
            "POST",
            "/generate",
            Some(json!({"etages": "3", "style": "classic", "event": "wedding", "guests": 80, "hasCustomTopper": false})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let images = json["images"].as_array().unwrap();
        assert_eq!(images.len(), 2);
        assert!(images.iter().all(|i| i.as_str().unwrap().starts_with("data:image/svg+xml;base64,")));
    }

    #[tokio::test]
    async fn blank_form_numbers_use_defaults() {
        let app = app_with(vec![Arc::new(TimingOut) as Arc<dyn ProviderAdapter>], None);
        let (status, json, _) = call(
            app,
            "POST",
            "/generate",
            Some(json!({"etages": "3", "guests": "", "hasCustomTopper": ""})),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{json}");
        assert_eq!(json["images"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn request_deadline_answers_json_504() {
        let mut config = empty_config();
        config.server.request_timeout = Duration::from_millis(100);
        let app = app_from(config, vec![Arc::new(Hanging) as Arc<dyn ProviderAdapter>], None);

        let (status, json, _) = call(app, "POST", "/generate", Some(json!({}))).await;
        assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
        assert!(json["error"].as_str().unwrap().contains("timed out"), "{json}");
    }

    #[tokio::test]
    async fn health_answers_while_workers_are_busy() {
        let mut config = empty_config();
        config.server.max_concurrent_requests = 1;
        let app = app_from(config, vec![Arc::new(Hanging) as Arc<dyn ProviderAdapter>], None);

        let busy = tokio::spawn(call(app.clone(), "POST", "/generate", Some(json!({}))));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let (status, json, _) = tokio::time::timeout(Duration::from_secs(2), call(app, "GET", "/health", None))
            .await
            .expect("health must not wait for a worker");
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "ok");
        busy.abort();
    }

    #[tokio::test]
    async fn generate_rejects_bad_reference_image() {
        let app = app_with(vec![Arc::new(TimingOut) as Arc<dyn ProviderAdapter>], None);
        let (status, json, _) = call(app, "POST", "/generate", Some(json!({"image_base64": "%%%"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["error"].as_str().unwrap().starts_with("Invalid image_base64"));
    }

    #[tokio::test]
    async fn malformed_json_is_400() {
        let request = Request::builder()
            .method("POST")
            .uri("/generate")
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let response = app_with(Vec::new(), None).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn send_order_missing_contact_is_400() {
        let mut body = order_body();
        body.as_object_mut().unwrap().remove("contact");
        let (status, json, _) = call(app_with(Vec::new(), None), "POST", "/send-order", Some(body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json, json!({"error": "Missing field: contact"}));
    }

    #[tokio::test]
    async fn send_order_blank_field_counts_as_missing() {
        let mut body = order_body();
        body["name"] = json!("  ");
        let (status, json, _) = call(app_with(Vec::new(), None), "POST", "/send-order", Some(body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"], "Missing field: name");
    }

    #[tokio::test]
    async fn send_order_without_channel_is_500() {
        let (status, json, _) = call(app_with(Vec::new(), None), "POST", "/send-order", Some(order_body())).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json["error"], MISSING_CHANNEL);
    }

    #[tokio::test]
    async fn send_order_forwards_submission() {
        let channel = Arc::new(RecordingChannel::default());
        let app = app_with(Vec::new(), Some(channel.clone() as Arc<dyn MessagingChannel>));
        let (status, json, _) = call(app, "POST", "/send-order", Some(order_body())).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json, json!({"success": true, "message_id": 99}));

        let sent = channel.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].contact, "claire@example.com");
        assert_eq!(sent[0].mime_type, "image/png");
    }
}
