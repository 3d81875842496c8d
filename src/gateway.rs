//! Orchestrates image generation for one order.
//!
//! Text-to-image orders get two images (standard, creative); orders with a
//! reference photo get one edited image. Each slot is filled by the first
//! adapter that succeeds; slots nobody could fill get a placeholder unless
//! strict mode is configured.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tokio::time::{timeout_at, Instant};
use tracing::{error, info, warn};

use crate::config::ProviderConfig;
use crate::media::download_image;
use crate::models::{GeneratedImage, GenerationRequest, GenerationResult, ImageRef, OrderConfiguration, Variant};
use crate::normalizer::NormalizationError;
use crate::placeholder::placeholder_image;
use crate::preprocess::Preprocessor;
use crate::prompt::{build_edit_prompt, build_prompt};
use crate::provider::{GenerationError, HttpProvider, ProviderAdapter};

pub const MISSING_API_KEY: &str =
    "IMAGE_API_KEY is not configured: image generation is unavailable";

pub const EDIT_LABEL: &str = "edit";

pub struct GenerationGateway {
    adapters: Vec<Arc<dyn ProviderAdapter>>,
    preprocessor: Preprocessor,
    client: Client,
    edit_strength: f32,
    placeholder_fallback: bool,
    deadline: Duration,
}

impl GenerationGateway {
    pub fn new(
        adapters: Vec<Arc<dyn ProviderAdapter>>,
        preprocessor: Preprocessor,
        client: Client,
        config: &ProviderConfig,
    ) -> Self {
        Self {
            adapters,
            preprocessor,
            client,
            edit_strength: config.edit_strength,
            placeholder_fallback: config.placeholder_fallback,
            deadline: config.generation_deadline,
        }
    }

    pub fn from_config(client: Client, provider: &ProviderConfig, preprocessor: Preprocessor) -> Self {
        let adapters = HttpProvider::from_config(&client, provider);
        Self::new(adapters, preprocessor, client, provider)
    }

    pub fn is_configured(&self) -> bool {
        !self.adapters.is_empty()
    }

    pub async fn generate(&self, config: &OrderConfiguration) -> Result<GenerationResult, GenerationError> {
        if !self.is_configured() {
            return Err(GenerationError::Configuration(MISSING_API_KEY.to_string()));
        }

        let deadline = Instant::now() + self.deadline;

        // translated copy; the caller's configuration stays untouched
        let mut order = config.clone();
        if let Some(wishes) = &config.wishes {
            let translated = timeout_at(deadline, self.preprocessor.translate(wishes)).await;
            order.wishes = Some(translated.unwrap_or_else(|_| wishes.clone()));
        }

        match &order.reference_image {
            Some(reference) => self.generate_edit(&order, reference.clone(), deadline).await,
            None => self.generate_variants(&order, deadline).await,
        }
    }

    async fn generate_variants(
        &self,
        order: &OrderConfiguration,
        deadline: Instant,
    ) -> Result<GenerationResult, GenerationError> {
        let standard = GenerationRequest::text(build_prompt(order, Variant::Standard));
        let creative = GenerationRequest::text(build_prompt(order, Variant::Creative));
        info!("🎂 Generating standard and creative designs");

        let (standard_result, creative_result) = tokio::join!(
            self.before(deadline, self.render(&standard)),
            self.before(deadline, self.render(&creative))
        );

        self.assemble(vec![
            (Variant::Standard.label(), standard_result),
            (Variant::Creative.label(), creative_result),
        ])
    }

    async fn generate_edit(
        &self,
        order: &OrderConfiguration,
        reference: bytes::Bytes,
        deadline: Instant,
    ) -> Result<GenerationResult, GenerationError> {
        let caption = timeout_at(deadline, self.preprocessor.describe(&reference))
            .await
            .unwrap_or(None);
        let prompt = build_edit_prompt(order.wishes.as_deref(), caption.as_deref());
        info!("🖌️ Editing reference image ({} bytes)", reference.len());

        let request = GenerationRequest::edit(prompt, reference, self.edit_strength);
        let result = self.before(deadline, self.render(&request)).await;
        self.assemble(vec![(EDIT_LABEL, result)])
    }

    /// Gives up on a slot once the order's deadline has passed.
    async fn before<F>(&self, deadline: Instant, render: F) -> Result<ImageRef, GenerationError>
    where
        F: Future<Output = Result<ImageRef, GenerationError>>,
    {
        timeout_at(deadline, render).await.unwrap_or_else(|_| {
            Err(GenerationError::Timeout(format!(
                "no image within the {}s generation deadline",
                self.deadline.as_secs()
            )))
        })
    }

    /// Fills every slot in order, padding failures with placeholders.
    fn assemble(
        &self,
        slots: Vec<(&'static str, Result<ImageRef, GenerationError>)>,
    ) -> Result<GenerationResult, GenerationError> {
        let mut result = GenerationResult::default();
        for (slot, (label, outcome)) in slots.into_iter().enumerate() {
            match outcome {
                Ok(image) => result.images.push(GeneratedImage {
                    label: label.to_string(),
                    image,
                    placeholder: false,
                }),
                Err(e) if !self.placeholder_fallback => return Err(e),
                Err(e) => {
                    warn!("📦 Using placeholder for {} design: {}", label, e);
                    result.failures.push(format!("{label}: {e}"));
                    result.images.push(GeneratedImage {
                        label: label.to_string(),
                        image: placeholder_image(label, slot),
                        placeholder: true,
                    });
                }
            }
        }
        Ok(result)
    }

    /// First image from the first adapter that delivers one.
    async fn render(&self, request: &GenerationRequest) -> Result<ImageRef, GenerationError> {
        let mut last_error: Option<GenerationError> = None;
        for adapter in &self.adapters {
            match adapter.generate(request).await {
                Ok(images) => match images.into_iter().next() {
                    Some(image) => return Ok(self.materialize(image).await),
                    None => {
                        warn!("Adapter {} returned no images", adapter.name());
                        last_error = Some(NormalizationError::NoImageData("empty result".into()).into());
                    }
                },
                Err(e) => {
                    error!("❌ Adapter {} failed: {}", adapter.name(), e);
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| GenerationError::Configuration(MISSING_API_KEY.to_string())))
    }

    /// Downloads provider-hosted images so the client gets self-contained data.
    async fn materialize(&self, image: ImageRef) -> ImageRef {
        match image {
            ImageRef::Url(url) => match download_image(&self.client, &url).await {
                Some((data, mime_type)) => ImageRef::Inline { data, mime_type },
                None => {
                    warn!("Keeping remote URL {}; download failed", url);
                    ImageRef::Url(url)
                }
            },
            inline => inline,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderMode;
    use crate::provider::tests::serve;
    use async_trait::async_trait;
    use axum::routing::get;
    use axum::Router;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn provider_config(placeholder_fallback: bool) -> ProviderConfig {
        ProviderConfig {
            api_key: Some("k".into()),
            endpoints: Vec::new(),
            mode: ProviderMode::Sync,
            model: None,
            poll_interval: Duration::from_millis(1),
            max_poll_attempts: 1,
            connect_retries: 0,
            retry_backoff: Duration::from_millis(1),
            request_timeout: Duration::from_secs(1),
            generation_deadline: Duration::from_secs(5),
            edit_strength: 0.55,
            placeholder_fallback,
        }
    }

    /// Adapter that answers from a fixed script and records what it was asked.
    struct ScriptedAdapter {
        name: String,
        outcome: fn() -> Result<Vec<ImageRef>, GenerationError>,
        calls: Mutex<Vec<GenerationRequest>>,
    }

    impl ScriptedAdapter {
        fn new(name: &str, outcome: fn() -> Result<Vec<ImageRef>, GenerationError>) -> Arc<Self> {
            Arc::new(Self { name: name.into(), outcome, calls: Mutex::new(Vec::new()) })
        }
    }

    #[async_trait]
    impl ProviderAdapter for ScriptedAdapter {
        fn name(&self) -> &str {
            &self.name
        }

        async fn generate(&self, request: &GenerationRequest) -> Result<Vec<ImageRef>, GenerationError> {
            self.calls.lock().push(request.clone());
            (self.outcome)()
        }
    }

    fn timeout() -> Result<Vec<ImageRef>, GenerationError> {
        Err(GenerationError::Timeout("job not finished after 30 polls".into()))
    }

    fn upstream() -> Result<Vec<ImageRef>, GenerationError> {
        Err(GenerationError::Upstream { status: 503, body: "busy".into() })
    }

    fn inline_png() -> Result<Vec<ImageRef>, GenerationError> {
        Ok(vec![
            ImageRef::Inline { data: bytes::Bytes::from_static(b"png"), mime_type: "image/png".into() },
            ImageRef::Inline { data: bytes::Bytes::from_static(b"extra"), mime_type: "image/png".into() },
        ])
    }

    /// Adapter that never answers.
    struct Hanging;

    #[async_trait]
    impl ProviderAdapter for Hanging {
        fn name(&self) -> &str {
            "hanging"
        }

        async fn generate(&self, _request: &GenerationRequest) -> Result<Vec<ImageRef>, GenerationError> {
            std::future::pending().await
        }
    }

    fn dynamic(adapter: &Arc<ScriptedAdapter>) -> Arc<dyn ProviderAdapter> {
        adapter.clone()
    }

    fn gateway(adapters: Vec<Arc<dyn ProviderAdapter>>, fallback: bool) -> GenerationGateway {
        GenerationGateway::new(
            adapters,
            Preprocessor::disabled(Client::new()),
            Client::new(),
            &provider_config(fallback),
        )
    }

    #[tokio::test]
    async fn always_timing_out_provider_yields_two_placeholders() {
        let adapter = ScriptedAdapter::new("slow", timeout);
        let gw = gateway(vec![dynamic(&adapter)], true);

        let result = gw.generate(&OrderConfiguration::default()).await.unwrap();
        assert_eq!(result.images.len(), 2);
        assert_eq!(result.placeholder_count(), 2);
        assert_eq!(
            result.images.iter().map(|i| i.label.as_str()).collect::<Vec<_>>(),
            vec!["standard", "creative"]
        );
        assert_eq!(result.failures.len(), 2);
        assert_eq!(adapter.calls.lock().len(), 2);
    }

    #[tokio::test]
    async fn variants_keep_order_and_prompts() {
        let adapter = ScriptedAdapter::new("ok", inline_png);
        let gw = gateway(vec![dynamic(&adapter)], true);
        let order = OrderConfiguration { style: "rustic".into(), ..Default::default() };

        let result = gw.generate(&order).await.unwrap();
        assert_eq!(result.images.len(), 2);
        assert_eq!(result.placeholder_count(), 0);

        let calls = adapter.calls.lock();
        let prompts: Vec<&str> = calls.iter().map(|c| c.prompt.as_str()).collect();
        assert!(prompts.contains(&build_prompt(&order, Variant::Standard).as_str()));
        assert!(prompts.contains(&build_prompt(&order, Variant::Creative).as_str()));
        assert!(calls.iter().all(|c| c.source_image.is_none() && c.strength.is_none()));
    }

    #[tokio::test]
    async fn falls_through_to_next_adapter() {
        let broken = ScriptedAdapter::new("broken", upstream);
        let healthy = ScriptedAdapter::new("healthy", inline_png);
        let gw = gateway(vec![dynamic(&broken), dynamic(&healthy)], true);

        let result = gw.generate(&OrderConfiguration::default()).await.unwrap();
        assert_eq!(result.placeholder_count(), 0);
        assert_eq!(broken.calls.lock().len(), 2);
        assert_eq!(healthy.calls.lock().len(), 2);
    }

    #[tokio::test]
    async fn first_success_short_circuits() {
        let first = ScriptedAdapter::new("first", inline_png);
        let second = ScriptedAdapter::new("second", upstream);
        let gw = gateway(vec![dynamic(&first), dynamic(&second)], true);

        gw.generate(&OrderConfiguration::default()).await.unwrap();
        assert!(second.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn strict_mode_surfaces_failure() {
        let gw = gateway(vec![dynamic(&ScriptedAdapter::new("slow", timeout))], false);
        let err = gw.generate(&OrderConfiguration::default()).await.unwrap_err();
        assert!(matches!(err, GenerationError::Timeout(_)));
    }

    #[tokio::test]
    async fn edit_mode_sends_reference_once() {
        let adapter = ScriptedAdapter::new("ok", inline_png);
        let gw = gateway(vec![dynamic(&adapter)], true);
        let order = OrderConfiguration {
            wishes: Some("make it pink".into()),
            reference_image: Some(bytes::Bytes::from_static(b"photo")),
            ..Default::default()
        };

        let result = gw.generate(&order).await.unwrap();
        assert_eq!(result.images.len(), 1);
        assert_eq!(result.images[0].label, EDIT_LABEL);

        let calls = adapter.calls.lock();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].source_image.as_deref(), Some(&b"photo"[..]));
        assert_eq!(calls[0].strength, Some(0.55));
        assert!(calls[0].prompt.starts_with("make it pink."));
        assert!(calls[0].prompt.contains("NICE, FRANCE"));
    }

    #[tokio::test]
    async fn edit_mode_failure_pads_single_placeholder() {
        let gw = gateway(vec![dynamic(&ScriptedAdapter::new("slow", timeout))], true);
        let order = OrderConfiguration {
            reference_image: Some(bytes::Bytes::from_static(b"photo")),
            ..Default::default()
        };
        let result = gw.generate(&order).await.unwrap();
        assert_eq!(result.images.len(), 1);
        assert!(result.images[0].placeholder);
    }

    #[tokio::test]
    async fn deadline_turns_hanging_provider_into_placeholders() {
        let mut config = provider_config(true);
        config.generation_deadline = Duration::from_millis(50);
        let gw = GenerationGateway::new(
            vec![Arc::new(Hanging) as Arc<dyn ProviderAdapter>],
            Preprocessor::disabled(Client::new()),
            Client::new(),
            &config,
        );

        let result = tokio::time::timeout(Duration::from_secs(5), gw.generate(&OrderConfiguration::default()))
            .await
            .expect("gateway must honor its deadline")
            .unwrap();
        assert_eq!(result.placeholder_count(), 2);
        assert!(result.failures.iter().all(|f| f.contains("deadline")), "{:?}", result.failures);
    }

    #[tokio::test]
    async fn missing_adapters_is_configuration_error() {
        let gw = gateway(Vec::new(), true);
        let err = gw.generate(&OrderConfiguration::default()).await.unwrap_err();
        assert!(err.to_string().contains("IMAGE_API_KEY"));
    }

    #[tokio::test]
    async fn remote_urls_are_downloaded_inline() {
        let app = Router::new().route(
            "/img.png",
            get(|| async { ([(axum::http::header::CONTENT_TYPE, "image/png")], b"pngdata".to_vec()) }),
        );
        let base = serve(app).await;
        let gw = gateway(Vec::new(), true);

        let inline = gw.materialize(ImageRef::Url(format!("{base}/img.png"))).await;
        assert_eq!(
            inline,
            ImageRef::Inline { data: bytes::Bytes::from_static(b"pngdata"), mime_type: "image/png".into() }
        );

        let missing = format!("{base}/missing.png");
        assert_eq!(gw.materialize(ImageRef::Url(missing.clone())).await, ImageRef::Url(missing));
    }
}
