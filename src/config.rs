//! Service configuration, read once at startup.
//!
//! Every credential lives in [`AppConfig`] and is handed to the components that
//! need it. Missing credentials never stop the process: the endpoint that needs
//! them answers with a 500 naming the missing key instead.

use std::time::Duration;

pub const DEFAULT_IMAGE_API_URL: &str = "https://api.replicate.com/v1/predictions";
pub const DEFAULT_TELEGRAM_API_BASE: &str = "https://api.telegram.org";
pub const DEFAULT_WHATSAPP_API_BASE: &str = "https://graph.facebook.com/v19.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderMode {
    /// The POST answers with the image (bytes or JSON).
    Sync,
    /// The POST answers with a job descriptor that must be polled.
    Poll,
}

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub api_key: Option<String>,
    /// Ordered endpoint list, tried first to last.
    pub endpoints: Vec<String>,
    pub mode: ProviderMode,
    pub model: Option<String>,
    pub poll_interval: Duration,
    pub max_poll_attempts: u32,
    pub connect_retries: u32,
    pub retry_backoff: Duration,
    pub request_timeout: Duration,
    /// Time the gateway may spend on one order before unfilled slots are
    /// given up on.
    pub generation_deadline: Duration,
    pub edit_strength: f32,
    pub placeholder_fallback: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Telegram,
    WhatsApp,
}

#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub bot_token: String,
    pub chat_id: String,
    pub api_base: String,
}

#[derive(Debug, Clone)]
pub struct WhatsAppConfig {
    pub token: String,
    pub phone_id: String,
    pub recipient: String,
    pub api_base: String,
}

#[derive(Debug, Clone, Default)]
pub struct MessagingConfig {
    /// Explicit channel choice; `None` picks whichever channel is configured.
    pub channel: Option<ChannelKind>,
    pub telegram: Option<TelegramConfig>,
    pub whatsapp: Option<WhatsAppConfig>,
}

impl MessagingConfig {
    /// The channel `/send-order` should use, if its credentials are present.
    pub fn active_channel(&self) -> Option<ChannelKind> {
        match self.channel {
            Some(ChannelKind::Telegram) => self.telegram.as_ref().map(|_| ChannelKind::Telegram),
            Some(ChannelKind::WhatsApp) => self.whatsapp.as_ref().map(|_| ChannelKind::WhatsApp),
            None if self.telegram.is_some() => Some(ChannelKind::Telegram),
            None if self.whatsapp.is_some() => Some(ChannelKind::WhatsApp),
            None => None,
        }
    }
}

/// An optional HTTP collaborator (translation, captioning).
#[derive(Debug, Clone)]
pub struct ServiceEndpoint {
    pub url: String,
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct PreprocessConfig {
    pub translate: Option<ServiceEndpoint>,
    pub caption: Option<ServiceEndpoint>,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub max_concurrent_requests: usize,
    pub request_timeout: Duration,
    pub max_body_bytes: usize,
    pub json_logs: bool,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub provider: ProviderConfig,
    pub messaging: MessagingConfig,
    pub preprocess: PreprocessConfig,
}

impl AppConfig {
    /// Loads `.env` (if any) and reads the process environment.
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let endpoints = get("IMAGE_API_URL")
            .map(|v| split_list(&v))
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| vec![DEFAULT_IMAGE_API_URL.to_string()]);

        let mode = match get("IMAGE_API_MODE").as_deref().map(str::to_ascii_lowercase).as_deref() {
            Some("poll") | Some("async") => ProviderMode::Poll,
            _ => ProviderMode::Sync,
        };

        let provider = ProviderConfig {
            api_key: get("IMAGE_API_KEY"),
            endpoints,
            mode,
            model: get("IMAGE_API_MODEL"),
            poll_interval: Duration::from_millis(parse_or(get("IMAGE_POLL_INTERVAL_MS"), 2_000)),
            max_poll_attempts: parse_or(get("IMAGE_POLL_MAX_ATTEMPTS"), 30),
            connect_retries: parse_or(get("IMAGE_CONNECT_RETRIES"), 2),
            retry_backoff: Duration::from_millis(parse_or(get("IMAGE_RETRY_BACKOFF_MS"), 1_000)),
            request_timeout: Duration::from_secs(parse_or(get("IMAGE_REQUEST_TIMEOUT_SECS"), 60)),
            generation_deadline: Duration::from_secs(
                parse_or(get("IMAGE_GENERATION_DEADLINE_SECS"), 110_u64).clamp(1, MAX_DEADLINE_SECS),
            ),
            edit_strength: parse_or(get("IMAGE_EDIT_STRENGTH"), 0.55_f32).clamp(0.0, 1.0),
            placeholder_fallback: parse_bool_or(get("PLACEHOLDER_FALLBACK"), true),
        };

        let telegram = match (get("TELEGRAM_BOT_TOKEN"), get("TELEGRAM_CHAT_ID")) {
            (Some(bot_token), Some(chat_id)) => Some(TelegramConfig {
                bot_token,
                chat_id,
                api_base: get("TELEGRAM_API_BASE").unwrap_or_else(|| DEFAULT_TELEGRAM_API_BASE.to_string()),
            }),
            _ => None,
        };

        let whatsapp = match (get("WHATSAPP_TOKEN"), get("WHATSAPP_PHONE_ID"), get("WHATSAPP_RECIPIENT")) {
            (Some(token), Some(phone_id), Some(recipient)) => Some(WhatsAppConfig {
                token,
                phone_id,
                recipient,
                api_base: get("WHATSAPP_API_BASE").unwrap_or_else(|| DEFAULT_WHATSAPP_API_BASE.to_string()),
            }),
            _ => None,
        };

        let channel = match get("MESSAGING_CHANNEL").map(|v| v.to_ascii_lowercase()).as_deref() {
            Some("telegram") => Some(ChannelKind::Telegram),
            Some("whatsapp") => Some(ChannelKind::WhatsApp),
            _ => None,
        };

        let service = |url_key: &str, key_key: &str| {
            get(url_key).map(|url| ServiceEndpoint { url, api_key: get(key_key) })
        };

        let server = ServerConfig {
            port: parse_or(get("PORT"), 10_000),
            max_concurrent_requests: parse_or(get("MAX_CONCURRENT_REQUESTS"), 4_usize).max(1),
            // the whole-request deadline must leave the gateway room to pad with placeholders
            request_timeout: Duration::from_secs(
                parse_or(get("REQUEST_TIMEOUT_SECS"), 120_u64).clamp(1, MAX_DEADLINE_SECS),
            )
            .max(provider.generation_deadline + DEADLINE_GRACE),
            max_body_bytes: parse_or(get("MAX_BODY_BYTES"), 20 * 1024 * 1024),
            json_logs: get("LOG_FORMAT").is_some_and(|v| v.eq_ignore_ascii_case("json")),
        };

        Self {
            server,
            provider,
            messaging: MessagingConfig { channel, telegram, whatsapp },
            preprocess: PreprocessConfig {
                translate: service("TRANSLATE_API_URL", "TRANSLATE_API_KEY"),
                caption: service("CAPTION_API_URL", "CAPTION_API_KEY"),
            },
        }
    }
}

const MAX_DEADLINE_SECS: u64 = 24 * 60 * 60;
const DEADLINE_GRACE: Duration = Duration::from_secs(5);

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_or<T: std::str::FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn parse_bool_or(value: Option<String>, default: bool) -> bool {
    match value.map(|v| v.to_ascii_lowercase()).as_deref() {
        Some("true") | Some("1") | Some("yes") => true,
        Some("false") | Some("0") | Some("no") => false,
        _ => default,
    }
}
