//! Forwards a confirmed order (chosen design + customer details) to the
//! bakery's messaging channel.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{error, info};

use crate::config::{ChannelKind, MessagingConfig, TelegramConfig, WhatsAppConfig};
use crate::media::truncate_for_log;
use crate::models::{MessageId, OrderSubmission};

/// Telegram rejects photo captions longer than this.
pub const CAPTION_LIMIT: usize = 1024;

const SEND_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("messaging request failed: {0}")]
    Transport(reqwest::Error),
    #[error("messaging API answered HTTP {status}: {body}")]
    Api { status: u16, body: String },
    #[error("messaging API rejected the order: {0}")]
    Rejected(String),
}

// request URLs can carry credentials (Telegram puts the bot token in the path)
impl From<reqwest::Error> for NotifyError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.without_url())
    }
}

#[async_trait]
pub trait MessagingChannel: Send + Sync {
    fn name(&self) -> &'static str;

    async fn send(&self, order: &OrderSubmission) -> Result<MessageId, NotifyError>;
}

/// Builds the channel `/send-order` should use, or `None` when no channel is configured.
pub fn channel_from_config(client: &Client, config: &MessagingConfig) -> Option<Arc<dyn MessagingChannel>> {
    match config.active_channel()? {
        ChannelKind::Telegram => config
            .telegram
            .clone()
            .map(|cfg| Arc::new(TelegramChannel::new(client.clone(), cfg)) as Arc<dyn MessagingChannel>),
        ChannelKind::WhatsApp => config
            .whatsapp
            .clone()
            .map(|cfg| Arc::new(WhatsAppChannel::new(client.clone(), cfg)) as Arc<dyn MessagingChannel>),
    }
}

pub fn format_caption(order: &OrderSubmission) -> String {
    let caption = format!(
        "🎂 New cake order\n👤 Name: {}\n📞 Contact: {}\n🎨 Design: {}\n\n📝 {}",
        order.name.trim(),
        order.contact.trim(),
        order.selected_design.trim(),
        order.order_details.trim(),
    );
    if caption.chars().count() <= CAPTION_LIMIT {
        return caption;
    }
    let mut cut: String = caption.chars().take(CAPTION_LIMIT - 1).collect();
    cut.push('…');
    cut
}

fn file_name(mime_type: &str) -> String {
    let ext = mime_type.split('/').nth(1).unwrap_or("png");
    let ext = match ext {
        "jpeg" => "jpg",
        "svg+xml" => "svg",
        other => other,
    };
    format!("cake-design.{ext}")
}

fn image_part(order: &OrderSubmission) -> Result<Part, NotifyError> {
    Ok(Part::bytes(order.image.to_vec())
        .file_name(file_name(&order.mime_type))
        .mime_str(&order.mime_type)?)
}

async fn read_json(response: reqwest::Response) -> Result<Value, NotifyError> {
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        error!("❌ Messaging API error {}: {}", status, truncate_for_log(&body, 500));
        return Err(NotifyError::Api { status: status.as_u16(), body: truncate_for_log(&body, 500) });
    }
    serde_json::from_str(&body).map_err(|e| NotifyError::Rejected(format!("unreadable answer: {e}")))
}

pub struct TelegramChannel {
    client: Client,
    config: TelegramConfig,
}

#[derive(Debug, Deserialize)]
struct TelegramEnvelope {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    result: Option<TelegramMessage>,
}

#[derive(Debug, Deserialize)]
struct TelegramMessage {
    message_id: i64,
}

impl TelegramChannel {
    pub fn new(client: Client, config: TelegramConfig) -> Self {
        Self { client, config }
    }
}

#[async_trait]
impl MessagingChannel for TelegramChannel {
    fn name(&self) -> &'static str {
        "telegram"
    }

    async fn send(&self, order: &OrderSubmission) -> Result<MessageId, NotifyError> {
        let url = format!(
            "{}/bot{}/sendPhoto",
            self.config.api_base.trim_end_matches('/'),
            self.config.bot_token
        );
        let form = Form::new()
            .text("chat_id", self.config.chat_id.clone())
            .text("caption", format_caption(order))
            .part("photo", image_part(order)?);

        let response = self.client.post(&url).timeout(SEND_TIMEOUT).multipart(form).send().await?;
        // Telegram reports errors as JSON with ok=false, often alongside a 4xx
        let status = response.status();
        let body = response.text().await?;
        let envelope: TelegramEnvelope = serde_json::from_str(&body).map_err(|_| NotifyError::Api {
            status: status.as_u16(),
            body: truncate_for_log(&body, 500),
        })?;

        match envelope {
            TelegramEnvelope { ok: true, result: Some(message), .. } => {
                info!("📨 Order sent to Telegram chat {} (message {})", self.config.chat_id, message.message_id);
                Ok(MessageId::Numeric(message.message_id))
            }
            TelegramEnvelope { description, .. } => {
                let reason = description.unwrap_or_else(|| format!("HTTP {status}"));
                error!("❌ Telegram rejected order: {}", reason);
                Err(NotifyError::Rejected(reason))
            }
        }
    }
}

pub struct WhatsAppChannel {
    client: Client,
    config: WhatsAppConfig,
}

impl WhatsAppChannel {
    pub fn new(client: Client, config: WhatsAppConfig) -> Self {
        Self { client, config }
    }

    fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}/{}",
            self.config.api_base.trim_end_matches('/'),
            self.config.phone_id,
            path
        )
    }

    async fn upload_media(&self, order: &OrderSubmission) -> Result<String, NotifyError> {
        let form = Form::new()
            .text("messaging_product", "whatsapp")
            .text("type", order.mime_type.clone())
            .part("file", image_part(order)?);
        let response = self
            .client
            .post(self.endpoint("media"))
            .bearer_auth(&self.config.token)
            .timeout(SEND_TIMEOUT)
            .multipart(form)
            .send()
            .await?;
        let body = read_json(response).await?;
        body.get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| NotifyError::Rejected("media upload returned no id".into()))
    }
}

#[async_trait]
impl MessagingChannel for WhatsAppChannel {
    fn name(&self) -> &'static str {
        "whatsapp"
    }

    async fn send(&self, order: &OrderSubmission) -> Result<MessageId, NotifyError> {
        let media_id = self.upload_media(order).await?;
        info!("📤 Uploaded design to WhatsApp (media {})", media_id);

        let payload = json!({
            "messaging_product": "whatsapp",
            "to": self.config.recipient,
            "type": "image",
            "image": {"id": media_id, "caption": format_caption(order)},
        });
        let response = self
            .client
            .post(self.endpoint("messages"))
            .bearer_auth(&self.config.token)
            .timeout(SEND_TIMEOUT)
            .json(&payload)
            .send()
            .await?;
        let body = read_json(response).await?;
        let message_id = body
            .pointer("/messages/0/id")
            .and_then(Value::as_str)
            .ok_or_else(|| NotifyError::Rejected("message send returned no id".into()))?;
        info!("📨 Order sent to WhatsApp {} (message {})", self.config.recipient, message_id);
        Ok(MessageId::Text(message_id.to_string()))
    }
}
