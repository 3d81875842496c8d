use std::fmt::Display;
use std::str::FromStr;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use serde_with::{serde_as, DeserializeAs, DisplayFromStr, PickFirst, Same};

use crate::media::{decode_base64_payload, detect_mime_type, to_data_url};

/// `POST /generate` body as sent by the order form.
#[serde_as]
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GenerateRequest {
    #[serde(default)]
    pub etages: Option<serde_json::Value>, // "3" or 3
    #[serde(default)]
    pub style: Option<String>,
    #[serde(default)]
    pub event: Option<String>,
    #[serde_as(as = "FormValue")]
    #[serde(default)]
    pub guests: Option<u32>,
    #[serde_as(as = "FormValue")]
    #[serde(default, rename = "hasCustomTopper")]
    pub has_custom_topper: Option<bool>,
    #[serde(default)]
    pub inscription: Option<String>,
    #[serde(default)]
    pub wishes: Option<String>,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub image_base64: Option<String>,
}

/// A form value sent either natively (`80`, `true`) or as text (`"80"`).
/// Empty, blank and unparsable values read as absent so the documented
/// default applies.
struct FormValue;

impl<'de, T> DeserializeAs<'de, Option<T>> for FormValue
where
    T: DeserializeOwned + FromStr,
    T::Err: Display,
{
    fn deserialize_as<D>(deserializer: D) -> Result<Option<T>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Option::<Value>::deserialize(deserializer)?;
        Ok(match value {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) if s.trim().is_empty() => None,
            Some(Value::String(s)) => s.trim().parse().ok(),
            Some(other) => {
                let parsed: Result<T, serde_json::Error> = PickFirst::<(Same, DisplayFromStr)>::deserialize_as(other);
                parsed.ok()
            }
        })
    }
}

/// What the customer configured. Built once per request and never mutated.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OrderConfiguration {
    pub tiers: String,
    pub style: String,
    pub event: String,
    pub guests: Option<u32>,
    pub custom_topper: bool,
    pub inscription: Option<String>,
    pub wishes: Option<String>,
    pub date: Option<String>,
    pub reference_image: Option<Bytes>,
}

impl TryFrom<GenerateRequest> for OrderConfiguration {
    type Error = base64::DecodeError;

    fn try_from(req: GenerateRequest) -> Result<Self, Self::Error> {
        let reference_image = match non_blank(req.image_base64) {
            Some(encoded) => Some(decode_base64_payload(&encoded)?),
            None => None,
        };
        let tiers = match req.etages {
            Some(serde_json::Value::String(s)) => s.trim().to_string(),
            Some(serde_json::Value::Number(n)) => n.to_string(),
            _ => String::new(),
        };
        Ok(Self {
            tiers,
            style: non_blank(req.style).unwrap_or_default(),
            event: non_blank(req.event).unwrap_or_default(),
            guests: req.guests.filter(|g| *g > 0),
            custom_topper: req.has_custom_topper.unwrap_or(false),
            inscription: non_blank(req.inscription),
            wishes: non_blank(req.wishes),
            date: non_blank(req.date),
            reference_image,
        })
    }
}

pub(crate) fn non_blank(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Variant {
    Standard,
    Creative,
}

impl Variant {
    pub const ALL: [Variant; 2] = [Variant::Standard, Variant::Creative];

    pub fn label(self) -> &'static str {
        match self {
            Variant::Standard => "standard",
            Variant::Creative => "creative",
        }
    }
}

/// One call to the image provider.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub source_image: Option<Bytes>,
    pub strength: Option<f32>,
}

impl GenerationRequest {
    pub fn text(prompt: String) -> Self {
        Self { prompt, source_image: None, strength: None }
    }

    pub fn edit(prompt: String, source_image: Bytes, strength: f32) -> Self {
        Self { prompt, source_image: Some(source_image), strength: Some(strength) }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ImageRef {
    Inline { data: Bytes, mime_type: String },
    Url(String),
}

impl ImageRef {
    pub fn inline(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        let mime_type = detect_mime_type(&data);
        ImageRef::Inline { data, mime_type }
    }

    /// Data URL for inline images, the URL itself otherwise.
    pub fn to_client_string(&self) -> String {
        match self {
            ImageRef::Inline { data, mime_type } => to_data_url(mime_type, data),
            ImageRef::Url(url) => url.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedImage {
    pub label: String,
    pub image: ImageRef,
    pub placeholder: bool,
}

/// Images in request order (standard, creative) or the single edit result.
#[derive(Debug, Clone, Default)]
pub struct GenerationResult {
    pub images: Vec<GeneratedImage>,
    /// Failures that were replaced by placeholders.
    pub failures: Vec<String>,
}

impl GenerationResult {
    pub fn placeholder_count(&self) -> usize {
        self.images.iter().filter(|i| i.placeholder).count()
    }
}

#[derive(Debug, Serialize)]
pub struct GenerateResponse {
    pub images: Vec<String>,
}

impl From<&GenerationResult> for GenerateResponse {
    fn from(result: &GenerationResult) -> Self {
        Self { images: result.images.iter().map(|i| i.image.to_client_string()).collect() }
    }
}

/// `POST /send-order` body. Every field is required; presence is checked by the handler.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SendOrderRequest {
    #[serde(default)]
    pub image_base64: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub contact: Option<String>,
    #[serde(default)]
    pub order_details: Option<String>,
    #[serde(default)]
    pub selected_design: Option<String>,
}

/// A finalized order on its way to the bakery.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderSubmission {
    pub image: Bytes,
    pub mime_type: String,
    pub name: String,
    pub contact: String,
    pub order_details: String,
    pub selected_design: String,
}

/// Telegram answers with an integer id, WhatsApp with a string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageId {
    Numeric(i64),
    Text(String),
}

#[derive(Debug, Serialize)]
pub struct SendOrderResponse {
    pub success: bool,
    pub message_id: MessageId,
}
