//! Turns an order form into image-generation prompts.
//!
//! Pure and deterministic: the same configuration always produces the same
//! text. Missing fields fall back to the defaults below.

use crate::models::{OrderConfiguration, Variant};

pub const DEFAULT_TIERS: &str = "3";
pub const DEFAULT_STYLE: &str = "classic elegant";
pub const DEFAULT_EVENT: &str = "wedding";
pub const DEFAULT_GUESTS: u32 = 100;

pub const BRAND_NAME: &str = "Victoria";
pub const BRAND_LOCATION: &str = "NICE, FRANCE";

const SCENE: &str = "The cake stands on a white Carrara marble table, with a softly blurred \
Mediterranean coastline of the Côte d'Azur in the background. Professional food photography, \
photorealistic, ultra-detailed, soft natural daylight, shallow depth of field, 8k.";

const CREATIVE_SUFFIX: &str = " Creative interpretation: reimagine the design with artistic \
sugar flowers, unexpected textures and a bold, original silhouette while keeping it refined \
and luxurious.";

const BRANDING_PRESERVATION: &str = "Keep the golden \"Victoria\" cake topper and the \
\"NICE, FRANCE\" engraving exactly as they appear in the original photo.";

const PHOTOREALISM_PRESERVATION: &str = "Preserve the photorealistic style, lighting, \
perspective and proportions of the original photograph; the result must look like a real cake.";

const DEFAULT_EDIT_INSTRUCTION: &str = "Refine this cake design into an elegant luxury wedding cake";

pub fn topper_clause() -> String {
    format!(
        "topped with an elegant golden cake topper engraved with the text \"{BRAND_NAME}\" and \"{BRAND_LOCATION}\""
    )
}

pub fn engraving_clause() -> String {
    format!(
        "presented on a white marble base engraved with the text \"{BRAND_NAME}\" and \"{BRAND_LOCATION}\""
    )
}

fn or_default<'a>(value: &'a str, default: &'a str) -> &'a str {
    let trimmed = value.trim();
    if trimmed.is_empty() { default } else { trimmed }
}

fn tier_phrase(tiers: &str) -> String {
    let tiers = or_default(tiers, DEFAULT_TIERS);
    match tiers.parse::<u32>() {
        Ok(1) => "single-tier".to_string(),
        Ok(n) => format!("{n}-tier"),
        Err(_) => tiers.to_string(),
    }
}

/// Builds the prompt for one variant. `Creative` is the standard prompt plus a suffix.
pub fn build_prompt(config: &OrderConfiguration, variant: Variant) -> String {
    let guests = config.guests.filter(|g| *g > 0).unwrap_or(DEFAULT_GUESTS);

    let mut prompt = format!(
        "A luxurious {} {} style {} cake, designed to serve {} guests",
        tier_phrase(&config.tiers),
        or_default(&config.style, DEFAULT_STYLE),
        or_default(&config.event, DEFAULT_EVENT),
        guests,
    );

    if let Some(date) = config.date.as_deref().map(str::trim).filter(|d| !d.is_empty()) {
        prompt.push_str(&format!(", for a celebration on {date}"));
    }

    // exactly one branding clause
    prompt.push_str(", ");
    if config.custom_topper {
        prompt.push_str(&engraving_clause());
    } else {
        prompt.push_str(&topper_clause());
    }
    prompt.push('.');

    if let Some(text) = config.inscription.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
        prompt.push_str(&format!(" The cake carries the inscription \"{text}\" written in fine icing."));
    }

    if let Some(wishes) = config.wishes.as_deref().map(str::trim).filter(|w| !w.is_empty()) {
        prompt.push_str(&format!(" Additional wishes: {wishes}."));
    }

    prompt.push(' ');
    prompt.push_str(SCENE);

    if variant == Variant::Creative {
        prompt.push_str(CREATIVE_SUFFIX);
    }
    prompt
}

/// Prompt for editing a customer's reference photo.
///
/// `instruction` is the (already translated) free-text wish; `caption` is an
/// optional description of the reference image.
pub fn build_edit_prompt(instruction: Option<&str>, caption: Option<&str>) -> String {
    let instruction = instruction
        .map(str::trim)
        .filter(|i| !i.is_empty())
        .unwrap_or(DEFAULT_EDIT_INSTRUCTION);
    let instruction = instruction.trim_end_matches('.');

    let mut prompt = format!("{instruction}.");
    if let Some(caption) = caption.map(str::trim).filter(|c| !c.is_empty()) {
        prompt.push_str(&format!(" The original photo shows {}.", caption.trim_end_matches('.')));
    }
    prompt.push(' ');
    prompt.push_str(BRANDING_PRESERVATION);
    prompt.push(' ');
    prompt.push_str(PHOTOREALISM_PRESERVATION);
    prompt
}
