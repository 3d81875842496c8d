use crate::models::ImageRef;

const PALETTE: [&str; 3] = [
    "#C9A227", // gold
    "#B76E79", // rose gold
    "#8E9AAF", // slate
];

/// A labeled SVG stand-in for a design the provider failed to deliver.
pub fn placeholder_image(label: &str, slot: usize) -> ImageRef {
    let color = PALETTE[slot % PALETTE.len()];
    let title = match label {
        "standard" => "Classic design",
        "creative" => "Creative design",
        "edit" => "Your design",
        _ => "Cake design",
    };

    let svg = format!(r#"<svg width="512" height="512" xmlns="http://www.w3.org/2000/svg">
    <defs>
        <linearGradient id="grad" x1="0%" y1="0%" x2="100%" y2="100%">
            <stop offset="0%" style="stop-color:{color};stop-opacity:1" />
            <stop offset="100%" style="stop-color:{color};stop-opacity:0.55" />
        </linearGradient>
    </defs>
    <rect width="512" height="512" fill="url(#grad)" />
    <text x="256" y="230" font-family="Georgia, serif" font-size="30" font-weight="bold"
          text-anchor="middle" fill="white">Victoria · {title}</text>
    <text x="256" y="275" font-family="Arial, sans-serif" font-size="16"
          text-anchor="middle" fill="white" opacity="0.9">Image temporarily unavailable</text>
    <text x="256" y="305" font-family="Arial, sans-serif" font-size="13"
          text-anchor="middle" fill="white" opacity="0.8">Placeholder · please try again</text>
</svg>"#);

    ImageRef::Inline {
        data: svg.into_bytes().into(),
        mime_type: "image/svg+xml".to_string(),
    }
}
