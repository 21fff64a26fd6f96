//! Stereo fold-down filters for surround layouts.
//!
//! Center is weighted up to keep dialogue forward; LFE is mixed in at reduced
//! level. Channel names must exist in the input layout or ffmpeg's `pan`
//! filter rejects the graph, so each layout gets its own expression.

/// `pan` filter folding `layout` down to stereo, or `None` if the layout is
/// not supported.
pub fn stereo_pan_filter(layout: &str) -> Option<String> {
    let layout = layout.trim().to_lowercase();
    let filter = match layout.as_str() {
        "5.1" => five_one("BL", "BR"),
        "5.1(side)" => five_one("SL", "SR"),
        "7.1" => "pan=stereo|\
                  FL=0.85*FL+1.0*FC+0.75*LFE+0.2*BL+0.2*SL|\
                  FR=0.85*FR+1.0*FC+0.75*LFE+0.2*BR+0.2*SR"
            .to_string(),
        _ => return None,
    };
    Some(filter)
}

fn five_one(left_surround: &str, right_surround: &str) -> String {
    format!(
        "pan=stereo|FL=0.9*FL+1.1*FC+0.75*LFE+0.25*{ls}|FR=0.9*FR+1.1*FC+0.75*LFE+0.25*{rs}",
        ls = left_surround,
        rs = right_surround
    )
}
