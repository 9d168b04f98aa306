use zhconv::{zhconv, Variant};

pub fn strip_code_blocks(s: &str) -> String {
    let s = s.trim();
    if s.starts_with("```") {
        let body = s.trim_start_matches('`');
        // Drop a language tag such as ```text on the opening line.
        let body = match body.find('\n') {
            Some(pos) if !body[..pos].contains(' ') => &body[pos + 1..],
            _ => body,
        };
        body.trim_end().trim_end_matches("```").trim().to_string()
    } else {
        s.to_string()
    }
}

fn parse_variant(name: &str) -> Option<Variant> {
    match name.to_ascii_lowercase().as_str() {
        "zh-tw" => Some(Variant::ZhTW),
        "zh-hk" => Some(Variant::ZhHK),
        "zh-mo" => Some(Variant::ZhMO),
        "zh-hant" => Some(Variant::ZhHant),
        "zh-cn" => Some(Variant::ZhCN),
        "zh-sg" => Some(Variant::ZhSG),
        "zh-my" => Some(Variant::ZhMY),
        "zh-hans" => Some(Variant::ZhHans),
        _ => None,
    }
}

/// Converts Chinese text to the configured script. Unknown or absent variants leave the text untouched.
pub fn to_variant(text: &str, variant: Option<&str>) -> String {
    match variant.and_then(parse_variant) {
        Some(v) => zhconv(text, v),
        None => {
            if let Some(name) = variant {
                log::debug!("Unknown chinese variant '{}', leaving text as-is", name);
            }
            text.to_string()
        }
    }
}
