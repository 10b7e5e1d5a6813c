use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use gemlens_contracts::response::{Part, RawModelResponse};
use image::DynamicImage;
use serde_json::Value;

/// Everything harvested from one upstream response.
#[derive(Debug, Clone, Default)]
pub struct Extraction {
    pub text: String,
    pub reasoning: String,
    pub images: Vec<DynamicImage>,
    pub parse_errors: Vec<String>,
}

impl Extraction {
    pub fn first_image(&self) -> Option<&DynamicImage> {
        self.images.first()
    }
}

/// Typed failure of [`extract_json`]; `raw_text` is the input, untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionFailure {
    pub reason: String,
    pub raw_text: String,
}

pub fn extract(raw: &RawModelResponse) -> Extraction {
    let mut out = Extraction::default();
    match raw {
        RawModelResponse::TextOnly { text } | RawModelResponse::Placeholder { text } => {
            out.text = text.clone();
        }
        RawModelResponse::CandidateList(candidates) => {
            for (idx, candidate) in candidates.iter().enumerate() {
                let Some(content) = candidate.content.as_ref() else {
                    continue;
                };
                if out.text.is_empty() {
                    let direct = content
                        .text
                        .as_deref()
                        .filter(|text| !text.trim().is_empty())
                        .map(str::to_string);
                    if let Some(text) = direct.or_else(|| answer_text(&content.parts)) {
                        out.text = text;
                        out.reasoning = thought_text(&content.parts);
                    }
                }
                collect_part_images(&content.parts, &format!("candidate {idx}"), &mut out);
            }
        }
        RawModelResponse::PartList(parts) => {
            if let Some(text) = answer_text(parts) {
                out.text = text;
                out.reasoning = thought_text(parts);
            }
            collect_part_images(parts, "response", &mut out);
        }
        RawModelResponse::GeneratedImageList(rows) => {
            for (idx, row) in rows.iter().enumerate() {
                match decode_image(&row.data) {
                    Ok(image) => out.images.push(image),
                    Err(reason) => out
                        .parse_errors
                        .push(format!("generated image {idx}: {reason}")),
                }
            }
        }
    }
    out
}

fn answer_text(parts: &[Part]) -> Option<String> {
    let joined = parts
        .iter()
        .filter(|part| !part.thought)
        .filter_map(|part| part.text.as_deref())
        .collect::<String>();
    (!joined.trim().is_empty()).then_some(joined)
}

fn thought_text(parts: &[Part]) -> String {
    parts
        .iter()
        .filter(|part| part.thought)
        .filter_map(|part| part.text.as_deref())
        .collect::<String>()
}

fn collect_part_images(parts: &[Part], scope: &str, out: &mut Extraction) {
    for (idx, part) in parts.iter().enumerate() {
        let Some(inline) = part.inline_data.as_ref() else {
            continue;
        };
        match decode_image(&inline.data) {
            Ok(image) => out.images.push(image),
            Err(reason) => out
                .parse_errors
                .push(format!("{scope} part {idx}: {reason}")),
        }
    }
}

pub fn decode_image(encoded: &str) -> Result<DynamicImage, String> {
    let bytes = decode_base64(encoded)?;
    image::load_from_memory(&bytes).map_err(|err| format!("image decode failed: {err}"))
}

/// Decodes standard base64, tolerating a `data:...;base64,` prefix and
/// embedded whitespace.
pub fn decode_base64(encoded: &str) -> Result<Vec<u8>, String> {
    let payload = match encoded.find("base64,") {
        Some(idx) => &encoded[idx + "base64,".len()..],
        None => encoded,
    };
    let compact: String = payload.chars().filter(|ch| !ch.is_whitespace()).collect();
    if compact.is_empty() {
        return Err("empty base64 payload".to_string());
    }
    BASE64
        .decode(compact.as_bytes())
        .map_err(|err| format!("base64 decode failed: {err}"))
}

/// Inner contents of every ``` fenced block, in order. An optional language
/// tag on the opening fence line is dropped.
pub fn fenced_blocks(text: &str) -> Vec<&str> {
    let mut blocks = Vec::new();
    let mut rest = text;
    while let Some(open) = rest.find("```") {
        let after_open = &rest[open + 3..];
        let Some(close) = after_open.find("```") else {
            break;
        };
        let body = &after_open[..close];
        let body = match body.find('\n') {
            Some(newline) if is_fence_tag(&body[..newline]) => &body[newline + 1..],
            None if is_fence_tag(body) => "",
            _ => body,
        };
        blocks.push(body.trim());
        rest = &after_open[close + 3..];
    }
    blocks
}

fn is_fence_tag(line: &str) -> bool {
    line.trim()
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '+'))
}

/// Locates a JSON document in free text.
///
/// Fenced blocks are tried first (first one that parses wins), then the
/// outermost `[`..`]` and `{`..`}` spans, then the whole text. Every
/// candidate is retried once with single quotes swapped for double quotes.
pub fn extract_json(text: &str) -> Result<Value, ExtractionFailure> {
    let mut candidates: Vec<&str> = fenced_blocks(text);

    let spans = [outer_span(text, '[', ']'), outer_span(text, '{', '}')];
    let mut spans: Vec<(usize, &str)> = spans.into_iter().flatten().collect();
    spans.sort_by_key(|(start, _)| *start);
    candidates.extend(spans.into_iter().map(|(_, span)| span));
    candidates.push(text.trim());

    for candidate in &candidates {
        if candidate.is_empty() {
            continue;
        }
        if let Ok(value) = serde_json::from_str::<Value>(candidate) {
            return Ok(value);
        }
        if candidate.contains('\'') {
            if let Ok(value) = serde_json::from_str::<Value>(&candidate.replace('\'', "\"")) {
                return Ok(value);
            }
        }
    }

    let reason = if text.trim().is_empty() {
        "response contained no text".to_string()
    } else {
        "no parseable JSON found in response".to_string()
    };
    Err(ExtractionFailure {
        reason,
        raw_text: text.to_string(),
    })
}

fn outer_span(text: &str, open: char, close: char) -> Option<(usize, &str)> {
    let start = text.find(open)?;
    let end = text.rfind(close)?;
    (end > start).then(|| (start, &text[start..=end]))
}
