use serde_json::Value;

/// Raw answer from the generative service.
///
/// Each variant carries only what that shape guarantees. Builders skip
/// absent or mistyped fields instead of failing, since the upstream
/// shape is not guaranteed.
#[derive(Debug, Clone, PartialEq)]
pub enum RawModelResponse {
    TextOnly { text: String },
    CandidateList(Vec<Candidate>),
    PartList(Vec<Part>),
    GeneratedImageList(Vec<GeneratedImage>),
    /// Built locally when every upstream attempt failed.
    Placeholder { text: String },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Candidate {
    pub content: Option<Content>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Content {
    pub text: Option<String>,
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Part {
    pub text: Option<String>,
    pub inline_data: Option<InlineData>,
    pub thought: bool,
}

/// Binary payload attached to a part; `data` is still base64 encoded.
#[derive(Debug, Clone, PartialEq)]
pub struct InlineData {
    pub data: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedImage {
    pub data: String,
}

impl RawModelResponse {
    pub fn placeholder(text: impl Into<String>) -> Self {
        RawModelResponse::Placeholder { text: text.into() }
    }

    pub fn text(text: impl Into<String>) -> Self {
        RawModelResponse::TextOnly { text: text.into() }
    }

    /// Classifies a decoded JSON payload. Probes `candidates`, `parts`,
    /// `text`, then the image-generation shapes; anything else becomes an
    /// empty candidate list.
    pub fn from_value(value: &Value) -> Self {
        if let Some(rows) = value.get("candidates").and_then(Value::as_array) {
            return RawModelResponse::CandidateList(rows.iter().map(parse_candidate).collect());
        }
        if let Some(rows) = value.get("parts").and_then(Value::as_array) {
            return RawModelResponse::PartList(rows.iter().filter_map(parse_part).collect());
        }
        if let Some(text) = value.get("text").and_then(Value::as_str) {
            return RawModelResponse::TextOnly {
                text: text.to_string(),
            };
        }
        let generated = value
            .get("predictions")
            .or_else(|| value.get("generatedImages"))
            .or_else(|| value.get("generated_images"))
            .and_then(Value::as_array);
        if let Some(rows) = generated {
            return RawModelResponse::GeneratedImageList(
                rows.iter().filter_map(parse_generated_image).collect(),
            );
        }
        RawModelResponse::CandidateList(Vec::new())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RawModelResponse::TextOnly { .. } => "text_only",
            RawModelResponse::CandidateList(_) => "candidate_list",
            RawModelResponse::PartList(_) => "part_list",
            RawModelResponse::GeneratedImageList(_) => "generated_image_list",
            RawModelResponse::Placeholder { .. } => "placeholder",
        }
    }
}

fn parse_candidate(value: &Value) -> Candidate {
    let Some(obj) = value.as_object() else {
        return Candidate::default();
    };
    let content = obj.get("content").and_then(Value::as_object).map(|content| Content {
        text: content
            .get("text")
            .and_then(Value::as_str)
            .map(str::to_string),
        parts: content
            .get("parts")
            .and_then(Value::as_array)
            .map(|rows| rows.iter().filter_map(parse_part).collect())
            .unwrap_or_default(),
    });
    Candidate { content }
}

fn parse_part(value: &Value) -> Option<Part> {
    let obj = value.as_object()?;
    let inline_data = obj
        .get("inlineData")
        .or_else(|| obj.get("inline_data"))
        .and_then(Value::as_object)
        .and_then(|inline| {
            let data = inline.get("data").and_then(Value::as_str)?;
            Some(InlineData {
                data: data.to_string(),
            })
        });
    Some(Part {
        text: obj.get("text").and_then(Value::as_str).map(str::to_string),
        inline_data,
        thought: obj.get("thought").and_then(Value::as_bool).unwrap_or(false),
    })
}

fn parse_generated_image(value: &Value) -> Option<GeneratedImage> {
    let obj = value.as_object()?;
    if let Some(encoded) = obj
        .get("bytesBase64Encoded")
        .or_else(|| obj.get("bytes_base64_encoded"))
        .and_then(Value::as_str)
    {
        return Some(GeneratedImage {
            data: encoded.to_string(),
        });
    }
    let nested = obj
        .get("image")
        .or_else(|| obj.get("generatedImage"))
        .and_then(Value::as_object)?;
    let encoded = nested
        .get("imageBytes")
        .or_else(|| nested.get("image_bytes"))
        .or_else(|| nested.get("bytesBase64Encoded"))
        .and_then(Value::as_str)?;
    Some(GeneratedImage {
        data: encoded.to_string(),
    })
}
