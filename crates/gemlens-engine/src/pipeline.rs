use anyhow::bail;
use gemlens_contracts::context::RequestContext;
use gemlens_contracts::detection::{AxisOrder, DetectedObject, PixelRect, SegmentationEntry};
use gemlens_contracts::response::RawModelResponse;
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::annotate::{composite_masks, draw_boxes};
use crate::client::{GenerateRequest, GenerativeClient, InlineImage, Modality};
use crate::error::{error_chain_text, PipelineError};
use crate::extract::{extract, extract_json, Extraction, ExtractionFailure};
use crate::fallback::synthesize_placeholder;
use crate::fonts::FontBook;
use crate::geometry::{normalize, quad_from_value};
use crate::store::{ResultStore, Upload};
use crate::strategy::{run_chain, Strategy};
use crate::tasks::TaskModels;

pub const DEFAULT_QUESTION: &str = "What is in this image?";
pub const DEFAULT_EDIT_PROMPT: &str = "Edit this image";
pub const DEFAULT_OBJECT_NAME: &str = "object";
pub const DEFAULT_SYSTEM_INSTRUCTION: &str = "You are a helpful assistant.";

const SEGMENTATION_PROMPT: &str = "Give the segmentation masks for objects in the image. \
Output a JSON list of segmentation masks where each entry contains the 2D bounding box in the \
key \"box_2d\", the segmentation mask in key \"mask\", and the text label in the key \"label\". \
Use descriptive labels.";

const LABEL_KEYS: [&str; 4] = ["label", "name", "object", "category"];
const BOX_KEYS: [&str; 4] = ["box_2d", "bbox", "box", "bounding_box"];

#[derive(Debug, Clone, Serialize)]
pub struct QaOutcome {
    pub answer: String,
    pub image_path: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImageOutcome {
    pub text: String,
    pub image_path: Option<String>,
    pub strategy: String,
    pub attempts: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LocateOutcome {
    pub bbox: Vec<f64>,
    #[serde(rename = "box")]
    pub rect: PixelRect,
    pub image_path: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DetectionOutcome {
    pub objects: Vec<DetectedObject>,
    pub image_path: Option<String>,
    pub skipped: Vec<String>,
    pub raw_response: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SegmentArtifact {
    pub label: String,
    pub image_path: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SegmentationOutcome {
    pub segments: Vec<SegmentArtifact>,
    pub attempted: usize,
    pub failures: Vec<String>,
    pub raw_response: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TextMode {
    #[default]
    Simple,
    System,
    Reasoning,
    Structured,
}

impl TextMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "simple" => Some(TextMode::Simple),
            "system" => Some(TextMode::System),
            "reasoning" => Some(TextMode::Reasoning),
            "structured" => Some(TextMode::Structured),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TextRequest {
    #[serde(default)]
    pub prompt: String,
    #[serde(default, rename = "demo_type")]
    pub mode: TextMode,
    #[serde(default)]
    pub system_instruction: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TextOutcome {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub structured: Option<Value>,
}

/// Event delivered to a streaming caller. Exactly one terminal frame
/// (`Done` or `Error`) ends every stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamFrame {
    Text(String),
    Error(String),
    Done,
}

impl StreamFrame {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamFrame::Text(_))
    }

    pub fn to_value(&self) -> Value {
        match self {
            StreamFrame::Text(text) => json!({ "text": text, "done": false }),
            StreamFrame::Error(error) => json!({ "error": error, "done": true }),
            StreamFrame::Done => json!({ "done": true }),
        }
    }
}

pub struct Pipeline {
    client: Box<dyn GenerativeClient>,
    store: ResultStore,
    fonts: FontBook,
    models: TaskModels,
}

impl Pipeline {
    pub fn new(
        client: Box<dyn GenerativeClient>,
        store: ResultStore,
        fonts: FontBook,
        models: TaskModels,
    ) -> Self {
        Self {
            client,
            store,
            fonts,
            models,
        }
    }

    pub fn store(&self) -> &ResultStore {
        &self.store
    }

    pub fn fonts(&self) -> &FontBook {
        &self.fonts
    }

    pub fn models(&self) -> &TaskModels {
        &self.models
    }

    pub fn client_name(&self) -> &str {
        self.client.name()
    }

    pub fn answer_question(
        &self,
        ctx: &RequestContext,
        upload: &Upload,
        question: &str,
    ) -> Result<QaOutcome, PipelineError> {
        require_credential(ctx)?;
        let question = non_empty_or(question, DEFAULT_QUESTION);
        info!(model = %self.models.qa, "image question");
        let request = GenerateRequest::new(&self.models.qa, question).with_image(inline(upload));
        let raw = self.call(ctx, &request)?;
        Ok(QaOutcome {
            answer: extract(&raw).text,
            image_path: upload.public_path.clone(),
        })
    }

    pub fn generate_image(
        &self,
        ctx: &RequestContext,
        prompt: &str,
    ) -> Result<ImageOutcome, PipelineError> {
        require_credential(ctx)?;
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return Err(PipelineError::Input("No prompt provided".to_string()));
        }

        let primary = self.models.image.as_str();
        let fallback = self.models.image_fallback.as_str();
        let chain = run_chain(vec![
            Strategy::new(primary, || {
                let request = GenerateRequest::new(primary, prompt)
                    .with_modalities(&[Modality::Text, Modality::Image]);
                expect_image(primary, &self.client.generate(ctx, &request)?)
            }),
            Strategy::new(fallback, || {
                expect_image(fallback, &self.client.generate_images(ctx, fallback, prompt)?)
            }),
        ]);

        match chain {
            Ok(outcome) => {
                let attempts = describe_failures(&outcome.failures);
                let image = first_image(&outcome.value)?;
                let image_path = self
                    .store
                    .save_image("generated", &image.to_rgba8())
                    .map_err(|err| PipelineError::storage(&err))?;
                let role = if attempts.is_empty() { "primary" } else { "fallback" };
                Ok(ImageOutcome {
                    text: format!(
                        "Image generated successfully with {} ({role} model)",
                        outcome.winner
                    ),
                    image_path: Some(image_path),
                    strategy: outcome.winner,
                    attempts,
                })
            }
            Err(exhausted) => {
                warn!(failures = %exhausted.summary(), "image generation exhausted; drawing placeholder card");
                let attempts = describe_failures(&exhausted.failures);
                let placeholder = RawModelResponse::placeholder(format!(
                    "Could not generate image for: {prompt}"
                ));
                let text = extract(&placeholder).text;
                let card = synthesize_placeholder(prompt, None, None, &self.fonts);
                match self.store.save_image("placeholder", &card) {
                    Ok(path) => Ok(ImageOutcome {
                        text,
                        image_path: Some(path),
                        strategy: "placeholder".to_string(),
                        attempts,
                    }),
                    Err(err) => {
                        let message = error_chain_text(&err, 300);
                        warn!(error = %message, "placeholder image could not be saved");
                        Ok(ImageOutcome {
                            text: format!("Failed to create image: {message}"),
                            image_path: None,
                            strategy: "placeholder".to_string(),
                            attempts,
                        })
                    }
                }
            }
        }
    }

    pub fn edit_image(
        &self,
        ctx: &RequestContext,
        upload: &Upload,
        instruction: &str,
    ) -> Result<ImageOutcome, PipelineError> {
        require_credential(ctx)?;
        let instruction = non_empty_or(instruction, DEFAULT_EDIT_PROMPT);
        let base = decode_upload(upload)?;

        let primary = self.models.edit.as_str();
        let fallback = self.models.edit_fallback.as_str();
        let reframed = format!("Edit this image: {instruction}");
        let chain = run_chain(vec![
            Strategy::new(primary, || {
                let request = GenerateRequest::new(primary, instruction)
                    .with_image(inline(upload))
                    .with_modalities(&[Modality::Text, Modality::Image]);
                expect_image(primary, &self.client.generate(ctx, &request)?)
            }),
            Strategy::new(fallback, || {
                let request = GenerateRequest::new(fallback, reframed.as_str())
                    .with_image(inline(upload))
                    .with_modalities(&[Modality::Text, Modality::Image]);
                expect_image(fallback, &self.client.generate(ctx, &request)?)
            }),
        ]);

        let exhausted = match chain {
            Ok(outcome) => {
                let image = first_image(&outcome.value)?;
                let image_path = self
                    .store
                    .save_image("edited", &image.to_rgba8())
                    .map_err(|err| PipelineError::storage(&err))?;
                return Ok(ImageOutcome {
                    text: outcome.value.text.clone(),
                    image_path: Some(image_path),
                    strategy: outcome.winner,
                    attempts: describe_failures(&outcome.failures),
                });
            }
            Err(exhausted) => exhausted,
        };

        warn!(failures = %exhausted.summary(), "image edit exhausted; drawing overlay");
        let attempts = describe_failures(&exhausted.failures);
        let overlay = synthesize_placeholder(instruction, Some(&base), None, &self.fonts);
        let save_error = match self.store.save_image("edited", &overlay) {
            Ok(path) => {
                return Ok(ImageOutcome {
                    text: "Basic image edit applied".to_string(),
                    image_path: Some(path),
                    strategy: "placeholder".to_string(),
                    attempts,
                });
            }
            Err(err) => error_chain_text(&err, 300),
        };

        warn!(error = %save_error, "edit overlay could not be saved; returning original");
        let text = format!("Could not generate edited image: {save_error}");
        let image_path = match self.store.copy_into_results("original", &upload.path) {
            Ok(path) => Some(path),
            Err(err) => {
                warn!(error = %error_chain_text(&err, 300), "original upload could not be copied");
                None
            }
        };
        Ok(ImageOutcome {
            text,
            image_path,
            strategy: "original".to_string(),
            attempts,
        })
    }

    pub fn locate_object(
        &self,
        ctx: &RequestContext,
        upload: &Upload,
        object_name: &str,
    ) -> Result<LocateOutcome, PipelineError> {
        require_credential(ctx)?;
        let object_name = non_empty_or(object_name, DEFAULT_OBJECT_NAME);
        let base = decode_upload(upload)?;
        let prompt = format!(
            "Return a bounding box for the {object_name} in this image in [ymin, xmin, ymax, xmax] format."
        );
        info!(model = %self.models.detect, object = %object_name, "locating object");
        let request = GenerateRequest::new(&self.models.detect, prompt).with_image(inline(upload));
        let text = extract(&self.call(ctx, &request)?).text;

        let parse_failure = |reason: String| PipelineError::Extraction {
            message: format!("Failed to parse bounding box: {reason}"),
            raw_text: text.clone(),
        };
        let value = extract_json(&text).map_err(|failure| parse_failure(failure.reason))?;
        let quad_value = single_quad(&value)
            .ok_or_else(|| parse_failure("no [ymin, xmin, ymax, xmax] list found".to_string()))?;
        let quad = quad_from_value(quad_value).map_err(|err| parse_failure(err.to_string()))?;
        let rect = normalize(&quad, base.width(), base.height(), AxisOrder::YxYx)
            .map_err(|err| parse_failure(err.to_string()))?;

        let annotated = draw_boxes(
            &base,
            &[DetectedObject {
                label: object_name.to_string(),
                bbox: rect,
            }],
            &self.fonts,
        );
        Ok(LocateOutcome {
            bbox: quad,
            rect,
            image_path: self.save_optional("bbox", &annotated),
        })
    }

    pub fn detect_objects(
        &self,
        ctx: &RequestContext,
        upload: &Upload,
        categories: Option<&str>,
    ) -> Result<DetectionOutcome, PipelineError> {
        require_credential(ctx)?;
        let base = decode_upload(upload)?;
        let target = categories
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(|value| format!("the following objects: {value}"))
            .unwrap_or_else(|| "the prominent objects".to_string());
        let prompt = format!(
            "Detect {target} in this image. Output a JSON list where each entry contains the 2D \
             bounding box in the key \"box_2d\" as [ymin, xmin, ymax, xmax] normalized to 0-1000 \
             and the text label in the key \"label\"."
        );
        info!(model = %self.models.detect, "detecting objects");
        let request = GenerateRequest::new(&self.models.detect, prompt).with_image(inline(upload));
        let text = extract(&self.call(ctx, &request)?).text;

        let value = extract_json(&text).map_err(|failure| extraction_error(failure, "detections"))?;
        let Some(entries) = entry_list(&value, &["objects", "detections"]) else {
            return Err(PipelineError::Extraction {
                message: "Failed to parse detections: response is not a JSON list".to_string(),
                raw_text: text,
            });
        };

        let mut objects = Vec::new();
        let mut skipped = Vec::new();
        for (idx, entry) in entries.iter().enumerate() {
            match detection_from_entry(entry, idx, base.width(), base.height()) {
                Ok(object) => objects.push(object),
                Err(reason) => {
                    debug!(entry = idx, %reason, "skipping detection entry");
                    skipped.push(format!("entry {idx}: {reason}"));
                }
            }
        }
        info!(found = objects.len(), skipped = skipped.len(), "detections normalized");

        let annotated = draw_boxes(&base, &objects, &self.fonts);
        Ok(DetectionOutcome {
            objects,
            image_path: self.save_optional("detect", &annotated),
            skipped,
            raw_response: text,
        })
    }

    pub fn segment(
        &self,
        ctx: &RequestContext,
        upload: &Upload,
    ) -> Result<SegmentationOutcome, PipelineError> {
        require_credential(ctx)?;
        let base = decode_upload(upload)?;
        info!(model = %self.models.segment, "segmenting image");
        let request = GenerateRequest::new(&self.models.segment, SEGMENTATION_PROMPT)
            .with_image(inline(upload));
        let text = extract(&self.call(ctx, &request)?).text;

        let value =
            extract_json(&text).map_err(|failure| extraction_error(failure, "segmentation"))?;
        let Some(entries) = entry_list(&value, &["masks", "segments"]) else {
            return Err(PipelineError::Extraction {
                message: "Failed to parse segmentation: response is not a JSON list".to_string(),
                raw_text: text,
            });
        };

        let mut failures = Vec::new();
        let mut segments = Vec::new();
        for (idx, entry) in entries.iter().enumerate() {
            match segment_from_entry(entry, idx) {
                Some(segment) => segments.push(segment),
                None => failures.push(format!("segment {idx}: entry has no mask")),
            }
        }

        let batch = composite_masks(&base, &segments);
        failures.extend(batch.failures);
        let mut artifacts = Vec::new();
        for artifact in batch.artifacts {
            match self
                .store
                .save_image(&format!("segment_{}", artifact.index), &artifact.image)
            {
                Ok(image_path) => artifacts.push(SegmentArtifact {
                    label: artifact.label,
                    image_path,
                }),
                Err(err) => failures.push(format!(
                    "segment {} ({}): {}",
                    artifact.index,
                    artifact.label,
                    error_chain_text(&err, 200)
                )),
            }
        }
        info!(
            attempted = entries.len(),
            rendered = artifacts.len(),
            "segmentation masks composited"
        );
        Ok(SegmentationOutcome {
            segments: artifacts,
            attempted: entries.len(),
            failures,
            raw_response: text,
        })
    }

    pub fn generate_text(
        &self,
        ctx: &RequestContext,
        request: &TextRequest,
    ) -> Result<TextOutcome, PipelineError> {
        require_credential(ctx)?;
        let prompt = request.prompt.trim();
        if prompt.is_empty() {
            return Err(PipelineError::Input("No prompt provided".to_string()));
        }

        match request.mode {
            TextMode::Simple => {
                let raw = self.call(ctx, &GenerateRequest::new(&self.models.text, prompt))?;
                Ok(TextOutcome {
                    text: Some(extract(&raw).text),
                    ..TextOutcome::default()
                })
            }
            TextMode::System => {
                let mut call = GenerateRequest::new(&self.models.text, prompt);
                call.system_instruction = Some(
                    non_empty_or(
                        request.system_instruction.as_deref().unwrap_or_default(),
                        DEFAULT_SYSTEM_INSTRUCTION,
                    )
                    .to_string(),
                );
                let raw = self.call(ctx, &call)?;
                Ok(TextOutcome {
                    text: Some(extract(&raw).text),
                    ..TextOutcome::default()
                })
            }
            TextMode::Reasoning => {
                let mut call = GenerateRequest::new(&self.models.reasoning, prompt);
                call.include_thoughts = true;
                let extraction = extract(&self.call(ctx, &call)?);
                Ok(TextOutcome {
                    text: Some(extraction.text),
                    reasoning: Some(extraction.reasoning),
                    structured: None,
                })
            }
            TextMode::Structured => {
                let mut call = GenerateRequest::new(&self.models.text, prompt);
                call.response_mime_type = Some("application/json".to_string());
                let text = extract(&self.call(ctx, &call)?).text;
                let structured = extract_json(&text).unwrap_or_else(|failure| {
                    debug!(reason = %failure.reason, "structured answer kept as raw text");
                    Value::String(failure.raw_text)
                });
                Ok(TextOutcome {
                    structured: Some(structured),
                    ..TextOutcome::default()
                })
            }
        }
    }

    /// Streams text increments to `emit`. Failures become a terminal
    /// `Error` frame; nothing is emitted after `emit` returns `false`.
    pub fn stream_text(
        &self,
        ctx: &RequestContext,
        prompt: &str,
        emit: &mut dyn FnMut(StreamFrame) -> bool,
    ) {
        if let Err(err) = require_credential(ctx) {
            emit(StreamFrame::Error(err.to_string()));
            return;
        }
        let prompt = prompt.trim();
        if prompt.is_empty() {
            emit(StreamFrame::Error("No prompt provided".to_string()));
            return;
        }

        let request = GenerateRequest::new(&self.models.stream, prompt);
        let mut open = true;
        let result = {
            let mut forward = |raw: RawModelResponse| {
                let text = extract(&raw).text;
                if text.is_empty() {
                    return true;
                }
                open = emit(StreamFrame::Text(text));
                open
            };
            self.client.stream_generate(ctx, &request, &mut forward)
        };
        if !open {
            debug!("stream receiver went away");
            return;
        }
        match result {
            Ok(()) => emit(StreamFrame::Done),
            Err(err) => {
                let message = error_chain_text(&err, 600);
                warn!(error = %message, "text stream failed");
                emit(StreamFrame::Error(message))
            }
        };
    }

    /// Makes a minimal call with `api_key` to check that it is accepted.
    pub fn validate_credential(&self, api_key: &str) -> Result<(), PipelineError> {
        let ctx = RequestContext::new(Some(api_key.to_string()));
        if !ctx.has_credential() {
            return Err(PipelineError::Input("API key cannot be empty".to_string()));
        }
        self.call(&ctx, &GenerateRequest::new(&self.models.text, "Test"))?;
        Ok(())
    }

    fn call(
        &self,
        ctx: &RequestContext,
        request: &GenerateRequest,
    ) -> Result<RawModelResponse, PipelineError> {
        let raw = self.client.generate(ctx, request).map_err(|err| {
            let upstream = PipelineError::upstream(&err);
            warn!(model = %request.model, error = %upstream, "upstream call failed");
            upstream
        })?;
        debug!(model = %request.model, shape = raw.kind(), "upstream response");
        Ok(raw)
    }

    fn save_optional(&self, prefix: &str, image: &image::RgbaImage) -> Option<String> {
        match self.store.save_image(prefix, image) {
            Ok(path) => Some(path),
            Err(err) => {
                warn!(prefix, error = %error_chain_text(&err, 300), "annotated image could not be saved");
                None
            }
        }
    }
}

fn require_credential(ctx: &RequestContext) -> Result<(), PipelineError> {
    if ctx.has_credential() {
        Ok(())
    } else {
        Err(PipelineError::Configuration)
    }
}

fn non_empty_or<'a>(value: &'a str, default: &'a str) -> &'a str {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        default
    } else {
        trimmed
    }
}

fn inline(upload: &Upload) -> InlineImage {
    InlineImage {
        bytes: upload.bytes.clone(),
        mime_type: upload.mime_type.clone(),
    }
}

fn decode_upload(upload: &Upload) -> Result<DynamicImage, PipelineError> {
    image::load_from_memory(&upload.bytes)
        .map_err(|err| PipelineError::Input(format!("Uploaded file is not a readable image: {err}")))
}

fn expect_image(model: &str, raw: &RawModelResponse) -> anyhow::Result<Extraction> {
    let extraction = extract(raw);
    if extraction.images.is_empty() {
        if extraction.parse_errors.is_empty() {
            bail!("{model} returned no image");
        }
        bail!(
            "{model} returned no decodable image ({})",
            extraction.parse_errors.join("; ")
        );
    }
    Ok(extraction)
}

fn first_image(extraction: &Extraction) -> Result<&DynamicImage, PipelineError> {
    extraction
        .first_image()
        .ok_or_else(|| PipelineError::Render("image missing after extraction".to_string()))
}

fn describe_failures(failures: &[crate::strategy::AttemptFailure]) -> Vec<String> {
    failures.iter().map(|failure| failure.describe()).collect()
}

fn extraction_error(failure: ExtractionFailure, what: &str) -> PipelineError {
    PipelineError::Extraction {
        message: format!("Failed to parse {what}: {}", failure.reason),
        raw_text: failure.raw_text,
    }
}

/// Finds the one quad in a bounding-box answer: a bare list of numbers, a
/// list of such lists, an object with a box key, or a list of such objects.
fn single_quad(value: &Value) -> Option<&Value> {
    match value {
        Value::Array(items) => match items.first()? {
            Value::Number(_) | Value::String(_) => Some(value),
            first => single_quad(first),
        },
        Value::Object(obj) => BOX_KEYS.iter().find_map(|key| obj.get(*key)),
        _ => None,
    }
}

fn entry_list<'a>(value: &'a Value, wrapper_keys: &[&str]) -> Option<Vec<&'a Value>> {
    match value {
        Value::Array(items) => Some(items.iter().collect()),
        Value::Object(obj) => {
            if let Some(items) = wrapper_keys
                .iter()
                .find_map(|key| obj.get(*key).and_then(Value::as_array))
            {
                return Some(items.iter().collect());
            }
            Some(vec![value])
        }
        _ => None,
    }
}

fn label_of(entry: &serde_json::Map<String, Value>, idx: usize) -> String {
    LABEL_KEYS
        .iter()
        .find_map(|key| entry.get(*key).and_then(Value::as_str))
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("Object {}", idx + 1))
}

fn detection_from_entry(
    entry: &Value,
    idx: usize,
    width: u32,
    height: u32,
) -> Result<DetectedObject, String> {
    let obj = entry.as_object().ok_or("entry is not an object")?;
    let raw_box = BOX_KEYS
        .iter()
        .find_map(|key| obj.get(*key))
        .ok_or("entry has no box")?;
    let quad = quad_from_value(raw_box).map_err(|err| err.to_string())?;
    let bbox = normalize(&quad, width, height, AxisOrder::YxYx).map_err(|err| err.to_string())?;
    Ok(DetectedObject {
        label: label_of(obj, idx),
        bbox,
    })
}

fn segment_from_entry(entry: &Value, idx: usize) -> Option<SegmentationEntry> {
    let obj = entry.as_object()?;
    let mask = obj.get("mask").and_then(Value::as_str)?;
    Some(SegmentationEntry {
        label: label_of(obj, idx),
        mask: mask.to_string(),
    })
}
