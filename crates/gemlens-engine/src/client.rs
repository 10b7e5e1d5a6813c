use std::io::{BufRead, BufReader, Cursor};
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use gemlens_contracts::context::RequestContext;
use gemlens_contracts::response::RawModelResponse;
use image::{GrayImage, ImageFormat, Luma, Rgb, RgbImage};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::truncate_text;

pub const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modality {
    Text,
    Image,
}

impl Modality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Modality::Text => "TEXT",
            Modality::Image => "IMAGE",
        }
    }
}

#[derive(Debug, Clone)]
pub struct InlineImage {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

#[derive(Debug, Clone, Default)]
pub struct GenerateRequest {
    pub model: String,
    pub prompt: String,
    pub image: Option<InlineImage>,
    pub response_modalities: Vec<Modality>,
    pub system_instruction: Option<String>,
    pub response_mime_type: Option<String>,
    pub include_thoughts: bool,
}

impl GenerateRequest {
    pub fn new(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    pub fn with_image(mut self, image: InlineImage) -> Self {
        self.image = Some(image);
        self
    }

    pub fn with_modalities(mut self, modalities: &[Modality]) -> Self {
        self.response_modalities = modalities.to_vec();
        self
    }

    pub fn wants_image(&self) -> bool {
        self.response_modalities.contains(&Modality::Image)
    }
}

/// Seam between the pipeline and the remote generative service.
pub trait GenerativeClient: Send + Sync {
    fn name(&self) -> &str;

    fn generate(&self, ctx: &RequestContext, request: &GenerateRequest) -> Result<RawModelResponse>;

    fn generate_images(
        &self,
        ctx: &RequestContext,
        model: &str,
        prompt: &str,
    ) -> Result<RawModelResponse>;

    /// Delivers increments in arrival order. Returning `false` from `emit`
    /// stops reading.
    fn stream_generate(
        &self,
        ctx: &RequestContext,
        request: &GenerateRequest,
        emit: &mut dyn FnMut(RawModelResponse) -> bool,
    ) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub api_base: String,
    pub request_timeout_s: f64,
    pub transport_retries: usize,
    pub retry_backoff_s: f64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            request_timeout_s: 90.0,
            transport_retries: 2,
            retry_backoff_s: 1.0,
        }
    }
}

pub struct GeminiClient {
    settings: ClientSettings,
    http: HttpClient,
}

impl GeminiClient {
    /// The HTTP client carries only a connect timeout. Unary calls add
    /// `request_timeout_s` per request; streams are read until the upstream
    /// closes them.
    pub fn new(mut settings: ClientSettings) -> Result<Self> {
        settings.api_base = settings.api_base.trim().trim_end_matches('/').to_string();
        if settings.api_base.is_empty() {
            settings.api_base = DEFAULT_API_BASE.to_string();
        }
        let http = HttpClient::builder()
            .connect_timeout(Duration::from_secs_f64(settings.request_timeout_s))
            .timeout(None::<Duration>)
            .build()
            .context("failed to build Gemini HTTP client")?;
        Ok(Self { settings, http })
    }

    fn request_timeout(&self) -> Option<Duration> {
        Some(Duration::from_secs_f64(self.settings.request_timeout_s))
    }

    fn endpoint_for_model(&self, model: &str, method: &str) -> String {
        let trimmed = model.trim();
        let model_path = if trimmed.starts_with("models/") {
            trimmed.to_string()
        } else {
            format!("models/{trimmed}")
        };
        format!("{}/{}:{}", self.settings.api_base, model_path, method)
    }

    fn api_key(ctx: &RequestContext) -> Result<&str> {
        match ctx.credential() {
            Some(key) => Ok(key),
            None => bail!("GEMINI_API_KEY not set"),
        }
    }

    fn build_payload(request: &GenerateRequest) -> Value {
        let mut parts = vec![json!({ "text": request.prompt })];
        if let Some(image) = request.image.as_ref() {
            parts.push(json!({
                "inlineData": {
                    "mimeType": image.mime_type,
                    "data": BASE64.encode(&image.bytes),
                }
            }));
        }

        let mut payload = Map::new();
        payload.insert(
            "contents".to_string(),
            Value::Array(vec![json!({
                "role": "user",
                "parts": parts,
            })]),
        );
        if let Some(instruction) = request
            .system_instruction
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
        {
            payload.insert(
                "systemInstruction".to_string(),
                json!({ "parts": [{ "text": instruction }] }),
            );
        }

        let mut generation_config = Map::new();
        if !request.response_modalities.is_empty() {
            generation_config.insert(
                "responseModalities".to_string(),
                Value::Array(
                    request
                        .response_modalities
                        .iter()
                        .map(|modality| Value::String(modality.as_str().to_string()))
                        .collect(),
                ),
            );
        }
        if let Some(mime) = request.response_mime_type.as_deref() {
            generation_config.insert(
                "responseMimeType".to_string(),
                Value::String(mime.to_string()),
            );
        }
        if request.include_thoughts {
            generation_config.insert(
                "thinkingConfig".to_string(),
                json!({ "includeThoughts": true }),
            );
        }
        if !generation_config.is_empty() {
            payload.insert(
                "generationConfig".to_string(),
                Value::Object(generation_config),
            );
        }
        Value::Object(payload)
    }

    fn post_with_transport_retries(
        &self,
        endpoint: &str,
        api_key: &str,
        query: &[(&str, &str)],
        payload: &Value,
        timeout: Option<Duration>,
    ) -> Result<HttpResponse> {
        let max_retries = self.settings.transport_retries;
        let mut attempt = 0;
        loop {
            let mut request = self
                .http
                .post(endpoint)
                .query(&[("key", api_key)])
                .query(query)
                .json(payload);
            if let Some(limit) = timeout {
                request = request.timeout(limit);
            }
            let response = request.send();

            match response {
                Ok(ok) => return Ok(ok),
                Err(raw) => {
                    let err = anyhow::Error::new(raw)
                        .context(format!("Gemini request failed ({endpoint})"));
                    if !is_retryable_transport_error(&err) || attempt >= max_retries {
                        return Err(err);
                    }
                    warn!(
                        attempt = attempt + 1,
                        max_retries, "Gemini transport retry after transient request failure"
                    );
                    let delay_s = self.settings.retry_backoff_s * (attempt as f64 + 1.0);
                    thread::sleep(Duration::from_secs_f64(delay_s));
                    attempt += 1;
                }
            }
        }
    }
}

impl GenerativeClient for GeminiClient {
    fn name(&self) -> &str {
        "gemini"
    }

    fn generate(&self, ctx: &RequestContext, request: &GenerateRequest) -> Result<RawModelResponse> {
        let api_key = Self::api_key(ctx)?;
        let endpoint = self.endpoint_for_model(&request.model, "generateContent");
        debug!(model = %request.model, image = request.image.is_some(), "Gemini generateContent");
        let response = self.post_with_transport_retries(
            &endpoint,
            api_key,
            &[],
            &Self::build_payload(request),
            self.request_timeout(),
        )?;
        let payload = response_json_or_error("Gemini", response)?;
        Ok(RawModelResponse::from_value(&payload))
    }

    fn generate_images(
        &self,
        ctx: &RequestContext,
        model: &str,
        prompt: &str,
    ) -> Result<RawModelResponse> {
        let api_key = Self::api_key(ctx)?;
        let endpoint = self.endpoint_for_model(model, "predict");
        debug!(%model, "Imagen predict");
        let payload = json!({
            "instances": [{ "prompt": prompt }],
            "parameters": { "sampleCount": 1 },
        });
        let response = self.post_with_transport_retries(
            &endpoint,
            api_key,
            &[],
            &payload,
            self.request_timeout(),
        )?;
        let payload = response_json_or_error("Imagen", response)?;
        let parsed = RawModelResponse::from_value(&payload);
        if !matches!(parsed, RawModelResponse::GeneratedImageList(ref rows) if !rows.is_empty()) {
            bail!("Imagen returned no images");
        }
        Ok(parsed)
    }

    fn stream_generate(
        &self,
        ctx: &RequestContext,
        request: &GenerateRequest,
        emit: &mut dyn FnMut(RawModelResponse) -> bool,
    ) -> Result<()> {
        let api_key = Self::api_key(ctx)?;
        let endpoint = self.endpoint_for_model(&request.model, "streamGenerateContent");
        let response = self.post_with_transport_retries(
            &endpoint,
            api_key,
            &[("alt", "sse")],
            &Self::build_payload(request),
            None,
        )?;
        let status = response.status();
        if !status.is_success() {
            let code = status.as_u16();
            let body = response.text().unwrap_or_default();
            bail!(
                "Gemini stream request failed ({code}): {}",
                truncate_text(&body, 512)
            );
        }
        read_sse_events(BufReader::new(response), emit)
    }
}

/// Parses `data:` events from a server-sent event stream. Multi-line data
/// fields are joined with newlines.
pub fn read_sse_events<R: BufRead>(
    reader: R,
    emit: &mut dyn FnMut(RawModelResponse) -> bool,
) -> Result<()> {
    let mut data = String::new();
    let mut dispatch = |data: &mut String| -> Result<bool> {
        if data.trim().is_empty() || data.trim() == "[DONE]" {
            data.clear();
            return Ok(true);
        }
        let value: Value = serde_json::from_str(data)
            .with_context(|| format!("invalid stream event: {}", truncate_text(data, 200)))?;
        data.clear();
        Ok(emit(RawModelResponse::from_value(&value)))
    };

    for line in reader.lines() {
        let line = line.context("Gemini stream read failed")?;
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            if !dispatch(&mut data)? {
                return Ok(());
            }
            continue;
        }
        if let Some(rest) = line.strip_prefix("data:") {
            if !data.is_empty() {
                data.push('\n');
            }
            data.push_str(rest.strip_prefix(' ').unwrap_or(rest));
        }
    }
    dispatch(&mut data)?;
    Ok(())
}

fn response_json_or_error(provider: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .with_context(|| format!("{provider} response body read failed"))?;
    if !status.is_success() {
        bail!(
            "{provider} request failed ({code}): {}",
            truncate_text(&body, 512)
        );
    }
    let parsed: Value = serde_json::from_str(&body)
        .with_context(|| format!("{provider} returned invalid JSON payload"))?;
    Ok(parsed)
}

fn is_retryable_transport_error(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<reqwest::Error>()
            .map(|reqwest_err| {
                reqwest_err.is_timeout() || reqwest_err.is_connect() || reqwest_err.is_request()
            })
            .unwrap_or(false)
    })
}

/// Offline client with deterministic answers, for demos without a key.
#[derive(Debug, Default)]
pub struct DryrunClient;

const DRYRUN_IMAGE_SIZE: u32 = 512;

impl DryrunClient {
    fn answer_for(request: &GenerateRequest) -> Result<Value> {
        let prompt = request.prompt.as_str();
        let lower = prompt.to_ascii_lowercase();
        let mut parts = Vec::new();
        if request.include_thoughts {
            parts.push(json!({
                "text": format!("Considering: {prompt}"),
                "thought": true,
            }));
        }

        if request.wants_image() {
            parts.push(json!({ "text": format!("Dry-run image for: {prompt}") }));
            parts.push(json!({
                "inlineData": {
                    "mimeType": "image/png",
                    "data": BASE64.encode(solid_png(prompt)?),
                }
            }));
        } else if lower.contains("segmentation mask") {
            let mask = BASE64.encode(square_mask_png()?);
            let body = json!([{
                "box_2d": [250, 250, 750, 750],
                "mask": format!("data:image/png;base64,{mask}"),
                "label": "center object",
            }]);
            parts.push(json!({ "text": format!("```json\n{body}\n```") }));
        } else if lower.contains("box_2d") {
            let body = json!([
                {"box_2d": [100, 100, 500, 450], "label": "left object"},
                {"box_2d": [300, 550, 900, 950], "label": "right object"},
            ]);
            parts.push(json!({ "text": format!("Here you go:\n```json\n{body}\n```") }));
        } else if lower.contains("bounding box") {
            parts.push(json!({ "text": "[200, 150, 800, 850]" }));
        } else if request.response_mime_type.as_deref() == Some("application/json") {
            let words = prompt.split_whitespace().count();
            parts.push(json!({ "text": json!({"prompt": prompt, "words": words}).to_string() }));
        } else {
            parts.push(json!({ "text": format!("Dry-run response to: {prompt}") }));
        }

        Ok(json!({
            "candidates": [{
                "content": { "role": "model", "parts": parts },
                "finishReason": "STOP",
            }]
        }))
    }
}

impl GenerativeClient for DryrunClient {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn generate(&self, _ctx: &RequestContext, request: &GenerateRequest) -> Result<RawModelResponse> {
        Ok(RawModelResponse::from_value(&Self::answer_for(request)?))
    }

    fn generate_images(
        &self,
        _ctx: &RequestContext,
        _model: &str,
        prompt: &str,
    ) -> Result<RawModelResponse> {
        let payload = json!({
            "predictions": [{
                "mimeType": "image/png",
                "bytesBase64Encoded": BASE64.encode(solid_png(prompt)?),
            }]
        });
        Ok(RawModelResponse::from_value(&payload))
    }

    fn stream_generate(
        &self,
        _ctx: &RequestContext,
        request: &GenerateRequest,
        emit: &mut dyn FnMut(RawModelResponse) -> bool,
    ) -> Result<()> {
        let reply = format!("Dry-run response to: {}", request.prompt);
        for word in reply.split_inclusive(' ') {
            if !emit(RawModelResponse::text(word)) {
                break;
            }
        }
        Ok(())
    }
}

fn color_from_prompt(prompt: &str) -> (u8, u8, u8) {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    let digest = hasher.finalize();
    (digest[0], digest[1], digest[2])
}

fn solid_png(prompt: &str) -> Result<Vec<u8>> {
    let (r, g, b) = color_from_prompt(prompt);
    let image = RgbImage::from_pixel(DRYRUN_IMAGE_SIZE, DRYRUN_IMAGE_SIZE, Rgb([r, g, b]));
    let mut bytes = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .context("dry-run image encode failed")?;
    Ok(bytes)
}

fn square_mask_png() -> Result<Vec<u8>> {
    let mask = GrayImage::from_fn(64, 64, |x, y| {
        if (16..48).contains(&x) && (16..48).contains(&y) {
            Luma([255])
        } else {
            Luma([0])
        }
    });
    let mut bytes = Vec::new();
    mask.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .context("dry-run mask encode failed")?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use std::io::{Cursor, Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::thread;
    use std::time::Duration;

    use gemlens_contracts::context::RequestContext;
    use gemlens_contracts::response::RawModelResponse;
    use serde_json::json;

    use super::{
        read_sse_events, ClientSettings, DryrunClient, GeminiClient, GenerateRequest,
        GenerativeClient, InlineImage, Modality,
    };

    #[test]
    fn endpoint_accepts_prefixed_and_bare_models() -> anyhow::Result<()> {
        let client = GeminiClient::new(ClientSettings {
            api_base: "https://example.test/v1beta/".to_string(),
            ..ClientSettings::default()
        })?;
        assert_eq!(
            client.endpoint_for_model("gemini-2.0-flash", "generateContent"),
            "https://example.test/v1beta/models/gemini-2.0-flash:generateContent"
        );
        assert_eq!(
            client.endpoint_for_model("models/imagen-3.0-generate-002", "predict"),
            "https://example.test/v1beta/models/imagen-3.0-generate-002:predict"
        );
        Ok(())
    }

    #[test]
    fn payload_puts_prompt_before_image_and_sets_config() {
        let mut request = GenerateRequest::new("m", "what is this?")
            .with_image(InlineImage {
                bytes: vec![1, 2, 3],
                mime_type: "image/jpeg".to_string(),
            })
            .with_modalities(&[Modality::Text, Modality::Image]);
        request.system_instruction = Some("be brief".to_string());
        request.include_thoughts = true;
        let payload = GeminiClient::build_payload(&request);
        let parts = &payload["contents"][0]["parts"];
        assert_eq!(parts[0]["text"], json!("what is this?"));
        assert_eq!(parts[1]["inlineData"]["mimeType"], json!("image/jpeg"));
        assert_eq!(parts[1]["inlineData"]["data"], json!("AQID"));
        assert_eq!(
            payload["generationConfig"]["responseModalities"],
            json!(["TEXT", "IMAGE"])
        );
        assert_eq!(
            payload["generationConfig"]["thinkingConfig"]["includeThoughts"],
            json!(true)
        );
        assert_eq!(payload["systemInstruction"]["parts"][0]["text"], json!("be brief"));
    }

    #[test]
    fn plain_payload_has_no_generation_config() {
        let payload = GeminiClient::build_payload(&GenerateRequest::new("m", "Test"));
        assert!(payload.get("generationConfig").is_none());
        assert!(payload.get("systemInstruction").is_none());
    }

    #[test]
    fn missing_credential_fails_before_any_request() -> anyhow::Result<()> {
        let client = GeminiClient::new(ClientSettings::default())?;
        let err = client
            .generate(&RequestContext::anonymous(), &GenerateRequest::new("m", "hi"))
            .err()
            .map(|err| err.to_string())
            .unwrap_or_default();
        assert_eq!(err, "GEMINI_API_KEY not set");
        Ok(())
    }

    #[test]
    fn sse_events_are_delivered_in_order() -> anyhow::Result<()> {
        let body = "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"Hel\"}]}}]}\r\n\r\n\
                    data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"lo\"}]}}]}\n\n";
        let mut seen = Vec::new();
        read_sse_events(Cursor::new(body), &mut |raw| {
            seen.push(crate::extract::extract(&raw).text);
            true
        })?;
        assert_eq!(seen, vec!["Hel", "lo"]);
        Ok(())
    }

    #[test]
    fn sse_reading_stops_when_receiver_declines() -> anyhow::Result<()> {
        let body = "data: {\"text\":\"a\"}\n\ndata: {\"text\":\"b\"}\n\n";
        let mut count = 0;
        read_sse_events(Cursor::new(body), &mut |_| {
            count += 1;
            false
        })?;
        assert_eq!(count, 1);
        Ok(())
    }

    fn read_request_head_and_body(socket: &mut TcpStream) {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        while let Ok(read) = socket.read(&mut chunk) {
            if read == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..read]);
            let Some(end) = buf.windows(4).position(|window| window == b"\r\n\r\n") else {
                continue;
            };
            let head = String::from_utf8_lossy(&buf[..end]).to_ascii_lowercase();
            let length = head
                .lines()
                .find_map(|line| line.strip_prefix("content-length:"))
                .and_then(|value| value.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if buf.len() >= end + 4 + length {
                break;
            }
        }
    }

    /// Serves one SSE response whose events arrive `gap` apart.
    fn serve_slow_sse(events: usize, gap: Duration) -> anyhow::Result<(String, thread::JoinHandle<()>)> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let api_base = format!("http://{}/v1beta", listener.local_addr()?);
        let handle = thread::spawn(move || {
            let Ok((mut socket, _)) = listener.accept() else {
                return;
            };
            read_request_head_and_body(&mut socket);
            let head = "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nConnection: close\r\n\r\n";
            if socket.write_all(head.as_bytes()).is_err() {
                return;
            }
            for idx in 0..events {
                thread::sleep(gap);
                let value = json!({
                    "candidates": [{"content": {"parts": [{"text": format!("chunk{idx} ")}]}}]
                });
                let event = format!("data: {value}\n\n");
                if socket
                    .write_all(event.as_bytes())
                    .and_then(|_| socket.flush())
                    .is_err()
                {
                    return;
                }
            }
        });
        Ok((api_base, handle))
    }

    #[test]
    fn streams_outlive_the_unary_request_timeout() -> anyhow::Result<()> {
        let (api_base, server) = serve_slow_sse(4, Duration::from_millis(700))?;
        let client = GeminiClient::new(ClientSettings {
            api_base,
            request_timeout_s: 1.0,
            transport_retries: 0,
            ..ClientSettings::default()
        })?;
        let ctx = RequestContext::new(Some("test-key".to_string()));
        let mut chunks = Vec::new();
        client.stream_generate(
            &ctx,
            &GenerateRequest::new("gemini-2.0-flash", "count slowly"),
            &mut |raw| {
                chunks.push(crate::extract::extract(&raw).text);
                true
            },
        )?;
        server
            .join()
            .map_err(|_| anyhow::anyhow!("sse server thread panicked"))?;
        assert_eq!(chunks, vec!["chunk0 ", "chunk1 ", "chunk2 ", "chunk3 "]);
        Ok(())
    }

    #[test]
    fn malformed_sse_event_is_an_error() {
        let mut sink = |_: RawModelResponse| true;
        assert!(read_sse_events(Cursor::new("data: {oops\n\n"), &mut sink).is_err());
    }

    #[test]
    fn dryrun_images_are_deterministic() -> anyhow::Result<()> {
        let ctx = RequestContext::anonymous();
        let request = GenerateRequest::new("m", "a lighthouse").with_modalities(&[
            Modality::Text,
            Modality::Image,
        ]);
        let first = crate::extract::extract(&DryrunClient.generate(&ctx, &request)?);
        let second = crate::extract::extract(&DryrunClient.generate(&ctx, &request)?);
        assert_eq!(first.images.len(), 1);
        assert_eq!(
            first.images[0].to_rgb8().get_pixel(0, 0),
            second.images[0].to_rgb8().get_pixel(0, 0)
        );
        let imagen = DryrunClient.generate_images(&ctx, "imagen", "a lighthouse")?;
        assert_eq!(imagen.kind(), "generated_image_list");
        Ok(())
    }
}
