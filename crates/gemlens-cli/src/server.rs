use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::Path as FsPath;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::multipart::MultipartRejection;
use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, FromRequest, Multipart, Path, Query, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use futures::stream::{self, Stream};
use gemlens_contracts::context::RequestContext;
use gemlens_engine::store::mime_for_extension;
use gemlens_engine::{
    DetectionOutcome, ImageOutcome, LocateOutcome, Pipeline, PipelineError, QaOutcome,
    SegmentationOutcome, StreamFrame, TextOutcome, TextRequest, Upload,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tower_http::services::ServeDir;
use tracing::{error, info, warn};

use crate::credentials::{mask_key, request_context, CredentialStore};

const MAX_UPLOAD_BYTES: usize = 16 * 1024 * 1024;
const STREAM_BUFFER: usize = 32;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub credentials: Arc<dyn CredentialStore>,
}

impl AppState {
    fn context(&self, headers: &HeaderMap) -> RequestContext {
        request_context(headers, self.credentials.as_ref())
    }
}

#[derive(Debug)]
pub enum ApiError {
    Pipeline(PipelineError),
    NotFound,
    Internal(String),
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        ApiError::Pipeline(err)
    }
}

pub fn status_for(err: &PipelineError) -> StatusCode {
    match err {
        PipelineError::Configuration => StatusCode::UNAUTHORIZED,
        PipelineError::Input(_) | PipelineError::Extraction { .. } => StatusCode::BAD_REQUEST,
        PipelineError::Upstream(_) | PipelineError::Render(_) | PipelineError::Storage(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

pub fn error_body(err: &PipelineError) -> Value {
    let mut body = json!({ "error": err.to_string() });
    if let Some(raw) = err.raw_text() {
        body["raw_response"] = Value::String(raw.to_string());
    }
    body
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Pipeline(err) => {
                let status = status_for(&err);
                if status.is_server_error() {
                    warn!(kind = err.kind(), error = %err, "request failed");
                }
                (status, Json(error_body(&err))).into_response()
            }
            ApiError::NotFound => (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": "File not found" })),
            )
                .into_response(),
            ApiError::Internal(message) => {
                error!(%message, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": message })),
                )
                    .into_response()
            }
        }
    }
}

pub fn router(state: AppState, static_root: &FsPath) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/settings", get(settings))
        .route("/save_settings", post(save_settings))
        .route("/download/{*path}", get(download))
        .route("/image_qa_process", post(image_qa))
        .route("/image_generation_process", post(image_generation))
        .route("/image_editing_process", post(image_editing))
        .route("/bounding_boxes_process", post(bounding_boxes))
        .route("/object_detection_process", post(object_detection))
        .route("/image_segmentation_process", post(image_segmentation))
        .route("/text_generation_process", post(text_generation))
        .route("/text_streaming_process", get(text_streaming))
        .nest_service("/static", ServeDir::new(static_root))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(state)
}

pub async fn serve(
    pipeline: Arc<Pipeline>,
    credentials: Arc<dyn CredentialStore>,
    addr: SocketAddr,
) -> Result<()> {
    let static_root = pipeline.store().root().to_path_buf();
    let app = router(
        AppState {
            pipeline,
            credentials,
        },
        &static_root,
    );
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, static_root = %static_root.display(), "gemlens listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server stopped with an error")?;
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutdown requested");
    }
}

/// Runs pipeline work on the blocking pool; the upstream client is synchronous.
async fn run_blocking<T, F>(work: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, PipelineError> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|err| ApiError::Internal(format!("worker task failed: {err}")))?
        .map_err(ApiError::from)
}

async fn index(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "service": "gemlens",
        "version": env!("CARGO_PKG_VERSION"),
        "client": state.pipeline.client_name(),
        "configured": state.credentials.get_api_key().is_some(),
        "endpoints": [
            "/image_qa_process",
            "/image_generation_process",
            "/image_editing_process",
            "/bounding_boxes_process",
            "/object_detection_process",
            "/image_segmentation_process",
            "/text_generation_process",
            "/text_streaming_process",
        ],
    }))
}

async fn settings(State(state): State<AppState>) -> Json<Value> {
    let key = state.credentials.get_api_key();
    Json(json!({
        "configured": key.is_some(),
        "masked_key": key.as_deref().map(mask_key).unwrap_or_default(),
        "models": state.pipeline.models(),
        "preferred_font": state.pipeline.fonts().preferred_available(),
    }))
}

async fn save_settings(
    State(state): State<AppState>,
    form: Result<FormFields, ApiError>,
) -> Result<Json<Value>, ApiError> {
    let key = form?.get("api_key").trim().to_string();
    if key.is_empty() {
        return Err(PipelineError::Input("API key cannot be empty".to_string()).into());
    }
    let pipeline = Arc::clone(&state.pipeline);
    let candidate = key.clone();
    match run_blocking(move || pipeline.validate_credential(&candidate)).await {
        Ok(()) => {
            state.credentials.set_api_key(key);
            info!("api key updated");
            Ok(Json(json!({ "message": "API key saved successfully" })))
        }
        Err(ApiError::Pipeline(err)) => {
            Err(PipelineError::Input(format!("Error with API key: {err}")).into())
        }
        Err(other) => Err(other),
    }
}

async fn download(
    State(state): State<AppState>,
    Path(path): Path<String>,
) -> Result<Response, ApiError> {
    let file = state
        .pipeline
        .store()
        .resolve_download(&path)
        .ok_or(ApiError::NotFound)?;
    let bytes = tokio::fs::read(&file)
        .await
        .map_err(|_| ApiError::NotFound)?;
    let name = file
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("download");
    let mime = file
        .extension()
        .and_then(|ext| ext.to_str())
        .and_then(mime_for_extension)
        .unwrap_or("application/octet-stream");
    Ok((
        [
            (header::CONTENT_TYPE, mime.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{name}\""),
            ),
        ],
        bytes,
    )
        .into_response())
}

struct UploadedFile {
    bytes: Vec<u8>,
    filename: Option<String>,
    content_type: Option<String>,
}

#[derive(Default)]
struct UploadForm {
    image: Option<UploadedFile>,
    fields: HashMap<String, String>,
}

fn invalid_body(detail: &str) -> ApiError {
    ApiError::from(PipelineError::Input(format!("Invalid request body: {detail}")))
}

async fn read_upload_form(mut multipart: Multipart) -> Result<UploadForm, ApiError> {
    let invalid = |err: axum::extract::multipart::MultipartError| {
        ApiError::from(PipelineError::Input(format!("Invalid form data: {err}")))
    };
    let mut form = UploadForm::default();
    while let Some(field) = multipart.next_field().await.map_err(invalid)? {
        let name = field.name().unwrap_or_default().to_string();
        if name == "image" {
            let filename = field.file_name().map(str::to_string);
            let content_type = field.content_type().map(str::to_string);
            let bytes = field.bytes().await.map_err(invalid)?;
            // Browsers submit an empty part when no file was chosen.
            if !bytes.is_empty() {
                form.image = Some(UploadedFile {
                    bytes: bytes.to_vec(),
                    filename,
                    content_type,
                });
            }
        } else if field.file_name().is_none() {
            let value = field.text().await.map_err(invalid)?;
            form.fields.insert(name, value);
        }
    }
    Ok(form)
}

fn field<'a>(fields: &'a HashMap<String, String>, name: &str) -> &'a str {
    fields.get(name).map(String::as_str).unwrap_or("")
}

/// Text fields of a form post, sent either urlencoded or as
/// `multipart/form-data`. File parts are ignored.
#[derive(Debug, Default)]
pub struct FormFields(HashMap<String, String>);

impl FormFields {
    fn get(&self, name: &str) -> &str {
        field(&self.0, name)
    }
}

impl<S> FromRequest<S> for FormFields
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let multipart = req
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.trim_start().starts_with("multipart/form-data"));
        if multipart {
            let multipart = Multipart::from_request(req, state)
                .await
                .map_err(|err| invalid_body(&err.body_text()))?;
            return Ok(FormFields(read_upload_form(multipart).await?.fields));
        }
        let Form(fields) = Form::<HashMap<String, String>>::from_request(req, state)
            .await
            .map_err(|err| invalid_body(&err.body_text()))?;
        Ok(FormFields(fields))
    }
}

/// Shared flow for the multipart image endpoints: credential check, upload
/// persistence, then the pipeline operation on the blocking pool.
async fn upload_operation<T, F>(
    state: AppState,
    headers: HeaderMap,
    multipart: Result<Multipart, MultipartRejection>,
    op: F,
) -> Result<Json<T>, ApiError>
where
    T: Serialize + Send + 'static,
    F: FnOnce(&Pipeline, &RequestContext, &Upload, &HashMap<String, String>) -> Result<T, PipelineError>
        + Send
        + 'static,
{
    let ctx = state.context(&headers);
    if !ctx.has_credential() {
        return Err(PipelineError::Configuration.into());
    }
    let multipart = multipart.map_err(|err| invalid_body(&err.body_text()))?;
    let form = read_upload_form(multipart).await?;
    let Some(file) = form.image else {
        return Err(PipelineError::Input("No image uploaded".to_string()).into());
    };
    let fields = form.fields;
    let pipeline = Arc::clone(&state.pipeline);
    let outcome = run_blocking(move || {
        let upload = pipeline
            .store()
            .save_upload(file.bytes, file.filename.as_deref(), file.content_type.as_deref())
            .map_err(|err| PipelineError::storage(&err))?;
        op(&pipeline, &ctx, &upload, &fields)
    })
    .await?;
    Ok(Json(outcome))
}

async fn image_qa(
    State(state): State<AppState>,
    headers: HeaderMap,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<QaOutcome>, ApiError> {
    upload_operation(state, headers, multipart, |pipeline, ctx, upload, fields| {
        pipeline.answer_question(ctx, upload, field(fields, "question"))
    })
    .await
}

async fn image_generation(
    State(state): State<AppState>,
    headers: HeaderMap,
    form: Result<FormFields, ApiError>,
) -> Result<Json<ImageOutcome>, ApiError> {
    let ctx = state.context(&headers);
    if !ctx.has_credential() {
        return Err(PipelineError::Configuration.into());
    }
    let prompt = form?.get("prompt").to_string();
    let pipeline = Arc::clone(&state.pipeline);
    let outcome = run_blocking(move || pipeline.generate_image(&ctx, &prompt)).await?;
    Ok(Json(outcome))
}

async fn image_editing(
    State(state): State<AppState>,
    headers: HeaderMap,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<ImageOutcome>, ApiError> {
    upload_operation(state, headers, multipart, |pipeline, ctx, upload, fields| {
        pipeline.edit_image(ctx, upload, field(fields, "edit_prompt"))
    })
    .await
}

async fn bounding_boxes(
    State(state): State<AppState>,
    headers: HeaderMap,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<LocateOutcome>, ApiError> {
    upload_operation(state, headers, multipart, |pipeline, ctx, upload, fields| {
        pipeline.locate_object(ctx, upload, field(fields, "object_name"))
    })
    .await
}

async fn object_detection(
    State(state): State<AppState>,
    headers: HeaderMap,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<DetectionOutcome>, ApiError> {
    upload_operation(state, headers, multipart, |pipeline, ctx, upload, fields| {
        let categories = Some(field(fields, "categories")).filter(|value| !value.trim().is_empty());
        pipeline.detect_objects(ctx, upload, categories)
    })
    .await
}

async fn image_segmentation(
    State(state): State<AppState>,
    headers: HeaderMap,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<SegmentationOutcome>, ApiError> {
    upload_operation(state, headers, multipart, |pipeline, ctx, upload, _| {
        pipeline.segment(ctx, upload)
    })
    .await
}

async fn text_generation(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<TextRequest>, JsonRejection>,
) -> Result<Json<TextOutcome>, ApiError> {
    let ctx = state.context(&headers);
    if !ctx.has_credential() {
        return Err(PipelineError::Configuration.into());
    }
    let Json(request) = body.map_err(|err| invalid_body(&err.body_text()))?;
    let pipeline = Arc::clone(&state.pipeline);
    let outcome = run_blocking(move || pipeline.generate_text(&ctx, &request)).await?;
    Ok(Json(outcome))
}

#[derive(Debug, Default, Deserialize)]
struct StreamQuery {
    #[serde(default)]
    prompt: String,
}

async fn text_streaming(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<StreamQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let ctx = state.context(&headers);
    let (tx, rx) = mpsc::channel::<StreamFrame>(STREAM_BUFFER);
    produce_frames(Arc::clone(&state.pipeline), ctx, query.prompt, tx);
    let events = stream::unfold(rx, |mut rx| async move {
        let frame = rx.recv().await?;
        let event = Event::default().data(frame.to_value().to_string());
        Some((Ok::<Event, Infallible>(event), rx))
    });
    Sse::new(events).keep_alive(KeepAlive::default())
}

/// Feeds stream frames into `tx` from the blocking pool. Resolves to the
/// number of frames the receiver accepted.
fn produce_frames(
    pipeline: Arc<Pipeline>,
    ctx: RequestContext,
    prompt: String,
    tx: mpsc::Sender<StreamFrame>,
) -> JoinHandle<usize> {
    tokio::task::spawn_blocking(move || {
        let mut delivered = 0;
        pipeline.stream_text(&ctx, &prompt, &mut |frame: StreamFrame| {
            let accepted = tx.blocking_send(frame).is_ok();
            if accepted {
                delivered += 1;
            }
            accepted
        });
        delivered
    })
}
