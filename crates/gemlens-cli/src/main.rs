mod credentials;
mod server;

use std::fs;
use std::io::{self, Write};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use gemlens_contracts::context::RequestContext;
use gemlens_contracts::models::ModelSelector;
use gemlens_engine::client::DEFAULT_API_BASE;
use gemlens_engine::pipeline::{DEFAULT_EDIT_PROMPT, DEFAULT_OBJECT_NAME, DEFAULT_QUESTION};
use gemlens_engine::{
    ClientSettings, DryrunClient, FontBook, GeminiClient, GenerativeClient, ModelOverrides,
    Pipeline, PipelineError, ResultStore, StreamFrame, TaskModels, TextMode, TextRequest, Upload,
};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::credentials::SharedCredential;

#[derive(Debug, Parser)]
#[command(
    name = "gemlens",
    version,
    about = "Gemini multimodal demos with response normalization and annotation"
)]
struct Cli {
    #[command(flatten)]
    engine: EngineArgs,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct EngineArgs {
    /// Root for uploads/ and results/.
    #[arg(long, env = "GEMLENS_STATIC_DIR", default_value = "static", global = true)]
    static_dir: PathBuf,
    #[arg(long, env = "GEMINI_API_KEY", hide_env_values = true, global = true)]
    api_key: Option<String>,
    #[arg(long, env = "GEMINI_API_BASE", default_value = DEFAULT_API_BASE, global = true)]
    api_base: String,
    /// TrueType font for labels; the embedded DejaVu Sans is used otherwise.
    #[arg(long, env = "GEMLENS_FONT", global = true)]
    font: Option<PathBuf>,
    /// Upstream request timeout in seconds.
    #[arg(long, default_value_t = 90.0, global = true)]
    request_timeout: f64,
    #[arg(long, default_value_t = 2, global = true)]
    transport_retries: usize,
    /// Answer from the offline client instead of calling Gemini.
    #[arg(long, global = true)]
    dry_run: bool,
    #[arg(long, global = true)]
    qa_model: Option<String>,
    #[arg(long, global = true)]
    image_model: Option<String>,
    #[arg(long, global = true)]
    image_fallback_model: Option<String>,
    #[arg(long, global = true)]
    edit_model: Option<String>,
    #[arg(long, global = true)]
    edit_fallback_model: Option<String>,
    #[arg(long, global = true)]
    detect_model: Option<String>,
    #[arg(long, global = true)]
    segment_model: Option<String>,
    #[arg(long, global = true)]
    text_model: Option<String>,
    #[arg(long, global = true)]
    reasoning_model: Option<String>,
    #[arg(long, global = true)]
    stream_model: Option<String>,
}

impl EngineArgs {
    fn model_overrides(&self) -> ModelOverrides {
        ModelOverrides {
            qa: self.qa_model.clone(),
            image: self.image_model.clone(),
            image_fallback: self.image_fallback_model.clone(),
            edit: self.edit_model.clone(),
            edit_fallback: self.edit_fallback_model.clone(),
            detect: self.detect_model.clone(),
            segment: self.segment_model.clone(),
            text: self.text_model.clone(),
            reasoning: self.reasoning_model.clone(),
            stream: self.stream_model.clone(),
        }
    }

    fn client_settings(&self) -> ClientSettings {
        ClientSettings {
            api_base: self.api_base.clone(),
            request_timeout_s: self.request_timeout,
            transport_retries: self.transport_retries,
            ..ClientSettings::default()
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the HTTP demo server.
    Serve(ServeArgs),
    /// Ask a question about an image.
    Ask(AskArgs),
    /// Generate an image from a prompt.
    Generate(PromptArgs),
    /// Edit an image with an instruction.
    Edit(EditArgs),
    /// Draw a bounding box around one named object.
    Locate(LocateArgs),
    /// Detect and label objects.
    Detect(DetectArgs),
    /// Produce one mask overlay per segmented object.
    Segment(ImageArgs),
    /// Generate text in one of the demo modes.
    Text(TextArgs),
    /// Stream a text reply to stdout.
    Stream(PromptArgs),
}

#[derive(Debug, Parser)]
struct ServeArgs {
    #[arg(long, env = "GEMLENS_HOST", default_value = "127.0.0.1")]
    host: IpAddr,
    #[arg(long, env = "GEMLENS_PORT", default_value_t = 5000)]
    port: u16,
}

#[derive(Debug, Parser)]
struct ImageArgs {
    #[arg(long)]
    image: PathBuf,
}

#[derive(Debug, Parser)]
struct AskArgs {
    #[arg(long)]
    image: PathBuf,
    #[arg(long, default_value = DEFAULT_QUESTION)]
    question: String,
}

#[derive(Debug, Parser)]
struct PromptArgs {
    #[arg(long)]
    prompt: String,
}

#[derive(Debug, Parser)]
struct EditArgs {
    #[arg(long)]
    image: PathBuf,
    #[arg(long, default_value = DEFAULT_EDIT_PROMPT)]
    instruction: String,
}

#[derive(Debug, Parser)]
struct LocateArgs {
    #[arg(long)]
    image: PathBuf,
    #[arg(long, default_value = DEFAULT_OBJECT_NAME)]
    object: String,
}

#[derive(Debug, Parser)]
struct DetectArgs {
    #[arg(long)]
    image: PathBuf,
    /// Comma-separated categories to look for.
    #[arg(long)]
    categories: Option<String>,
}

#[derive(Debug, Parser)]
struct TextArgs {
    #[arg(long)]
    prompt: String,
    /// simple, system, reasoning or structured.
    #[arg(long, default_value = "simple", value_parser = parse_text_mode)]
    mode: TextMode,
    #[arg(long)]
    system: Option<String>,
}

fn parse_text_mode(raw: &str) -> Result<TextMode, String> {
    TextMode::parse(raw).ok_or_else(|| format!("unknown text mode '{raw}'"))
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("gemlens error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    init_tracing();
    let pipeline = build_pipeline(&cli.engine)?;
    let ctx = RequestContext::new(cli.engine.api_key.clone());
    match cli.command {
        Command::Serve(args) => {
            run_serve(pipeline, cli.engine.api_key, args)?;
            Ok(0)
        }
        Command::Ask(args) => {
            let upload = load_upload(&pipeline, &args.image)?;
            emit_outcome(pipeline.answer_question(&ctx, &upload, &args.question))
        }
        Command::Generate(args) => emit_outcome(pipeline.generate_image(&ctx, &args.prompt)),
        Command::Edit(args) => {
            let upload = load_upload(&pipeline, &args.image)?;
            emit_outcome(pipeline.edit_image(&ctx, &upload, &args.instruction))
        }
        Command::Locate(args) => {
            let upload = load_upload(&pipeline, &args.image)?;
            emit_outcome(pipeline.locate_object(&ctx, &upload, &args.object))
        }
        Command::Detect(args) => {
            let upload = load_upload(&pipeline, &args.image)?;
            emit_outcome(pipeline.detect_objects(&ctx, &upload, args.categories.as_deref()))
        }
        Command::Segment(args) => {
            let upload = load_upload(&pipeline, &args.image)?;
            emit_outcome(pipeline.segment(&ctx, &upload))
        }
        Command::Text(args) => {
            let request = TextRequest {
                prompt: args.prompt,
                mode: args.mode,
                system_instruction: args.system,
            };
            emit_outcome(pipeline.generate_text(&ctx, &request))
        }
        Command::Stream(args) => run_stream(&pipeline, &ctx, &args.prompt),
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();
}

fn build_pipeline(args: &EngineArgs) -> Result<Pipeline> {
    let fonts = FontBook::load(args.font.as_deref());
    let store = ResultStore::new(&args.static_dir);
    store.ensure_dirs()?;
    let models = TaskModels::resolve(&ModelSelector::new(None), &args.model_overrides())
        .context("task model resolution failed")?;
    let client: Box<dyn GenerativeClient> = if args.dry_run {
        Box::new(DryrunClient)
    } else {
        Box::new(GeminiClient::new(args.client_settings())?)
    };
    info!(
        client = client.name(),
        static_dir = %args.static_dir.display(),
        preferred_font = fonts.preferred_available(),
        "pipeline ready"
    );
    Ok(Pipeline::new(client, store, fonts, models))
}

/// The upstream client is blocking, so it is built before the runtime and
/// its last handle is dropped after the runtime has stopped.
fn run_serve(pipeline: Pipeline, api_key: Option<String>, args: ServeArgs) -> Result<()> {
    let pipeline = Arc::new(pipeline);
    let credentials = Arc::new(SharedCredential::new(api_key));
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    let addr = SocketAddr::new(args.host, args.port);
    let served = runtime.block_on(server::serve(Arc::clone(&pipeline), credentials, addr));
    drop(runtime);
    drop(pipeline);
    served
}

fn load_upload(pipeline: &Pipeline, path: &Path) -> Result<Upload> {
    let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let filename = path.file_name().and_then(|name| name.to_str());
    pipeline.store().save_upload(bytes, filename, None)
}

fn emit_outcome<T: Serialize>(result: Result<T, PipelineError>) -> Result<i32> {
    match result {
        Ok(outcome) => {
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            Ok(0)
        }
        Err(err) => {
            eprintln!("{}", serde_json::to_string_pretty(&server::error_body(&err))?);
            Ok(exit_code_for(&err))
        }
    }
}

fn exit_code_for(err: &PipelineError) -> i32 {
    match err {
        PipelineError::Configuration
        | PipelineError::Input(_)
        | PipelineError::Extraction { .. } => 2,
        PipelineError::Upstream(_) | PipelineError::Render(_) | PipelineError::Storage(_) => 1,
    }
}

fn run_stream(pipeline: &Pipeline, ctx: &RequestContext, prompt: &str) -> Result<i32> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    let mut code = 0;
    let mut write_failed = None;
    pipeline.stream_text(ctx, prompt, &mut |frame: StreamFrame| match frame {
        StreamFrame::Text(text) => match out.write_all(text.as_bytes()).and_then(|_| out.flush()) {
            Ok(()) => true,
            Err(err) => {
                write_failed = Some(err);
                false
            }
        },
        StreamFrame::Done => true,
        StreamFrame::Error(message) => {
            eprintln!("gemlens stream error: {message}");
            code = 1;
            true
        }
    });
    if let Some(err) = write_failed {
        return Err(err).context("failed to write stream output");
    }
    writeln!(out)?;
    Ok(code)
}

#[cfg(test)]
mod tests {
    use clap::Parser;
    use gemlens_engine::{PipelineError, TextMode};

    use super::{build_pipeline, exit_code_for, Cli, Command};

    #[test]
    fn global_options_follow_the_subcommand() {
        let cli = Cli::parse_from([
            "gemlens",
            "text",
            "--prompt",
            "hello",
            "--mode",
            "reasoning",
            "--dry-run",
            "--detect-model",
            "gemini-2.5-pro",
        ]);
        assert!(cli.engine.dry_run);
        assert_eq!(
            cli.engine.model_overrides().detect.as_deref(),
            Some("gemini-2.5-pro")
        );
        match cli.command {
            Command::Text(args) => {
                assert_eq!(args.prompt, "hello");
                assert_eq!(args.mode, TextMode::Reasoning);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn unknown_text_mode_is_rejected() {
        let parsed = Cli::try_parse_from(["gemlens", "text", "--prompt", "x", "--mode", "poem"]);
        assert!(parsed.is_err());
    }

    #[test]
    fn input_failures_use_distinct_exit_code() {
        assert_eq!(exit_code_for(&PipelineError::Configuration), 2);
        assert_eq!(exit_code_for(&PipelineError::Storage("disk".to_string())), 1);
    }

    #[test]
    fn dry_run_pipeline_creates_static_layout() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let static_dir = temp.path().join("static");
        let cli = Cli::parse_from([
            "gemlens",
            "--static-dir",
            static_dir.to_str().unwrap_or_default(),
            "--dry-run",
            "segment",
            "--image",
            "photo.png",
        ]);
        let pipeline = build_pipeline(&cli.engine)?;
        assert_eq!(pipeline.client_name(), "dryrun");
        assert!(static_dir.join("uploads").is_dir());
        assert!(static_dir.join("results").is_dir());
        Ok(())
    }
}
