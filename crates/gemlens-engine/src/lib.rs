pub mod annotate;
pub mod client;
pub mod error;
pub mod extract;
pub mod fallback;
pub mod fonts;
pub mod geometry;
pub mod pipeline;
pub mod store;
pub mod strategy;
pub mod tasks;

pub use client::{ClientSettings, DryrunClient, GeminiClient, GenerativeClient};
pub use error::PipelineError;
pub use fonts::FontBook;
pub use pipeline::{
    DetectionOutcome, ImageOutcome, LocateOutcome, Pipeline, QaOutcome, SegmentationOutcome,
    StreamFrame, TextMode, TextOutcome, TextRequest,
};
pub use store::{ResultStore, Upload};
pub use tasks::{ModelOverrides, TaskModels};
