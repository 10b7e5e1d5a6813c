mod registry;
mod selectors;

pub use registry::{ModelRegistry, ModelSpec};
pub use selectors::{ModelSelection, ModelSelector, NoModelForCapability};
