pub mod device_map;
pub mod loader;
mod loader_factory;
pub mod reclaim;
mod util;

mod sd;

pub use device_map::*;
use image::DynamicImage;
pub use loader::*;
pub use loader_factory::*;
pub use reclaim::*;
pub use sd::{SdLoader, SdModel, SdVersion};
use serde::{Deserialize, Serialize};
use thiserror::Error;
pub(crate) use util::*;

// Define the request type shared between the worker and the pipeline.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, PartialOrd)]
pub struct GenerationRequest {
    pub prompt: String,
    pub width: Option<usize>,
    pub height: Option<usize>,
    pub steps: Option<usize>,
    pub guidance: Option<f64>,
    pub seed: Option<u64>,
}

pub trait TextToImage: Send + Sync {
    fn generate(&self, request: GenerationRequest) -> anyhow::Result<DynamicImage>;
}

/// The prompt tokenized past the text encoder's position limit. Typed so
/// callers can classify it as caller error rather than a pipeline failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("prompt is too long: {len} tokens exceeds the {max}-token limit")]
pub struct PromptTooLong {
    pub len: usize,
    pub max: usize,
}
