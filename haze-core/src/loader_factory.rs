use anyhow::{anyhow, Result};
use candle_core::Device;
use hf_hub::api::tokio::Api;
use tracing::info;

use crate::{LoadOptions, Loader, SdLoader, SdVersion, TextToImage};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub enum ModelVariant {
    StableDiffusion { repo: String, version: SdVersion },
}

impl ModelVariant {
    /// Detect model variant from the model repository name.
    pub fn from_name(model_name: &str) -> Option<Self> {
        let version = SdVersion::from_name(model_name)?;
        Some(Self::StableDiffusion {
            repo: model_name.to_string(),
            version,
        })
    }
}

/// Load a model based on its repository name, automatically detecting the
/// appropriate loader. Also hands back the compute device the weights ended
/// up on, so callers can tie per-request memory reclaim to it.
pub async fn load_model(
    model_name: &str,
    api: Api,
    options: LoadOptions,
) -> Result<(Arc<dyn TextToImage>, Device)> {
    let variant = ModelVariant::from_name(model_name)
        .ok_or_else(|| anyhow!("unsupported model: {}", model_name))?;

    let ModelVariant::StableDiffusion { version, .. } = &variant;
    info!(model = model_name, %version, "loading model");

    let model = SdLoader::load(variant, api, options).await?;
    let device = model.device().clone();
    Ok((Arc::new(model), device))
}
