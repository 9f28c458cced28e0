use anyhow::{anyhow, Context, Error, Result};
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::Module;
use candle_transformers::models::stable_diffusion::{
    self, clip::ClipTextTransformer, schedulers::Scheduler, unet_2d::UNet2DConditionModel,
    vae::AutoEncoderKL, StableDiffusionConfig,
};
use hf_hub::api::tokio::Api;
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use tokenizers::Tokenizer;
use tracing::{debug, info};

use crate::{
    select_best_device, tensor_to_image, GenerationRequest, LoadOptions, Loader, ModelVariant,
    Precision, PromptTooLong, TextToImage,
};

/// Latent-space scaling factor shared by the v1/v2 autoencoders.
const VAE_SCALE: f64 = 0.18215;

const DEFAULT_STEPS: usize = 30;
const DEFAULT_GUIDANCE: f64 = 7.5;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SdVersion {
    V1_4,
    V1_5,
    V2_1,
}

serde_plain::derive_display_from_serialize!(SdVersion);

impl SdVersion {
    /// Detect the version from a model repository name. SDXL-family repos
    /// are rejected outright, they need a second text encoder.
    pub fn from_name(model_name: &str) -> Option<Self> {
        let name_upper = model_name.to_uppercase();

        if !name_upper.contains("STABLE-DIFFUSION") || name_upper.contains("XL") {
            return None;
        }

        if name_upper.contains("V1-4") {
            Some(SdVersion::V1_4)
        } else if name_upper.contains("V1-5") {
            Some(SdVersion::V1_5)
        } else if name_upper.contains("2-1") {
            Some(SdVersion::V2_1)
        } else {
            Some(SdVersion::V1_5) // Default to v1.5 if no specific version is found
        }
    }

    /// Width and height the version was trained at.
    pub fn default_dims(self) -> (usize, usize) {
        match self {
            Self::V1_4 | Self::V1_5 => (512, 512),
            Self::V2_1 => (768, 768),
        }
    }

    fn tokenizer_repo(self) -> &'static str {
        "openai/clip-vit-base-patch32"
    }

    fn config(self, attention_slice: Option<usize>) -> StableDiffusionConfig {
        match self {
            // v1.4 shares the v1.5 architecture.
            Self::V1_4 | Self::V1_5 => StableDiffusionConfig::v1_5(attention_slice, None, None),
            Self::V2_1 => StableDiffusionConfig::v2_1(attention_slice, None, None),
        }
    }
}

// Weight files follow the diffusers repo layout; the fp16 variants keep the
// on-device footprint at half of full precision.
fn clip_file(precision: Precision) -> &'static str {
    match precision {
        Precision::Reduced => "text_encoder/model.fp16.safetensors",
        Precision::Full => "text_encoder/model.safetensors",
    }
}

fn vae_file(precision: Precision) -> &'static str {
    match precision {
        Precision::Reduced => "vae/diffusion_pytorch_model.fp16.safetensors",
        Precision::Full => "vae/diffusion_pytorch_model.safetensors",
    }
}

fn unet_file(precision: Precision) -> &'static str {
    match precision {
        Precision::Reduced => "unet/diffusion_pytorch_model.fp16.safetensors",
        Precision::Full => "unet/diffusion_pytorch_model.safetensors",
    }
}

pub struct SdModel {
    device: Device,
    dtype: DType,
    version: SdVersion,
    config: StableDiffusionConfig,
    tokenizer: Tokenizer,
    pad_id: u32,
    clip_model: ClipTextTransformer,
    autoencoder: AutoEncoderKL,
    unet: UNet2DConditionModel,
}

impl SdModel {
    pub fn device(&self) -> &Device {
        &self.device
    }

    fn text_embedding(&self, prompt: &str) -> Result<Tensor> {
        let mut tokens = self
            .tokenizer
            .encode(prompt, true)
            .map_err(Error::msg)? // Encode the prompt
            .get_ids()
            .to_vec();
        let max_len = self.config.clip.max_position_embeddings;
        if tokens.len() > max_len {
            return Err(PromptTooLong {
                len: tokens.len(),
                max: max_len,
            }
            .into());
        }
        tokens.resize(max_len, self.pad_id);
        let input_token_ids = Tensor::new(&*tokens, &self.device)?.unsqueeze(0)?;
        Ok(self.clip_model.forward(&input_token_ids)?)
    }

    /// Conditional embedding, paired with the unconditional one when
    /// classifier-free guidance is in effect.
    fn encode_prompt(&self, prompt: &str, use_guidance: bool) -> Result<Tensor> {
        let cond_emb = self.text_embedding(prompt)?;
        if !use_guidance {
            return Ok(cond_emb.to_dtype(self.dtype)?);
        }
        let uncond_emb = self.text_embedding("")?;
        Ok(Tensor::cat(&[uncond_emb, cond_emb], 0)?.to_dtype(self.dtype)?)
    }
}

impl TextToImage for SdModel {
    fn generate(&self, request: GenerationRequest) -> Result<DynamicImage> {
        // Set defaults.
        let (default_width, default_height) = self.version.default_dims();
        let width = request.width.unwrap_or(default_width);
        let height = request.height.unwrap_or(default_height);
        let steps = request.steps.unwrap_or(DEFAULT_STEPS);
        let guidance = request.guidance.unwrap_or(DEFAULT_GUIDANCE);
        let use_guidance = guidance > 1.0;

        // Optionally set seed for reproducibility.
        if let Some(seed) = request.seed {
            self.device.set_seed(seed)?;
        }

        let started = std::time::Instant::now();

        // --- Compute the text embeddings with the preloaded CLIP stack ---
        let text_embeddings = self.encode_prompt(&request.prompt, use_guidance)?;

        // --- Create the noise latents and the denoising schedule ---
        let mut scheduler = self.config.build_scheduler(steps)?;
        let latents = Tensor::randn(0f32, 1f32, (1, 4, height / 8, width / 8), &self.device)?;
        let mut latents = (latents * scheduler.init_noise_sigma())?.to_dtype(self.dtype)?;

        // --- Run denoising via the preloaded UNet ---
        let timesteps = scheduler.timesteps().to_vec();
        for &timestep in timesteps.iter() {
            let latent_model_input = if use_guidance {
                Tensor::cat(&[&latents, &latents], 0)?
            } else {
                latents.clone()
            };
            let latent_model_input = scheduler.scale_model_input(latent_model_input, timestep)?;
            let noise_pred =
                self.unet
                    .forward(&latent_model_input, timestep as f64, &text_embeddings)?;
            let noise_pred = if use_guidance {
                let noise_pred = noise_pred.chunk(2, 0)?;
                let (noise_pred_uncond, noise_pred_text) = (&noise_pred[0], &noise_pred[1]);
                (noise_pred_uncond + ((noise_pred_text - noise_pred_uncond)? * guidance)?)?
            } else {
                noise_pred
            };
            latents = scheduler.step(&noise_pred, timestep, &latents)?;
            debug!(timestep, "denoising step");
        }

        // --- Decode the latents using the preloaded autoencoder ---
        let decoded = self.autoencoder.decode(&(&latents / VAE_SCALE)?)?;

        // --- Postprocessing: scale, clamp, convert type, convert to image ---
        let img = ((decoded / 2.)? + 0.5)?.to_device(&Device::Cpu)?;
        let img = (img.clamp(0f32, 1.)? * 255.)?.to_dtype(DType::U8)?;
        let img_tensor = img.i(0)?;

        info!(
            width,
            height,
            steps,
            elapsed = ?started.elapsed(),
            "generated image"
        );

        tensor_to_image(&img_tensor)
    }
}

pub struct SdLoader;

impl Loader for SdLoader {
    type Model = SdModel;

    async fn load(variant: ModelVariant, api: Api, options: LoadOptions) -> Result<Self::Model> {
        let ModelVariant::StableDiffusion { repo, version } = variant;

        // Configure device.
        let device = select_best_device(options.device_map).context("failed to set up device")?;
        let dtype = options.precision.dtype();
        let config = version.config(options.attention_slice);

        // --- Load the CLIP tokenizer ---
        let tokenizer_file = api
            .model(version.tokenizer_repo().to_string())
            .get("tokenizer.json")
            .await
            .context("failed to get CLIP tokenizer")?;
        let tokenizer = Tokenizer::from_file(tokenizer_file)
            .map_err(Error::msg)
            .context("failed to load CLIP tokenizer")?;
        let pad_token = config.clip.pad_with.as_deref().unwrap_or("<|endoftext|>");
        let pad_id = *tokenizer
            .get_vocab(true)
            .get(pad_token)
            .ok_or_else(|| anyhow!("padding token {pad_token} missing from tokenizer vocab"))?;

        let weights_repo = api.model(repo);

        // --- Load the CLIP text encoder ---
        // The text encoder runs in f32 and the embeddings are cast
        // afterwards; it is a small fraction of the resident weights.
        let clip_weights = weights_repo
            .get(clip_file(options.precision))
            .await
            .context("failed to get text encoder weights")?;
        let clip_model =
            stable_diffusion::build_clip_transformer(&config.clip, clip_weights, &device, DType::F32)
                .context("failed to load text encoder")?;

        // --- Load the autoencoder ---
        let vae_weights = weights_repo
            .get(vae_file(options.precision))
            .await
            .context("failed to get autoencoder weights")?;
        let autoencoder = config
            .build_vae(vae_weights, &device, dtype)
            .context("failed to load autoencoder")?;

        // --- Load the UNet ---
        let unet_weights = weights_repo
            .get(unet_file(options.precision))
            .await
            .context("failed to get unet weights")?;
        let unet = config
            .build_unet(
                unet_weights,
                &device,
                4,
                cfg!(feature = "flash-attn"),
                dtype,
            )
            .context("failed to load unet")?;

        info!(%version, "model components loaded");

        Ok(SdModel {
            device,
            dtype,
            version,
            config,
            tokenizer,
            pad_id,
            clip_model,
            autoencoder,
            unet,
        })
    }
}
