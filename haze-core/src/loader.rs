use std::future::Future;

use anyhow::Result;
use candle_core::DType;
use hf_hub::api::tokio::Api;

use crate::loader_factory::ModelVariant;
use crate::{DeviceMap, TextToImage};

/// Numeric format used for the model weights on the compute device.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Precision {
    /// f16 weights, halving the memory footprint of the loaded model.
    #[default]
    Reduced,
    /// f32 weights.
    Full,
}

impl Precision {
    pub fn dtype(self) -> DType {
        match self {
            Self::Reduced => DType::F16,
            Self::Full => DType::F32,
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct LoadOptions {
    pub device_map: DeviceMap,
    pub precision: Precision,
    /// Attention slice size; slicing trades throughput for lower peak
    /// memory during inference. `None` disables slicing.
    pub attention_slice: Option<usize>,
}

pub trait Loader {
    type Model: TextToImage;

    fn load(
        variant: ModelVariant,
        api: Api,
        options: LoadOptions,
    ) -> impl Future<Output = Result<Self::Model>>
    where
        Self: Sized;
}
