use anyhow::{anyhow, Result};
use hf_hub::api::tokio::Api;
use tracing::info;

use crate::{DeviceMap, DiffusionBackend, Loader, StableDiffusionLoader, StableDiffusionVariant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelVariant {
    StableDiffusion(StableDiffusionVariant),
}

impl ModelVariant {
    /// Detect model variant from a model name such as `stable-diffusion-v1-5` or `sd-2.1`.
    pub fn from_name(model_name: &str) -> Option<Self> {
        let name = model_name.to_lowercase().replace(['_', '.'], "-");
        let is_sd = name.contains("stable-diffusion") || name.starts_with("sd");
        if !is_sd {
            return None;
        }
        let variant = if name.contains("2-1") || name.contains("v2") || name.contains("sd2") {
            StableDiffusionVariant::V2_1
        } else {
            StableDiffusionVariant::V1_5
        };
        Some(ModelVariant::StableDiffusion(variant))
    }
}

/// Load a model based on its name, automatically detecting the appropriate loader
pub async fn load_model(
    model_name: &str,
    api: Api,
    device_map: DeviceMap,
) -> Result<Box<dyn DiffusionBackend>> {
    let variant = ModelVariant::from_name(model_name)
        .ok_or_else(|| anyhow!("Unsupported model: {model_name}"))?;
    info!("loading model {model_name} (variant {variant:?}) on device {device_map}");

    match variant {
        ModelVariant::StableDiffusion(_) => {
            let model = StableDiffusionLoader::load(variant, api, device_map).await?;
            Ok(Box::new(model))
        }
    }
}
