use anyhow::{Context, Error, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::Module;
use candle_transformers::models::stable_diffusion::{
    build_clip_transformer, clip::ClipTextTransformer, unet_2d::UNet2DConditionModel,
    vae::AutoEncoderKL, StableDiffusionConfig,
};
use hf_hub::api::tokio::Api;
use tokenizers::Tokenizer;
use tracing::{debug, info};

use crate::{
    util::select_best_device, DeviceMap, DiffusionBackend, Loader, ModelVariant, SampleParams,
};

const VAE_SCALE: f64 = 0.18215;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StableDiffusionVariant {
    V1_5,
    V2_1,
}

impl StableDiffusionVariant {
    fn repo(&self) -> &'static str {
        match self {
            Self::V1_5 => "stable-diffusion-v1-5/stable-diffusion-v1-5",
            Self::V2_1 => "stabilityai/stable-diffusion-2-1",
        }
    }

    fn config(&self) -> StableDiffusionConfig {
        match self {
            Self::V1_5 => StableDiffusionConfig::v1_5(None, None, None),
            Self::V2_1 => StableDiffusionConfig::v2_1(None, None, None),
        }
    }
}

pub struct StableDiffusionModel {
    device: Device,
    dtype: DType,
    config: StableDiffusionConfig,
    tokenizer: Tokenizer,
    pad_id: u32,
    clip: ClipTextTransformer,
    unet: UNet2DConditionModel,
    vae: AutoEncoderKL,
}

impl StableDiffusionModel {
    fn tokenize(&self, prompt: &str) -> Result<Vec<u32>> {
        let max_len = self.config.clip.max_position_embeddings;
        let mut tokens = self
            .tokenizer
            .encode(prompt, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        tokens.truncate(max_len);
        tokens.resize(max_len, self.pad_id);
        Ok(tokens)
    }
}

impl DiffusionBackend for StableDiffusionModel {
    fn device(&self) -> &Device {
        &self.device
    }

    fn encode_text(&mut self, prompts: &[String]) -> Result<Tensor> {
        let max_len = self.config.clip.max_position_embeddings;
        let mut ids = Vec::with_capacity(prompts.len() * max_len);
        for prompt in prompts {
            ids.extend(self.tokenize(prompt)?);
        }
        let ids = Tensor::from_vec(ids, (prompts.len(), max_len), &self.device)?;
        Ok(self.clip.forward(&ids)?)
    }

    fn sample(&mut self, params: SampleParams<'_>) -> Result<Tensor> {
        let mut scheduler = self.config.build_scheduler(params.steps)?;
        let [channels, height, width] = params.shape;

        let latents = match params.start_noise {
            Some(noise) => noise.to_device(&self.device)?.to_dtype(self.dtype)?,
            None => Tensor::randn(
                0f32,
                1f32,
                (params.batch_size, channels, height, width),
                &self.device,
            )?
            .to_dtype(self.dtype)?,
        };
        let mut latents = (latents * scheduler.init_noise_sigma())?;

        let embeddings = match params.unconditional_conditioning {
            Some(uc) => Tensor::cat(&[uc, params.conditioning], 0)?,
            None => params.conditioning.clone(),
        };
        let guided = params.unconditional_conditioning.is_some();

        let timesteps = scheduler.timesteps().to_vec();
        for (index, &timestep) in timesteps.iter().enumerate() {
            let input = if guided {
                Tensor::cat(&[&latents, &latents], 0)?
            } else {
                latents.clone()
            };
            let input = scheduler.scale_model_input(input, timestep)?;
            let noise_pred = self.unet.forward(&input, timestep as f64, &embeddings)?;
            let noise_pred = if guided {
                let chunks = noise_pred.chunk(2, 0)?;
                let (uncond, cond) = (&chunks[0], &chunks[1]);
                (uncond + ((cond - uncond)? * params.guidance_scale)?)?
            } else {
                noise_pred
            };
            latents = scheduler.step(&noise_pred, timestep, &latents)?;
            debug!("step {}/{} done", index + 1, timesteps.len());
        }
        Ok(latents)
    }

    fn decode(&mut self, latents: &Tensor) -> Result<Tensor> {
        Ok(self.vae.decode(&(latents / VAE_SCALE)?)?)
    }
}

pub struct StableDiffusionLoader;

impl Loader for StableDiffusionLoader {
    type Model = StableDiffusionModel;

    async fn load(variant: ModelVariant, api: Api, device_map: DeviceMap) -> Result<Self::Model> {
        let ModelVariant::StableDiffusion(variant) = variant;

        // Configure device.
        let device = select_best_device(device_map).context("failed to set up device")?;
        let dtype = if device.is_cpu() { DType::F32 } else { DType::F16 };
        let config = variant.config();
        info!("loading {variant:?} on {device:?} as {dtype:?}");

        // --- Tokenizer ---
        let tokenizer_file = api
            .model("openai/clip-vit-base-patch32".to_string())
            .get("tokenizer.json")
            .await
            .context("failed to get CLIP tokenizer")?;
        let tokenizer = Tokenizer::from_file(tokenizer_file)
            .map_err(Error::msg)
            .context("failed to load CLIP tokenizer")?;
        let pad_token = config.clip.pad_with.as_deref().unwrap_or("<|endoftext|>");
        let pad_id = tokenizer
            .token_to_id(pad_token)
            .with_context(|| format!("tokenizer has no `{pad_token}` token"))?;

        // --- Weights ---
        let repo = api.model(variant.repo().to_string());
        let clip_file = repo
            .get("text_encoder/model.safetensors")
            .await
            .context("failed to get text encoder weights")?;
        let unet_file = repo
            .get("unet/diffusion_pytorch_model.safetensors")
            .await
            .context("failed to get UNet weights")?;
        let vae_file = repo
            .get("vae/diffusion_pytorch_model.safetensors")
            .await
            .context("failed to get VAE weights")?;

        let clip = build_clip_transformer(&config.clip, &clip_file, &device, dtype)
            .context("failed to load text encoder")?;
        let unet = config
            .build_unet(&unet_file, &device, 4, cfg!(feature = "flash-attn"), dtype)
            .context("failed to load UNet")?;
        let vae = config
            .build_vae(&vae_file, &device, dtype)
            .context("failed to load VAE")?;

        Ok(StableDiffusionModel {
            device,
            dtype,
            config,
            tokenizer,
            pad_id,
            clip,
            unet,
            vae,
        })
    }
}
