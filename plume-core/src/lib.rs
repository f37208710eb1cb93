#[cfg(feature = "accelerate")]
extern crate accelerate_src;
#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

pub mod artifact;
pub mod batcher;
pub mod device_map;
mod error;
pub mod loader;
mod loader_factory;
pub mod orchestrator;
pub mod pipeline;
pub mod safety;
pub mod service;
pub mod util;
pub mod watermark;

mod stable_diffusion;

pub use artifact::{ArtifactRecord, ArtifactWriter, LatestPointer, OutputManifest};
pub use batcher::{batch_prompts, PromptBatch, PromptSource};
pub use candle_core::{DType, Device, Tensor};
pub use device_map::*;
pub use error::{PlumeError, Result};
pub use loader::*;
pub use loader_factory::*;
pub use orchestrator::{SampleBatch, SampleOrchestrator};
pub use pipeline::Pipeline;
pub use safety::{SafetyClassifier, SafetyFilter, SafetyVerdict};
pub use service::GenerationService;
pub use stable_diffusion::{StableDiffusionLoader, StableDiffusionModel, StableDiffusionVariant};
pub use watermark::{BgrImage, DwtDctCodec, WatermarkCodec, WatermarkStage};

use serde::{Deserialize, Serialize};

/// Contact-sheet settings for a request.
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct GridOptions {
    /// Images per grid row. Defaults to the request's sample count.
    pub rows: Option<usize>,
}

/// Largest accepted height or width, in pixels.
pub const MAX_IMAGE_SIDE: usize = 4096;
/// Largest accepted `height * width * sample_count`.
pub const MAX_BATCH_PIXELS: usize = 16 * 1024 * 1024;
pub const MAX_SAMPLE_COUNT: usize = 64;
pub const MAX_ITERATION_COUNT: usize = 256;
pub const MAX_STEP_COUNT: usize = 1000;
pub const MAX_LATENT_CHANNELS: usize = 64;

/// One text-to-image job, consumed once by a [`Pipeline`].
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: PromptSource,
    /// Images per sampler call (the batch size).
    pub sample_count: usize,
    /// How many times every batch is sampled.
    pub iteration_count: usize,
    pub guidance_scale: f64,
    pub step_count: usize,
    pub height: usize,
    pub width: usize,
    pub latent_channels: usize,
    pub downsample_factor: usize,
    pub seed: Option<u64>,
    /// Reuse one start noise tensor for every batch and iteration.
    pub fixed_start_noise: bool,
    pub save_samples: bool,
    pub grid: Option<GridOptions>,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: PromptSource::Single(prompt.into()),
            ..Default::default()
        }
    }

    /// Rejects malformed requests before any model call.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("sample_count", self.sample_count),
            ("iteration_count", self.iteration_count),
            ("step_count", self.step_count),
            ("latent_channels", self.latent_channels),
            ("downsample_factor", self.downsample_factor),
            ("height", self.height),
            ("width", self.width),
        ];
        for (name, value) in positive {
            if value < 1 {
                return Err(PlumeError::configuration(format!(
                    "{name} must be at least 1"
                )));
            }
        }
        let bounded = [
            ("sample_count", self.sample_count, MAX_SAMPLE_COUNT),
            ("iteration_count", self.iteration_count, MAX_ITERATION_COUNT),
            ("step_count", self.step_count, MAX_STEP_COUNT),
            ("latent_channels", self.latent_channels, MAX_LATENT_CHANNELS),
            ("height", self.height, MAX_IMAGE_SIDE),
            ("width", self.width, MAX_IMAGE_SIDE),
        ];
        for (name, value, max) in bounded {
            if value > max {
                return Err(PlumeError::configuration(format!(
                    "{name} must be at most {max}, got {value}"
                )));
            }
        }
        let batch_pixels = self
            .height
            .checked_mul(self.width)
            .and_then(|pixels| pixels.checked_mul(self.sample_count));
        if !matches!(batch_pixels, Some(pixels) if pixels <= MAX_BATCH_PIXELS) {
            return Err(PlumeError::configuration(format!(
                "{} images of {}x{} exceed the budget of {MAX_BATCH_PIXELS} pixels per batch",
                self.sample_count, self.width, self.height
            )));
        }
        if self.height % self.downsample_factor != 0 || self.width % self.downsample_factor != 0 {
            return Err(PlumeError::configuration(format!(
                "{}x{} is not divisible by the downsample factor {}",
                self.height, self.width, self.downsample_factor
            )));
        }
        if !self.guidance_scale.is_finite() {
            return Err(PlumeError::configuration("guidance_scale must be finite"));
        }
        if self.prompt.is_empty() {
            return Err(PlumeError::configuration("no prompt given"));
        }
        if matches!(&self.grid, Some(GridOptions { rows: Some(0) })) {
            return Err(PlumeError::configuration("grid rows must be at least 1"));
        }
        Ok(())
    }

    /// Latent shape `[C, H / f, W / f]` handed to the sampler.
    pub fn latent_shape(&self) -> [usize; 3] {
        [
            self.latent_channels,
            self.height / self.downsample_factor,
            self.width / self.downsample_factor,
        ]
    }
}

impl Default for GenerationRequest {
    fn default() -> Self {
        Self {
            prompt: PromptSource::Single(String::new()),
            sample_count: 1,
            iteration_count: 2,
            guidance_scale: 7.5,
            step_count: 50,
            height: 512,
            width: 512,
            latent_channels: 4,
            downsample_factor: 8,
            seed: None,
            fixed_start_noise: false,
            save_samples: true,
            grid: None,
        }
    }
}

/// Sampler inputs for one prompt batch.
#[derive(Debug, Clone, Copy)]
pub struct SampleParams<'a> {
    pub steps: usize,
    pub conditioning: &'a Tensor,
    pub unconditional_conditioning: Option<&'a Tensor>,
    pub guidance_scale: f64,
    pub batch_size: usize,
    /// `[C, H / f, W / f]`
    pub shape: [usize; 3],
    pub start_noise: Option<&'a Tensor>,
}

/// The model capabilities a pipeline drives. Calls are not reentrant, hence `&mut self`.
pub trait DiffusionBackend: Send {
    fn device(&self) -> &Device;

    /// Text to conditioning, one row per prompt.
    fn encode_text(&mut self, prompts: &[String]) -> anyhow::Result<Tensor>;

    /// Runs the full denoising loop and returns latents shaped `(batch, C, H / f, W / f)`.
    fn sample(&mut self, params: SampleParams<'_>) -> anyhow::Result<Tensor>;

    /// Latents to pixels shaped `(batch, 3, H, W)` in `[-1, 1]`.
    fn decode(&mut self, latents: &Tensor) -> anyhow::Result<Tensor>;
}

impl<B: DiffusionBackend + ?Sized> DiffusionBackend for Box<B> {
    fn device(&self) -> &Device {
        (**self).device()
    }

    fn encode_text(&mut self, prompts: &[String]) -> anyhow::Result<Tensor> {
        (**self).encode_text(prompts)
    }

    fn sample(&mut self, params: SampleParams<'_>) -> anyhow::Result<Tensor> {
        (**self).sample(params)
    }

    fn decode(&mut self, latents: &Tensor) -> anyhow::Result<Tensor> {
        (**self).decode(latents)
    }
}
