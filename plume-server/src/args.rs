use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use plume_core::{
    watermark::DEFAULT_WATERMARK, DeviceMap, GenerationRequest, GridOptions, LatestPointer,
    PlumeError, PromptSource,
};
use serde::Deserialize;

// Define command line arguments
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Plume text-to-image server")]
pub struct Args {
    /// Host address to bind the server to
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,

    /// Port to bind the server to
    #[arg(long, default_value_t = 5555)]
    pub port: u16,

    /// Model to load, e.g. `stable-diffusion-v1-5` or `stable-diffusion-2-1`
    #[arg(long, default_value = "stable-diffusion-v1-5")]
    pub model: String,

    /// Use CPU instead of GPU
    #[arg(long)]
    pub cpu: bool,

    /// Devices to load a model replica on, one worker each (`0,1` or `cpu`)
    #[arg(long, value_delimiter = ',', default_value = "0")]
    pub devices: Vec<DeviceMap>,

    /// Requests that may wait for a free worker before new ones are rejected
    #[arg(long, default_value_t = 16)]
    pub queue_capacity: usize,

    /// Directory samples and grids are written to
    #[arg(long, default_value = "outputs/txt2img-samples")]
    pub outdir: PathBuf,

    /// File overwritten with every image written
    #[arg(long, default_value = "outputs/latest.png")]
    pub latest: PathBuf,

    /// Do not maintain the latest-image file
    #[arg(long)]
    pub no_latest: bool,

    /// Text embedded as an invisible watermark
    #[arg(long, default_value = DEFAULT_WATERMARK)]
    pub watermark: String,

    #[arg(long)]
    pub no_watermark: bool,

    /// Image substituted for samples flagged by a safety classifier
    #[arg(long, default_value = "assets/placeholder.png")]
    pub placeholder: PathBuf,

    #[command(flatten)]
    pub defaults: GenerationDefaults,
}

impl Args {
    pub fn device_maps(&self) -> Vec<DeviceMap> {
        if self.cpu {
            vec![DeviceMap::ForceCpu]
        } else {
            self.devices.clone()
        }
    }

    pub fn latest_pointer(&self) -> LatestPointer {
        if self.no_latest {
            LatestPointer::Disabled
        } else {
            LatestPointer::Overwrite(self.latest.clone())
        }
    }
}

/// Generation settings used for every field a request leaves out.
#[derive(clap::Args, Debug, Clone)]
pub struct GenerationDefaults {
    /// Number of sampling steps
    #[arg(long, default_value_t = 50)]
    pub steps: usize,

    /// Classifier-free guidance scale
    #[arg(long, default_value_t = 7.5)]
    pub scale: f64,

    /// How many times every prompt batch is sampled
    #[arg(long, default_value_t = 2)]
    pub n_iter: usize,

    /// Images per batch
    #[arg(long, default_value_t = 1)]
    pub n_samples: usize,

    #[arg(long = "height", short = 'H', default_value_t = 512)]
    pub height: usize,

    #[arg(long = "width", short = 'W', default_value_t = 512)]
    pub width: usize,

    /// Latent channels
    #[arg(long = "channels", short = 'C', default_value_t = 4)]
    pub channels: usize,

    /// Downsampling factor between pixels and latents
    #[arg(long = "factor", short = 'f', default_value_t = 8)]
    pub factor: usize,

    #[arg(long)]
    pub seed: Option<u64>,

    /// Share one start noise across all samples of a request
    #[arg(long)]
    pub fixed_code: bool,

    /// Also write a grid of all samples
    #[arg(long)]
    pub grid: bool,

    /// Images per grid row, defaults to n_samples
    #[arg(long)]
    pub n_rows: Option<usize>,

    /// Prompt file, one prompt per line, used when a request names no prompt
    #[arg(long)]
    pub from_file: Option<PathBuf>,
}

impl GenerationDefaults {
    pub fn to_request(&self) -> Result<GenerationRequest> {
        let prompt = match &self.from_file {
            Some(path) => PromptSource::from_file(path)
                .with_context(|| format!("failed to read prompts from {}", path.display()))?,
            None => PromptSource::Single(String::new()),
        };
        Ok(GenerationRequest {
            prompt,
            sample_count: self.n_samples,
            iteration_count: self.n_iter,
            guidance_scale: self.scale,
            step_count: self.steps,
            height: self.height,
            width: self.width,
            latent_channels: self.channels,
            downsample_factor: self.factor,
            seed: self.seed,
            fixed_start_noise: self.fixed_code,
            save_samples: true,
            grid: self.grid.then(|| GridOptions {
                rows: self.n_rows.filter(|&rows| rows > 0),
            }),
        })
    }
}

/// JSON body of `POST /generate`. Missing fields fall back to the server defaults.
#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct GenerateParams {
    pub prompt: Option<String>,
    pub prompts: Option<Vec<String>>,
    pub n_samples: Option<usize>,
    pub n_iter: Option<usize>,
    pub steps: Option<usize>,
    pub scale: Option<f64>,
    pub height: Option<usize>,
    pub width: Option<usize>,
    pub seed: Option<u64>,
    pub fixed_code: Option<bool>,
    pub grid: Option<bool>,
    pub n_rows: Option<usize>,
}

impl GenerateParams {
    pub fn into_request(self, defaults: &GenerationRequest) -> Result<GenerationRequest, PlumeError> {
        let prompt = match (self.prompt, self.prompts) {
            (Some(_), Some(_)) => {
                return Err(PlumeError::configuration(
                    "give either `prompt` or `prompts`, not both",
                ))
            }
            (Some(prompt), None) => PromptSource::Single(prompt),
            (None, Some(prompts)) => PromptSource::Lines(prompts),
            (None, None) if !defaults.prompt.is_empty() => defaults.prompt.clone(),
            (None, None) => return Err(PlumeError::configuration("no prompt given")),
        };

        let grid = match self.grid {
            Some(true) => Some(defaults.grid.clone().unwrap_or_default()),
            Some(false) => None,
            None => defaults.grid.clone(),
        }
        .map(|grid| match self.n_rows {
            Some(0) => GridOptions { rows: None },
            Some(rows) => GridOptions { rows: Some(rows) },
            None => grid,
        });

        let request = GenerationRequest {
            prompt,
            sample_count: self.n_samples.unwrap_or(defaults.sample_count),
            iteration_count: self.n_iter.unwrap_or(defaults.iteration_count),
            guidance_scale: self.scale.unwrap_or(defaults.guidance_scale),
            step_count: self.steps.unwrap_or(defaults.step_count),
            height: self.height.unwrap_or(defaults.height),
            width: self.width.unwrap_or(defaults.width),
            seed: self.seed.or(defaults.seed),
            fixed_start_noise: self.fixed_code.unwrap_or(defaults.fixed_start_noise),
            grid,
            ..defaults.clone()
        };
        request.validate()?;
        Ok(request)
    }
}
