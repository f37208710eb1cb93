use candle_core::{DType, Device, Tensor};
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::StandardNormal;
use tracing::debug;

use crate::{DiffusionBackend, GenerationRequest, PlumeError, PromptBatch, Result, SampleParams};

/// Decoded pixels for one (iteration, prompt batch) pair.
#[derive(Debug, Clone)]
pub struct SampleBatch {
    pub iteration: usize,
    pub batch_index: usize,
    pub prompts: Vec<String>,
    /// (batch, height, width, 3), f32 in [0, 1], on the CPU.
    pub pixels: Tensor,
}

/// Drives the backend through every iteration and prompt batch of a request.
pub struct SampleOrchestrator<B> {
    backend: B,
}

impl<B: DiffusionBackend> SampleOrchestrator<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Lazily yields one [`SampleBatch`] per `(iteration, batch)` in generation order.
    ///
    /// Batches run strictly one after another. The first error ends the run.
    pub fn run<'a>(
        &'a mut self,
        request: &'a GenerationRequest,
        batches: &'a [PromptBatch],
    ) -> Result<SampleRun<'a, B>> {
        let noise = if request.fixed_start_noise {
            let mut rng = match request.seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_entropy(),
            };
            let fixed = draw_noise(
                &mut rng,
                request.sample_count,
                request.latent_shape(),
                self.backend.device(),
            )?;
            NoisePolicy::Fixed(fixed)
        } else if let Some(seed) = request.seed {
            NoisePolicy::Seeded(StdRng::seed_from_u64(seed))
        } else {
            NoisePolicy::SamplerDrawn
        };

        Ok(SampleRun {
            backend: &mut self.backend,
            request,
            batches,
            noise,
            iteration: 0,
            batch_index: 0,
            done: batches.is_empty(),
        })
    }
}

enum NoisePolicy {
    SamplerDrawn,
    Seeded(StdRng),
    Fixed(Tensor),
}

/// Iterator returned by [`SampleOrchestrator::run`].
pub struct SampleRun<'a, B> {
    backend: &'a mut B,
    request: &'a GenerationRequest,
    batches: &'a [PromptBatch],
    noise: NoisePolicy,
    iteration: usize,
    batch_index: usize,
    done: bool,
}

impl<B: DiffusionBackend> SampleRun<'_, B> {
    fn start_noise(&mut self, batch_size: usize) -> Result<Option<Tensor>> {
        let shape = self.request.latent_shape();
        match &mut self.noise {
            NoisePolicy::SamplerDrawn => Ok(None),
            NoisePolicy::Seeded(rng) => Ok(Some(draw_noise(
                rng,
                batch_size,
                shape,
                self.backend.device(),
            )?)),
            NoisePolicy::Fixed(noise) => {
                let available = noise.dim(0)?;
                Ok(Some(if batch_size < available {
                    noise.narrow(0, 0, batch_size)?
                } else {
                    noise.clone()
                }))
            }
        }
    }

    fn sample_batch(&mut self, batch: &PromptBatch) -> Result<Tensor> {
        let prompts = batch.prompts();
        let request = self.request;
        let unconditional = if request.guidance_scale != 1.0 {
            let empty = vec![String::new(); prompts.len()];
            Some(
                self.backend
                    .encode_text(&empty)
                    .map_err(PlumeError::generation)?,
            )
        } else {
            None
        };
        let conditioning = self
            .backend
            .encode_text(prompts)
            .map_err(PlumeError::generation)?;
        let start_noise = self.start_noise(prompts.len())?;

        let latents = self
            .backend
            .sample(SampleParams {
                steps: request.step_count,
                conditioning: &conditioning,
                unconditional_conditioning: unconditional.as_ref(),
                guidance_scale: request.guidance_scale,
                batch_size: prompts.len(),
                shape: request.latent_shape(),
                start_noise: start_noise.as_ref(),
            })
            .map_err(PlumeError::generation)?;
        let decoded = self
            .backend
            .decode(&latents)
            .map_err(PlumeError::generation)?;

        let pixels = decoded
            .affine(0.5, 0.5)?
            .clamp(0f32, 1f32)?
            .permute((0, 2, 3, 1))?
            .to_device(&Device::Cpu)?
            .to_dtype(DType::F32)?
            .contiguous()?;
        Ok(pixels)
    }
}

impl<B: DiffusionBackend> Iterator for SampleRun<'_, B> {
    type Item = Result<SampleBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let (iteration, batch_index) = (self.iteration, self.batch_index);
        let batches = self.batches;
        let batch = &batches[batch_index];
        debug!(
            "sampling iteration {}/{}, batch {}/{}",
            iteration + 1,
            self.request.iteration_count,
            batch_index + 1,
            batches.len()
        );
        let result = self.sample_batch(batch).map(|pixels| SampleBatch {
            iteration,
            batch_index,
            prompts: batch.prompts().to_vec(),
            pixels,
        });

        self.batch_index += 1;
        if self.batch_index == batches.len() {
            self.batch_index = 0;
            self.iteration += 1;
        }
        self.done = result.is_err() || self.iteration >= self.request.iteration_count;
        Some(result)
    }
}

fn draw_noise(
    rng: &mut StdRng,
    batch_size: usize,
    [channels, height, width]: [usize; 3],
    device: &Device,
) -> Result<Tensor> {
    let len = [channels, height, width]
        .into_iter()
        .try_fold(batch_size, usize::checked_mul)
        .ok_or_else(|| PlumeError::configuration("start noise shape overflows"))?;
    let data: Vec<f32> = (0..len).map(|_| rng.sample::<f32, _>(StandardNormal)).collect();
    Ok(Tensor::from_vec(
        data,
        (batch_size, channels, height, width),
        device,
    )?)
}
