use std::{sync::Arc, time::Instant};

use image::RgbImage;
use tracing::info;

use crate::{
    artifact::{compose_grid, OutputImage},
    batch_prompts,
    util::tensor_to_images,
    ArtifactWriter, DiffusionBackend, GenerationRequest, OutputManifest, PlumeError, Result,
    SafetyFilter, SampleOrchestrator, WatermarkStage,
};

/// Batching, sampling, safety filtering, watermarking and writing for one model replica.
pub struct Pipeline {
    orchestrator: SampleOrchestrator<Box<dyn DiffusionBackend>>,
    safety: Option<SafetyFilter>,
    watermark: WatermarkStage,
    writer: Arc<ArtifactWriter>,
}

impl Pipeline {
    pub fn new(
        backend: Box<dyn DiffusionBackend>,
        safety: Option<SafetyFilter>,
        watermark: WatermarkStage,
        writer: Arc<ArtifactWriter>,
    ) -> Self {
        Self {
            orchestrator: SampleOrchestrator::new(backend),
            safety,
            watermark,
            writer,
        }
    }

    pub fn writer(&self) -> &Arc<ArtifactWriter> {
        &self.writer
    }

    /// Runs `request` to completion and returns every file written.
    ///
    /// Files written before a failure stay on disk.
    pub fn generate(&mut self, request: &GenerationRequest) -> Result<OutputManifest> {
        request.validate()?;
        let batches = batch_prompts(&request.prompt, request.sample_count)?;
        let start = Instant::now();
        info!(
            "generating {} batch(es) x {} iteration(s), {}x{}, {} steps",
            batches.len(),
            request.iteration_count,
            request.width,
            request.height,
            request.step_count
        );

        let mut manifest = OutputManifest::default();
        let mut grid_cells: Vec<RgbImage> = Vec::new();
        for sample in self.orchestrator.run(request, &batches)? {
            let sample = sample?;
            let pixels = match &mut self.safety {
                Some(filter) => filter.screen(sample.pixels)?.pixels,
                None => sample.pixels,
            };
            let images = tensor_to_images(&pixels).map_err(PlumeError::generation)?;

            if request.save_samples {
                let marked = images
                    .iter()
                    .map(|img| -> Result<OutputImage> {
                        Ok(OutputImage {
                            image: self.watermark.apply(img.clone())?,
                            watermarked: self.watermark.is_enabled(),
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                manifest.samples.extend(self.writer.write_samples(marked)?);
            }
            if request.grid.is_some() {
                grid_cells.extend(images);
            }
        }

        if let Some(grid) = &request.grid {
            let per_row = grid.rows.unwrap_or(request.sample_count);
            let sheet = compose_grid(&grid_cells, per_row)?;
            let record = self.writer.write_grid(OutputImage {
                image: self.watermark.apply(sheet)?,
                watermarked: self.watermark.is_enabled(),
            })?;
            manifest.grid = Some(record);
        }

        info!(
            "wrote {} sample(s){} in {:.2}s",
            manifest.samples.len(),
            if manifest.grid.is_some() { " and a grid" } else { "" },
            start.elapsed().as_secs_f32()
        );
        Ok(manifest)
    }
}
