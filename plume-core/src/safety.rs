use std::path::{Path, PathBuf};

use candle_core::{IndexOp, Tensor};
use image::imageops::FilterType;
use tracing::{info, warn};

use crate::{PlumeError, Result};

/// Screens decoded images for disallowed content.
pub trait SafetyClassifier: Send {
    /// Takes a (batch, height, width, 3) tensor in [0, 1]. Returns the batch, possibly altered,
    /// and one flag per image.
    fn classify(&mut self, pixels: Tensor) -> anyhow::Result<(Tensor, Vec<bool>)>;
}

/// Output of [`SafetyFilter::screen`].
#[derive(Debug, Clone)]
pub struct SafetyVerdict {
    pub pixels: Tensor,
    pub flags: Vec<bool>,
}

impl SafetyVerdict {
    pub fn flagged(&self) -> usize {
        self.flags.iter().filter(|&&flag| flag).count()
    }
}

/// Replaces every flagged image with a fixed placeholder asset.
pub struct SafetyFilter {
    classifier: Box<dyn SafetyClassifier>,
    placeholder: PathBuf,
}

impl SafetyFilter {
    pub fn new(classifier: Box<dyn SafetyClassifier>, placeholder: impl Into<PathBuf>) -> Self {
        Self {
            classifier,
            placeholder: placeholder.into(),
        }
    }

    pub fn screen(&mut self, pixels: Tensor) -> Result<SafetyVerdict> {
        let expected = pixels.dim(0)?;
        let (checked, flags) = self
            .classifier
            .classify(pixels)
            .map_err(PlumeError::generation)?;
        let returned = match checked.dims() {
            [n, _, _, _] => *n,
            dims => {
                return Err(PlumeError::ContractViolation(format!(
                    "safety classifier returned a tensor of shape {dims:?}, expected (batch, height, width, 3)"
                )))
            }
        };
        if flags.len() != expected || returned != expected {
            return Err(PlumeError::ContractViolation(format!(
                "safety classifier returned {} flags and {returned} images for a batch of {expected}",
                flags.len()
            )));
        }

        let verdict = if flags.iter().any(|&flag| flag) {
            let images = flags
                .iter()
                .enumerate()
                .map(|(i, &flagged)| -> Result<Tensor> {
                    let image = checked.i(i)?;
                    Ok(if flagged {
                        self.substitute(image)
                    } else {
                        image
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            SafetyVerdict {
                pixels: Tensor::stack(&images, 0)?,
                flags,
            }
        } else {
            SafetyVerdict {
                pixels: checked,
                flags,
            }
        };
        if verdict.flagged() > 0 {
            info!(
                "safety filter replaced {} of {expected} images",
                verdict.flagged()
            );
        }
        Ok(verdict)
    }

    /// Falls back to the original image if the placeholder cannot be loaded.
    fn substitute(&self, image: Tensor) -> Tensor {
        match load_placeholder(&self.placeholder, &image) {
            Ok(placeholder) => placeholder,
            Err(e) => {
                warn!(
                    "could not load placeholder {}, keeping unfiltered image: {e:#}",
                    self.placeholder.display()
                );
                image
            }
        }
    }
}

impl std::fmt::Debug for SafetyFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SafetyFilter")
            .field("placeholder", &self.placeholder)
            .finish_non_exhaustive()
    }
}

/// Loads the placeholder resized to `like`'s (height, width), in `like`'s dtype and device.
fn load_placeholder(path: &Path, like: &Tensor) -> anyhow::Result<Tensor> {
    let (height, width, channels) = like.dims3()?;
    if channels != 3 {
        anyhow::bail!("expected 3 channels, got {channels}");
    }
    let asset = image::open(path)?.to_rgb8();
    let resized = image::imageops::resize(
        &asset,
        width as u32,
        height as u32,
        FilterType::CatmullRom,
    );
    let tensor = crate::util::image_to_tensor(&resized, like.device())?;
    Ok(tensor.to_dtype(like.dtype())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    struct FixedFlags(Vec<bool>);

    impl SafetyClassifier for FixedFlags {
        fn classify(&mut self, pixels: Tensor) -> anyhow::Result<(Tensor, Vec<bool>)> {
            Ok((pixels, self.0.clone()))
        }
    }

    fn batch() -> Tensor {
        // Three 2x3 images filled with 0.25, 0.5 and 0.75.
        let images: Vec<Tensor> = [0.25f32, 0.5, 0.75]
            .iter()
            .map(|&v| Tensor::full(v, (2, 3, 3), &Device::Cpu).unwrap())
            .collect();
        Tensor::stack(&images, 0).unwrap()
    }

    fn red_placeholder(dir: &Path) -> PathBuf {
        let path = dir.join("placeholder.png");
        image::RgbImage::from_pixel(8, 8, image::Rgb([255, 0, 0]))
            .save(&path)
            .unwrap();
        path
    }

    fn image_values(pixels: &Tensor, i: usize) -> Vec<f32> {
        pixels.i(i).unwrap().flatten_all().unwrap().to_vec1().unwrap()
    }

    fn assert_close(actual: &[f32], expected: &[f32]) {
        assert_eq!(actual.len(), expected.len());
        for (a, e) in actual.iter().zip(expected) {
            assert!((a - e).abs() < 0.01, "{actual:?} != {expected:?}");
        }
    }

    #[test]
    fn flagged_images_become_placeholder() {
        let dir = tempfile::tempdir().unwrap();
        let mut filter = SafetyFilter::new(
            Box::new(FixedFlags(vec![true, false, true])),
            red_placeholder(dir.path()),
        );
        let input = batch();

        let verdict = filter.screen(input.clone()).unwrap();

        assert_eq!(verdict.flags, [true, false, true]);
        assert_eq!(verdict.flagged(), 2);
        assert_eq!(verdict.pixels.dims(), input.dims());
        let red: Vec<f32> = [1.0, 0.0, 0.0].repeat(6);
        assert_close(&image_values(&verdict.pixels, 0), &red);
        assert_eq!(image_values(&verdict.pixels, 1), image_values(&input, 1));
        assert_close(&image_values(&verdict.pixels, 2), &red);
    }

    #[test]
    fn placeholder_keeps_dtype() {
        let dir = tempfile::tempdir().unwrap();
        let mut filter = SafetyFilter::new(
            Box::new(FixedFlags(vec![true, false, false])),
            red_placeholder(dir.path()),
        );
        let input = batch().to_dtype(DType::F64).unwrap();
        let verdict = filter.screen(input).unwrap();
        assert_eq!(verdict.pixels.dtype(), DType::F64);
    }

    #[test]
    fn missing_placeholder_keeps_original() {
        let mut filter = SafetyFilter::new(
            Box::new(FixedFlags(vec![true, true, false])),
            "/nonexistent/placeholder.png",
        );
        let input = batch();

        let verdict = filter.screen(input.clone()).unwrap();

        assert_eq!(verdict.flags, [true, true, false]);
        for i in 0..3 {
            assert_eq!(image_values(&verdict.pixels, i), image_values(&input, i));
        }
    }

    #[test]
    fn flag_count_mismatch_is_contract_violation() {
        let mut filter = SafetyFilter::new(Box::new(FixedFlags(vec![false, false])), "unused.png");
        let err = filter.screen(batch()).unwrap_err();
        assert!(matches!(err, PlumeError::ContractViolation(_)));
    }

    #[test]
    fn malformed_classifier_output_is_contract_violation() {
        struct Scalar;
        impl SafetyClassifier for Scalar {
            fn classify(&mut self, _pixels: Tensor) -> anyhow::Result<(Tensor, Vec<bool>)> {
                Ok((Tensor::new(0.5f32, &Device::Cpu)?, vec![false; 3]))
            }
        }
        let mut filter = SafetyFilter::new(Box::new(Scalar), "unused.png");
        assert!(matches!(
            filter.screen(batch()),
            Err(PlumeError::ContractViolation(_))
        ));
    }

    #[test]
    fn classifier_error_aborts() {
        struct Broken;
        impl SafetyClassifier for Broken {
            fn classify(&mut self, _pixels: Tensor) -> anyhow::Result<(Tensor, Vec<bool>)> {
                anyhow::bail!("classifier offline")
            }
        }
        let mut filter = SafetyFilter::new(Box::new(Broken), "unused.png");
        assert!(matches!(
            filter.screen(batch()),
            Err(PlumeError::Generation(_))
        ));
    }
}
