mod dwt_dct;

use std::sync::Arc;

use image::RgbImage;

use crate::{PlumeError, Result};

pub use dwt_dct::DwtDctCodec;

/// Payload embedded into every output when watermarking is on.
pub const DEFAULT_WATERMARK: &str = "StableDiffusionV1";

/// Interleaved 8-bit image in blue, green, red order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BgrImage {
    width: usize,
    height: usize,
    data: Vec<u8>,
}

impl BgrImage {
    pub fn new(width: usize, height: usize, data: Vec<u8>) -> Result<Self> {
        if data.len() != width * height * 3 {
            return Err(PlumeError::Watermark(format!(
                "expected {} bytes for a {width}x{height} image, got {}",
                width * height * 3,
                data.len()
            )));
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    pub fn from_rgb(img: RgbImage) -> Self {
        let (width, height) = img.dimensions();
        let mut data = img.into_raw();
        swap_red_blue(&mut data);
        Self {
            width: width as usize,
            height: height as usize,
            data,
        }
    }

    pub fn into_rgb(self) -> Result<RgbImage> {
        let Self {
            width,
            height,
            mut data,
        } = self;
        swap_red_blue(&mut data);
        RgbImage::from_raw(width as u32, height as u32, data)
            .ok_or_else(|| PlumeError::Watermark("codec returned a truncated image".into()))
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn as_raw(&self) -> &[u8] {
        &self.data
    }

    pub fn as_raw_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

fn swap_red_blue(data: &mut [u8]) {
    for px in data.chunks_exact_mut(3) {
        px.swap(0, 2);
    }
}

/// An invisible, machine-decodable watermark. Works on BGR images.
pub trait WatermarkCodec: Send + Sync {
    fn encode(&self, image: BgrImage, payload: &[u8]) -> Result<BgrImage>;

    /// Recovers `payload_len` bytes from a marked image.
    fn decode(&self, image: &BgrImage, payload_len: usize) -> Result<Vec<u8>>;
}

/// Embeds the configured payload into every image leaving the pipeline.
#[derive(Clone)]
pub struct WatermarkStage {
    encoder: Option<(Arc<dyn WatermarkCodec>, Vec<u8>)>,
}

impl WatermarkStage {
    pub fn new(codec: Arc<dyn WatermarkCodec>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            encoder: Some((codec, payload.into())),
        }
    }

    /// The default DWT-DCT codec carrying [`DEFAULT_WATERMARK`].
    pub fn dwt_dct() -> Self {
        Self::new(Arc::new(DwtDctCodec::default()), DEFAULT_WATERMARK)
    }

    pub fn disabled() -> Self {
        Self { encoder: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.encoder.is_some()
    }

    /// Returns the marked image, or the input unchanged when no encoder is configured.
    pub fn apply(&self, img: RgbImage) -> Result<RgbImage> {
        match &self.encoder {
            Some((codec, payload)) => codec.encode(BgrImage::from_rgb(img), payload)?.into_rgb(),
            None => Ok(img),
        }
    }
}

impl std::fmt::Debug for WatermarkStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatermarkStage")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}
