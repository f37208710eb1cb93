use std::future::Future;

use anyhow::Result;
use hf_hub::api::tokio::Api;

use crate::{DeviceMap, DiffusionBackend, ModelVariant};

/// Fetches weights for a model family and places one replica on a device.
pub trait Loader {
    type Model: DiffusionBackend;

    fn load(
        variant: ModelVariant,
        api: Api,
        device_map: DeviceMap,
    ) -> impl Future<Output = Result<Self::Model>>
    where
        Self: Sized;
}
