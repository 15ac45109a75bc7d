use candle_core::{Module, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::flux::autoencoder::Decoder;

use super::LatentDecoder;
use crate::config::VaeConfig;
use crate::error::Result;

/// Decoder half of the FLUX autoencoder (`ae.safetensors`, `decoder.*`).
pub struct FluxVaeDecoder {
    decoder: Decoder,
    config: VaeConfig,
}

impl FluxVaeDecoder {
    pub fn new(config: VaeConfig, vb: VarBuilder) -> Result<Self> {
        let ae_config = config.to_autoencoder_config()?;
        let decoder = Decoder::new(&ae_config, vb.pp("decoder"))?;
        Ok(Self { decoder, config })
    }
}

impl LatentDecoder for FluxVaeDecoder {
    fn config(&self) -> &VaeConfig {
        &self.config
    }

    fn decode(&self, latents: &Tensor) -> candle_core::Result<Tensor> {
        self.decoder.forward(latents)
    }
}
