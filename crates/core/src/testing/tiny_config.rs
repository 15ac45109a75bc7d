use crate::config::{IpAdapterConfig, SchedulerConfig, TransformerConfig, VaeConfig};

/// Tiny FLUX-shaped transformer: 2 double + 3 single blocks, hidden 16.
/// Packed latents are 16 wide, so 4 latent channels.
pub fn tiny_transformer_config() -> TransformerConfig {
    TransformerConfig {
        in_channels: 16,
        vec_in_dim: 8,
        context_in_dim: 12,
        num_heads: 2,
        head_dim: 8,
        mlp_ratio: 2.0,
        depth: 2,
        depth_single_blocks: 3,
        axes_dim: vec![2, 2, 4],
        theta: 10_000,
        qkv_bias: true,
        guidance_embed: true,
        ip_adapter: None,
    }
}

pub fn tiny_ip_adapter_config() -> IpAdapterConfig {
    IpAdapterConfig {
        image_embed_dim: 6,
        num_tokens: 2,
        scale: 1.0,
    }
}

/// VAE with the usual 8x downsampling, 4 latent channels and a 64px
/// native resolution.
pub fn tiny_vae_config() -> VaeConfig {
    VaeConfig {
        latent_channels: 4,
        block_out_channels: vec![8, 8, 8, 8],
        layers_per_block: 1,
        sample_size: 64,
        ..VaeConfig::default()
    }
}

/// Dev scheduler bounds scaled down to tiny images.
pub fn tiny_scheduler_config() -> SchedulerConfig {
    SchedulerConfig {
        base_image_seq_len: Some(4),
        max_image_seq_len: Some(64),
        ..SchedulerConfig::dev()
    }
}
