//! Latent preparation, VAE encode and decode

use burn::prelude::*;
use burn_diffuse_image::{join_tiles, normalize_image, repeat_batch, split_tiles};
use burn_diffuse_samplers::{AnyScheduler, Scheduler};
use tracing::debug;

use super::{DiffuseContext, Diffuser};
use crate::backend::{Graph, InferenceBackend, TensorMap, names};
use crate::error::{DiffuseError, Result};
use crate::pipeline::DiffuseRequest;

/// Index of the first inference step a partial run performs
///
/// `init = min(floor(steps * strength), steps)` steps are kept, so
/// `strength = 1` starts at 0 and `strength = 0` skips everything.
pub fn strength_start(steps: usize, strength: f32) -> usize {
    let init = ((steps as f32 * strength).floor().max(0.0) as usize).min(steps);
    steps - init
}

/// Initial latents plus what image-conditioned variants keep for later
pub(super) struct Prepared<B: Backend> {
    pub latents: Tensor<B, 4>,
    /// Scaled encoder latents of the input image, before noising
    pub original: Option<Tensor<B, 4>>,
    /// Noise mixed into `original`
    pub noise: Option<Tensor<B, 4>>,
}

impl Diffuser {
    /// Build the latents the loop starts from
    pub(super) async fn prepare_latents<B, E>(
        &self,
        ctx: &DiffuseContext<'_, B, E>,
        request: &DiffuseRequest<B>,
        scheduler: &mut AnyScheduler<B>,
        timesteps: &[usize],
    ) -> Result<Prepared<B>>
    where
        B: Backend,
        E: InferenceBackend<B> + ?Sized,
    {
        let options = &request.options;
        let count = request.sample_count();
        let latent_shape = [
            count,
            ctx.model.latent_channels,
            options.height / ctx.model.vae_factor,
            options.width / ctx.model.vae_factor,
        ];

        match self {
            Diffuser::ImageToImage | Diffuser::InpaintLegacy | Diffuser::ControlNetImage => {
                let image = required_image(self, request)?;
                check_image(&image, options.height, options.width)?;
                let mut encoded = ctx.encode(image).await?;
                if options.initial_noise_level > 0.0 {
                    let dims = encoded.dims();
                    encoded = encoded + scheduler.create_random_sample(dims, options.initial_noise_level);
                }
                let original = repeat_batch(encoded * ctx.model.scale_factor, count);

                let noise = scheduler.create_random_sample(original.dims(), 1.0);
                let first = &timesteps[..timesteps.len().min(1)];
                let latents = scheduler.add_noise(original.clone(), noise.clone(), first)?;
                debug!(start = ?first.first(), "image latents noised");

                Ok(Prepared {
                    latents,
                    original: Some(original),
                    noise: Some(noise),
                })
            }
            Diffuser::Upscale => {
                // Latents live at the input resolution and start at the noise
                // level of the first visited timestep, not the full schedule's
                let image = required_image(self, request)?;
                let [_, _, height, width] = image.dims();
                let shape = [count, ctx.model.latent_channels, height, width];
                let noise = scheduler.create_random_sample(shape, 1.0);
                let first = &timesteps[..timesteps.len().min(1)];
                let latents = scheduler.add_noise(noise.zeros_like(), noise, first)?;
                debug!(start = ?first.first(), "upscale latents drawn");
                Ok(Prepared {
                    latents,
                    original: None,
                    noise: None,
                })
            }
            Diffuser::TextToImage
            | Diffuser::Inpaint
            | Diffuser::ControlNet
            | Diffuser::Instruct
            | Diffuser::InstructControlNet
            | Diffuser::Animate => {
                let sigma = scheduler.init_noise_sigma();
                Ok(Prepared {
                    latents: scheduler.create_random_sample(latent_shape, sigma),
                    original: None,
                    noise: None,
                })
            }
        }
    }

    /// Decode latents to images, one sample at a time
    pub(super) async fn decode_latents<B, E>(
        &self,
        ctx: &DiffuseContext<'_, B, E>,
        latents: Tensor<B, 4>,
    ) -> Result<Tensor<B, 4>>
    where
        B: Backend,
        E: InferenceBackend<B> + ?Sized,
    {
        let latents = latents / ctx.model.scale_factor;
        let [batch, channels, height, width] = latents.dims();

        let mut images = Vec::with_capacity(batch);
        for i in 0..batch {
            let sample = latents
                .clone()
                .slice([i..i + 1, 0..channels, 0..height, 0..width]);
            images.push(ctx.decode(sample).await?);
        }
        Ok(Tensor::cat(images, 0))
    }
}

fn required_image<B: Backend>(diffuser: &Diffuser, request: &DiffuseRequest<B>) -> Result<Tensor<B, 4>> {
    request
        .input_image
        .clone()
        .ok_or(DiffuseError::MissingInput {
            diffuser: *diffuser,
            input: "image",
        })
}

/// Input images must be a single `[1, 3, height, width]` sample
pub(super) fn check_image<B: Backend>(image: &Tensor<B, 4>, height: usize, width: usize) -> Result<()> {
    let dims = image.dims();
    if dims != [1, 3, height, width] {
        return Err(DiffuseError::Shape {
            name: "input_image",
            expected: vec![1, 3, height, width],
            actual: dims.to_vec(),
        });
    }
    Ok(())
}

impl<B: Backend, E: InferenceBackend<B> + ?Sized> DiffuseContext<'_, B, E> {
    /// VAE-encode a `[0, 1]` image (unscaled latents)
    pub(super) async fn encode(&self, image: Tensor<B, 4>) -> Result<Tensor<B, 4>> {
        let inputs = TensorMap::new().with(names::SAMPLE, normalize_image(image));
        self.infer_sample(Graph::VaeEncoder, inputs).await
    }

    /// VAE-decode one sample, through tiles when it exceeds the tile size
    pub(super) async fn decode(&self, latents: Tensor<B, 4>) -> Result<Tensor<B, 4>> {
        let [_, _, height, width] = latents.dims();
        let tiling = &self.model.tiling;
        if !tiling.should_tile(height, width) {
            return self.decode_tile(latents).await;
        }

        debug!(height, width, overlap = tiling.overlap, mode = ?tiling.mode, "tiled decode");
        let set = split_tiles(latents, tiling.overlap)?;
        let mut decoded = Vec::with_capacity(4);
        for tile in set.tiles.iter().cloned() {
            decoded.push(self.decode_tile(tile).await?);
        }
        let tiles: [Tensor<B, 4>; 4] = decoded.try_into().map_err(|_| {
            DiffuseError::Config("tiled decode produced the wrong number of tiles".into())
        })?;

        let [_, _, tile_height, _] = set.tile_dims();
        let [_, _, decoded_height, _] = tiles[0].dims();
        let factor = decoded_height / tile_height.max(1);
        Ok(join_tiles(set.rescale(tiles, factor)?, tiling.mode)?)
    }

    async fn decode_tile(&self, latents: Tensor<B, 4>) -> Result<Tensor<B, 4>> {
        let inputs = TensorMap::new().with(names::LATENT_SAMPLE, latents);
        self.infer_sample(Graph::VaeDecoder, inputs).await
    }
}
