//! Stable Diffusion pipelines backed by candle
//!
//! One [`StableDiffusion`] holds the text encoders, UNet and VAE. The text-to-image
//! and image-to-image pipelines share it through an `Arc`, so enabling both modes
//! loads the weights once.

use anyhow::{anyhow, bail, Context, Error as E, Result};
use candle_core::{DType, Device, IndexOp, Module, Tensor, D};
use candle_transformers::models::stable_diffusion::{
    self, clip::ClipTextTransformer, unet_2d::UNet2DConditionModel, vae::AutoEncoderKL,
    StableDiffusionConfig,
};
use hf_hub::api::tokio::Api;
use image::{imageops::FilterType, DynamicImage, ImageBuffer};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokenizers::Tokenizer;
use tracing::{debug, info};

use crate::pipeline::{GenerationRequest, ImageToImage, TextToImage};

/// Slice size used when memory-efficient attention is enabled
const ATTENTION_SLICE_SIZE: usize = 1;

const DEFAULT_STRENGTH: f64 = 0.5;

/// Model families the loader knows how to assemble
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StableDiffusionVersion {
    V1_5,
    V2_1,
    Xl,
    Turbo,
}

impl StableDiffusionVersion {
    /// Detect the model family from a hub model identifier.
    ///
    /// Only the repository name is inspected, split on `-`/`_`, so `xl` must be a
    /// whole token (`sdxl-turbo`, `stable-diffusion-xl-base-1.0`).
    pub fn from_model_name(model_name: &str) -> Option<Self> {
        let name = model_name
            .rsplit('/')
            .next()
            .unwrap_or(model_name)
            .to_lowercase();
        let tokens: Vec<&str> = name.split(['-', '_']).collect();
        let has = |token: &str| tokens.contains(&token);
        let xl = has("xl") || has("sdxl");

        if xl && has("turbo") {
            Some(Self::Turbo)
        } else if xl {
            Some(Self::Xl)
        } else if name.contains("2-1") || name.contains("2.1") {
            Some(Self::V2_1)
        } else if name.contains("1-5") || name.contains("1.5") {
            Some(Self::V1_5)
        } else {
            None
        }
    }

    fn config(self, sliced_attention_size: Option<usize>) -> StableDiffusionConfig {
        match self {
            Self::V1_5 => StableDiffusionConfig::v1_5(sliced_attention_size, None, None),
            Self::V2_1 => StableDiffusionConfig::v2_1(sliced_attention_size, None, None),
            Self::Xl => StableDiffusionConfig::sdxl(sliced_attention_size, None, None),
            Self::Turbo => StableDiffusionConfig::sdxl_turbo(sliced_attention_size, None, None),
        }
    }

    fn is_xl(self) -> bool {
        matches!(self, Self::Xl | Self::Turbo)
    }

    fn vae_scale(self) -> f64 {
        if self.is_xl() {
            0.13025
        } else {
            0.18215
        }
    }

    fn tokenizer_repo(self) -> &'static str {
        if self.is_xl() {
            "openai/clip-vit-large-patch14"
        } else {
            "openai/clip-vit-base-patch32"
        }
    }
}

/// Local paths of every file a pipeline needs
struct WeightFiles {
    tokenizer: PathBuf,
    clip: PathBuf,
    second_encoder: Option<(PathBuf, PathBuf)>,
    unet: PathBuf,
    vae: PathBuf,
}

impl WeightFiles {
    async fn fetch(
        api: &Api,
        model: &str,
        version: StableDiffusionVersion,
        half: bool,
    ) -> Result<Self> {
        let suffix = if half { ".fp16" } else { "" };

        let tokenizer = fetch_file(api, version.tokenizer_repo(), "tokenizer.json").await?;
        let clip = fetch_file(
            api,
            model,
            &format!("text_encoder/model{}.safetensors", suffix),
        )
        .await?;
        let unet = fetch_file(
            api,
            model,
            &format!("unet/diffusion_pytorch_model{}.safetensors", suffix),
        )
        .await?;

        // The stock SDXL VAE overflows in f16.
        let vae = if version.is_xl() && half {
            fetch_file(
                api,
                "madebyollin/sdxl-vae-fp16-fix",
                "diffusion_pytorch_model.safetensors",
            )
            .await?
        } else {
            fetch_file(
                api,
                model,
                &format!("vae/diffusion_pytorch_model{}.safetensors", suffix),
            )
            .await?
        };

        let second_encoder = if version.is_xl() {
            let tokenizer = fetch_file(
                api,
                "laion/CLIP-ViT-bigG-14-laion2B-39B-b160k",
                "tokenizer.json",
            )
            .await?;
            let weights = fetch_file(
                api,
                model,
                &format!("text_encoder_2/model{}.safetensors", suffix),
            )
            .await?;
            Some((tokenizer, weights))
        } else {
            None
        };

        Ok(Self {
            tokenizer,
            clip,
            second_encoder,
            unet,
            vae,
        })
    }
}

async fn fetch_file(api: &Api, repo: &str, file: &str) -> Result<PathBuf> {
    debug!(repo = %repo, file = %file, "Fetching model file");
    api.model(repo.to_string())
        .get(file)
        .await
        .with_context(|| format!("failed to fetch {} from {}", file, repo))
}

struct TextEncoder {
    tokenizer: Tokenizer,
    model: ClipTextTransformer,
    max_len: usize,
    pad_id: u32,
}

impl TextEncoder {
    fn load(
        clip: &stable_diffusion::clip::Config,
        tokenizer: &Path,
        weights: &Path,
        device: &Device,
    ) -> Result<Self> {
        let tokenizer = Tokenizer::from_file(tokenizer)
            .map_err(E::msg)
            .context("failed to load tokenizer")?;
        let pad_token = clip.pad_with.as_deref().unwrap_or("<|endoftext|>");
        let pad_id = *tokenizer
            .get_vocab(true)
            .get(pad_token)
            .ok_or_else(|| anyhow!("tokenizer has no '{}' token", pad_token))?;
        // Text encoders always run in f32, embeddings are cast afterwards.
        let model = stable_diffusion::build_clip_transformer(clip, weights, device, DType::F32)
            .context("failed to load text encoder")?;

        Ok(Self {
            tokenizer,
            model,
            max_len: clip.max_position_embeddings,
            pad_id,
        })
    }

    fn encode(&self, prompt: &str, device: &Device) -> Result<Tensor> {
        let mut tokens = self
            .tokenizer
            .encode(prompt, true)
            .map_err(E::msg)?
            .get_ids()
            .to_vec();
        tokens.truncate(self.max_len);
        tokens.resize(self.max_len, self.pad_id);

        let tokens = Tensor::new(tokens.as_slice(), device)?.unsqueeze(0)?;
        Ok(self.model.forward(&tokens)?)
    }
}

/// Loaded Stable Diffusion weights shared by both generation modes
pub struct StableDiffusion {
    version: StableDiffusionVersion,
    config: StableDiffusionConfig,
    device: Device,
    dtype: DType,
    text_encoder: TextEncoder,
    text_encoder_2: Option<TextEncoder>,
    unet: UNet2DConditionModel,
    vae: AutoEncoderKL,
}

impl StableDiffusion {
    /// Download (or reuse cached) weights for `model` and build the pipeline
    pub async fn load(
        api: &Api,
        model: &str,
        device: Device,
        dtype: DType,
        memory_efficient_attention: bool,
    ) -> Result<Self> {
        let version = StableDiffusionVersion::from_model_name(model)
            .ok_or_else(|| anyhow!("Unsupported model: {}", model))?;
        let config = version.config(memory_efficient_attention.then_some(ATTENTION_SLICE_SIZE));

        info!(model = %model, ?version, ?dtype, "Loading Stable Diffusion weights");
        let files = WeightFiles::fetch(api, model, version, dtype != DType::F32).await?;

        let text_encoder = TextEncoder::load(&config.clip, &files.tokenizer, &files.clip, &device)?;
        let text_encoder_2 = match (&config.clip2, &files.second_encoder) {
            (Some(clip2), Some((tokenizer, weights))) => {
                Some(TextEncoder::load(clip2, tokenizer, weights, &device)?)
            }
            _ => None,
        };
        let unet = config
            .build_unet(&files.unet, &device, 4, false, dtype)
            .context("failed to load unet")?;
        let vae = config
            .build_vae(&files.vae, &device, dtype)
            .context("failed to load vae")?;

        Ok(Self {
            version,
            config,
            device,
            dtype,
            text_encoder,
            text_encoder_2,
            unet,
            vae,
        })
    }

    /// Prompt embeddings for `batch` images; unconditioned rows come first when guided
    fn text_embeddings(
        &self,
        prompt: &str,
        negative_prompt: &str,
        guided: bool,
        batch: usize,
    ) -> Result<Tensor> {
        let encoders = std::iter::once(&self.text_encoder).chain(self.text_encoder_2.as_ref());

        let mut embeddings = Vec::with_capacity(2);
        for encoder in encoders {
            let cond = encoder.encode(prompt, &self.device)?.repeat((batch, 1, 1))?;
            let embedding = if guided {
                let uncond = encoder
                    .encode(negative_prompt, &self.device)?
                    .repeat((batch, 1, 1))?;
                Tensor::cat(&[uncond, cond], 0)?
            } else {
                cond
            };
            embeddings.push(embedding.to_dtype(self.dtype)?);
        }

        Ok(Tensor::cat(&embeddings, D::Minus1)?)
    }

    /// Encode a source image into scaled VAE latents
    fn encode_image(&self, image: &DynamicImage) -> Result<Tensor> {
        let (width, height) = (self.config.width, self.config.height);
        let pixels = image
            .resize_to_fill(width as u32, height as u32, FilterType::CatmullRom)
            .to_rgb8()
            .into_raw();
        let tensor = Tensor::from_vec(pixels, (height, width, 3), &Device::Cpu)?
            .permute((2, 0, 1))?
            .to_dtype(DType::F32)?
            .affine(2. / 255., -1.)?
            .unsqueeze(0)?;

        let dist = self
            .vae
            .encode(&tensor.to_device(&self.device)?.to_dtype(self.dtype)?)?;
        Ok((dist.sample()? * self.version.vae_scale())?)
    }

    fn decode(&self, latents: &Tensor, batch: usize) -> Result<Vec<DynamicImage>> {
        let images = self.vae.decode(&(latents / self.version.vae_scale())?)?;
        let images = ((images / 2.)? + 0.5)?
            .to_device(&Device::Cpu)?
            .to_dtype(DType::F32)?;
        let images = (images.clamp(0f32, 1.)? * 255.)?.to_dtype(DType::U8)?;

        let mut decoded = Vec::with_capacity(batch);
        for index in 0..batch {
            decoded.push(tensor_to_image(&images.i(index)?)?);
        }
        Ok(decoded)
    }

    /// Run the denoising loop, starting from noise or from `source`
    fn sample(
        &self,
        request: &GenerationRequest,
        source: Option<&DynamicImage>,
    ) -> Result<Vec<DynamicImage>> {
        let batch = request.num_images;
        if batch == 0 {
            bail!("num_images_per_prompt must be at least 1");
        }

        let steps = request.num_inference_steps;
        let guided = request.guidance_scale > 1.0;
        let text_embeddings =
            self.text_embeddings(&request.prompt, request.negative_prompt(), guided, batch)?;

        let mut scheduler = self.config.build_scheduler(steps)?;
        let timesteps = scheduler.timesteps().to_vec();

        let (latents, t_start) = match source {
            Some(image) => {
                let t_start = start_step(steps, request.strength.unwrap_or(DEFAULT_STRENGTH));
                let init = self.encode_image(image)?.repeat((batch, 1, 1, 1))?;
                let latents = match timesteps.get(t_start) {
                    Some(&timestep) => {
                        let noise = init.randn_like(0f64, 1f64)?;
                        scheduler.add_noise(&init, noise, timestep)?
                    }
                    None => init,
                };
                (latents, t_start)
            }
            None => {
                let latents = Tensor::randn(
                    0f32,
                    1f32,
                    (batch, 4, self.config.height / 8, self.config.width / 8),
                    &self.device,
                )?;
                ((latents * scheduler.init_noise_sigma())?, 0)
            }
        };
        let mut latents = latents.to_dtype(self.dtype)?;

        for &timestep in timesteps.iter().skip(t_start) {
            let model_input = if guided {
                Tensor::cat(&[&latents, &latents], 0)?
            } else {
                latents.clone()
            };
            let model_input = scheduler.scale_model_input(model_input, timestep)?;
            let noise_pred = self
                .unet
                .forward(&model_input, timestep as f64, &text_embeddings)?;

            let noise_pred = if guided {
                let chunks = noise_pred.chunk(2, 0)?;
                let (uncond, cond) = (&chunks[0], &chunks[1]);
                (uncond + ((cond - uncond)? * request.guidance_scale)?)?
            } else {
                noise_pred
            };

            latents = scheduler.step(&noise_pred, timestep, &latents)?;
            debug!(timestep, "Denoising step done");
        }

        self.decode(&latents, batch)
    }
}

/// First scheduler step an image-to-image run executes.
///
/// Strength 1 runs every step, strength 0 keeps the source latents untouched.
pub fn start_step(steps: usize, strength: f64) -> usize {
    steps.saturating_sub((steps as f64 * strength) as usize)
}

/// Converts a u8 tensor with shape (3, height, width) into an RGB image.
fn tensor_to_image(img: &Tensor) -> Result<DynamicImage> {
    let (channels, height, width) = img.dims3()?;
    if channels != 3 {
        bail!("tensor_to_image expects an image with 3 channels");
    }
    let img = img.permute((1, 2, 0))?.flatten_all()?;
    let pixels = img.to_vec1::<u8>()?;
    let buffer = ImageBuffer::from_raw(width as u32, height as u32, pixels)
        .ok_or_else(|| anyhow!("error converting tensor to image buffer"))?;
    Ok(DynamicImage::ImageRgb8(buffer))
}

/// Text-to-image over shared Stable Diffusion weights
pub struct StableDiffusionTextToImage {
    model: Arc<StableDiffusion>,
}

impl StableDiffusionTextToImage {
    pub fn new(model: Arc<StableDiffusion>) -> Self {
        Self { model }
    }
}

impl TextToImage for StableDiffusionTextToImage {
    fn generate(&self, request: &GenerationRequest) -> Result<Vec<DynamicImage>> {
        self.model.sample(request, None)
    }
}

/// Image-to-image over shared Stable Diffusion weights
pub struct StableDiffusionImageToImage {
    model: Arc<StableDiffusion>,
}

impl StableDiffusionImageToImage {
    pub fn new(model: Arc<StableDiffusion>) -> Self {
        Self { model }
    }
}

impl ImageToImage for StableDiffusionImageToImage {
    fn transform(
        &self,
        request: &GenerationRequest,
        source: &DynamicImage,
    ) -> Result<Vec<DynamicImage>> {
        self.model.sample(request, Some(source))
    }
}
