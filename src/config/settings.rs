//! Application settings and configuration management

use crate::error::{AppError, Result};
use config::{builder::DefaultState, Config, ConfigBuilder, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub gate: GateConfig,
    #[serde(default)]
    pub generation: GenerationDefaults,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Request body limit, mostly relevant for multipart uploads
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_max_upload_bytes() -> usize {
    20 * 1024 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

/// Compute device requested for inference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    /// CUDA, then Metal, then CPU
    #[default]
    Auto,
    Cpu,
    Cuda,
    Metal,
}

/// Numeric precision the pipeline weights are loaded with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    #[default]
    F16,
    Bf16,
    F32,
}

/// Pipeline configuration, fixed for the lifetime of the process
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineConfig {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_true")]
    pub enable_txt2img: bool,
    #[serde(default = "default_true")]
    pub enable_img2img: bool,
    #[serde(default)]
    pub device: DeviceKind,
    #[serde(default)]
    pub device_ordinal: usize,
    #[serde(default)]
    pub precision: Precision,
    /// Trade speed for memory by slicing attention in the UNet
    #[serde(default)]
    pub memory_efficient_attention: bool,
}

fn default_model() -> String {
    "stabilityai/sdxl-turbo".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            enable_txt2img: true,
            enable_img2img: true,
            device: DeviceKind::default(),
            device_ordinal: 0,
            precision: Precision::default(),
            memory_efficient_attention: false,
        }
    }
}

/// Resource gate configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct GateConfig {
    /// Maximum time a request waits for the accelerator. Unset waits forever.
    #[serde(default)]
    pub acquire_timeout_ms: Option<u64>,
}

impl GateConfig {
    pub fn acquire_timeout(&self) -> Option<Duration> {
        self.acquire_timeout_ms.map(Duration::from_millis)
    }
}

/// Parameters used by `/v1/images/generations`, which does not accept them per request
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GenerationDefaults {
    #[serde(default = "default_steps")]
    pub num_inference_steps: usize,
    #[serde(default = "default_guidance_scale")]
    pub guidance_scale: f64,
}

fn default_steps() -> usize {
    30
}

fn default_guidance_scale() -> f64 {
    7.5
}

impl Default for GenerationDefaults {
    fn default() -> Self {
        Self {
            num_inference_steps: default_steps(),
            guidance_scale: default_guidance_scale(),
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default = "default_upload_dir")]
    pub upload_dir: String,
    #[serde(default = "default_output_dir")]
    pub output_dir: String,
    /// Path prefix generated images are served under
    #[serde(default = "default_output_url_prefix")]
    pub output_url_prefix: String,
}

fn default_upload_dir() -> String {
    "uploaded_images".to_string()
}

fn default_output_dir() -> String {
    "output_images".to_string()
}

fn default_output_url_prefix() -> String {
    "/output_images".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            upload_dir: default_upload_dir(),
            output_dir: default_output_dir(),
            output_url_prefix: default_output_url_prefix(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Parse a boolean flag the way the legacy environment variables are written
pub fn parse_flag(value: &str) -> bool {
    matches!(value.trim().to_lowercase().as_str(), "1" | "true" | "yes")
}

impl Settings {
    /// Load settings from configuration files and environment variables
    pub fn load() -> Result<Self> {
        Self::load_from_path("config/default.toml")
    }

    /// Load settings from a specific configuration file path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::load_with_env(path, |name| std::env::var(name).ok())
    }

    /// Load settings, resolving legacy flat variables through `lookup`
    pub fn load_with_env<P, F>(path: P, lookup: F) -> Result<Self>
    where
        P: AsRef<Path>,
        F: Fn(&str) -> Option<String>,
    {
        let builder = Config::builder()
            .set_default("server.host", default_host())?
            .set_default("server.port", i64::from(default_port()))?
            .set_default("logging.level", legacy_log_level(&lookup))?
            // Load from configuration file
            .add_source(
                File::with_name(path.as_ref().to_str().unwrap_or("config/default"))
                    .required(false),
            )
            // Override with environment variables (DIFFUSION__PIPELINE__MODEL, ...)
            .add_source(
                Environment::with_prefix("DIFFUSION")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = apply_legacy_env(builder, lookup)?.build()?;
        let settings: Settings = config.try_deserialize()?;
        Ok(settings)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(AppError::Config(config::ConfigError::Message(
                "Server port cannot be 0".to_string(),
            )));
        }

        let prefix = &self.storage.output_url_prefix;
        if !prefix.starts_with('/') || prefix == "/" || prefix.ends_with('/') {
            return Err(AppError::Config(config::ConfigError::Message(format!(
                "Output URL prefix '{}' must start with '/' and name a sub-path",
                prefix
            ))));
        }

        if self.pipeline.model.is_empty() {
            return Err(AppError::Config(config::ConfigError::Message(
                "Pipeline model cannot be empty".to_string(),
            )));
        }

        Ok(())
    }
}

/// `ENV=production` quiets the default level; an explicit `logging.level` still wins
fn legacy_log_level<F>(lookup: &F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    match lookup("ENV").as_deref() {
        Some("production") => "warn".to_string(),
        _ => default_log_level(),
    }
}

/// Flat variable names kept for deployments configured before the nested layout
fn apply_legacy_env<F>(
    builder: ConfigBuilder<DefaultState>,
    lookup: F,
) -> Result<ConfigBuilder<DefaultState>>
where
    F: Fn(&str) -> Option<String>,
{
    let flag = |name: &str| lookup(name).map(|v| parse_flag(&v));

    Ok(builder
        .set_override_option("pipeline.model", lookup("MODEL_NAME"))?
        .set_override_option("pipeline.enable_txt2img", flag("ENABLE_TXT2IMG"))?
        .set_override_option("pipeline.enable_img2img", flag("ENABLE_IMG2IMG"))?
        .set_override_option(
            "pipeline.memory_efficient_attention",
            flag("XFORMERS_ENABLED"),
        )?)
}
