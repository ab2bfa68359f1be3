//! Configuration system for the Ember engine

use crate::error::{EmberError, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// Top-level engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EngineConfig {
    /// Logging configuration
    pub logging: LoggingConfig,
    /// Frame and swap-chain settings
    pub renderer: RendererConfig,
    /// Device budgets and heap sizes
    pub device: DeviceConfig,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Level used for the tracing subscriber filter
    pub default_level: String,
    /// Category-specific log levels (category name -> level string)
    pub category_levels: HashMap<String, String>,
    /// Rate limiting duration in seconds
    pub rate_limit_seconds: u64,
    /// Maximum number of messages before rate limiting kicks in
    pub max_rate_limit_count: u32,
}

/// Frame pacing and presentation settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RendererConfig {
    pub width: u32,
    pub height: u32,
    /// Number of presentable images in the swap chain ring
    pub swap_chain_buffer_count: u32,
    /// How many frames the CPU may record ahead of the GPU
    pub frames_in_flight: u32,
    /// Upper bound of draw items per frame; sizes the per-instance constant ring
    pub max_draws_per_frame: u32,
    pub clear_color: [f32; 4],
    /// Format name of the swap-chain images (see `wgpu::TextureFormat`)
    pub back_buffer_format: String,
}

/// Fixed capacities of the descriptor heaps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DescriptorHeapSizes {
    pub cbv_srv_uav: u32,
    pub sampler: u32,
    pub rtv: u32,
    pub dsv: u32,
}

/// Device level budgets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Bytes of GPU memory the device may hand out before allocation fails
    pub memory_budget_bytes: u64,
    pub descriptor_heaps: DescriptorHeapSizes,
    /// Artificial delay applied by the GPU timeline to each submission
    pub simulated_gpu_latency_us: u64,
    /// Validate resource states and bindings while recording
    pub validation: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        let mut category_levels = HashMap::new();

        category_levels.insert("core".to_string(), "info".to_string());
        category_levels.insert("resource".to_string(), "info".to_string());
        category_levels.insert("descriptor".to_string(), "info".to_string());
        category_levels.insert("command".to_string(), "warn".to_string()); // Barrier traffic is noisy
        category_levels.insert("queue".to_string(), "info".to_string());
        category_levels.insert("pass".to_string(), "info".to_string());
        category_levels.insert("frame".to_string(), "warn".to_string());
        category_levels.insert("overlay".to_string(), "info".to_string());

        Self {
            default_level: "info".to_string(),
            category_levels,
            rate_limit_seconds: 5,
            max_rate_limit_count: 10,
        }
    }
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            swap_chain_buffer_count: 2,
            frames_in_flight: 2,
            max_draws_per_frame: 1024,
            clear_color: [0.0, 0.0, 0.0, 1.0],
            back_buffer_format: "Rgba8UnormSrgb".to_string(),
        }
    }
}

impl Default for DescriptorHeapSizes {
    fn default() -> Self {
        Self {
            cbv_srv_uav: 4096,
            sampler: 64,
            rtv: 64,
            dsv: 16,
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            memory_budget_bytes: 2 * 1024 * 1024 * 1024, // 2GB
            descriptor_heaps: DescriptorHeapSizes::default(),
            simulated_gpu_latency_us: 0,
            validation: cfg!(debug_assertions),
        }
    }
}

impl EngineConfig {
    /// Parse a configuration from RON text
    pub fn from_ron_str(text: &str) -> Result<Self> {
        let config: Self = ron::from_str(text)
            .map_err(|e| EmberError::configuration(format!("Invalid RON config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a configuration from JSON text
    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)
            .map_err(|e| EmberError::configuration(format!("Invalid JSON config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file, picking the format from its extension
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("ron") => Self::from_ron_str(&text),
            Some("json") => Self::from_json_str(&text),
            other => Err(EmberError::configuration(format!(
                "Unsupported config extension {:?} for {}",
                other,
                path.display()
            ))),
        }
    }

    /// Serialize to pretty RON
    pub fn to_ron_string(&self) -> Result<String> {
        ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())
            .map_err(|e| EmberError::configuration(format!("Failed to serialize config: {}", e)))
    }

    /// Reject values the renderer cannot work with
    pub fn validate(&self) -> Result<()> {
        let r = &self.renderer;
        if r.width == 0 || r.height == 0 {
            return Err(EmberError::configuration(format!(
                "Invalid viewport dimensions: {}x{}",
                r.width, r.height
            )));
        }
        if r.swap_chain_buffer_count < 2 {
            return Err(EmberError::configuration(
                "swap_chain_buffer_count must be at least 2",
            ));
        }
        if r.frames_in_flight == 0 {
            return Err(EmberError::configuration("frames_in_flight must be at least 1"));
        }
        if r.max_draws_per_frame == 0 {
            return Err(EmberError::configuration("max_draws_per_frame must be at least 1"));
        }

        let heaps = &self.device.descriptor_heaps;
        if heaps.cbv_srv_uav == 0 || heaps.sampler == 0 || heaps.rtv == 0 || heaps.dsv == 0 {
            return Err(EmberError::configuration(format!(
                "Descriptor heaps must have non-zero capacity: {:?}",
                heaps
            )));
        }
        if self.device.memory_budget_bytes == 0 {
            return Err(EmberError::configuration("memory_budget_bytes must be non-zero"));
        }
        Ok(())
    }
}

/// Shared, mutable holder for an [`EngineConfig`]
#[derive(Debug, Clone, Default)]
pub struct ConfigManager {
    config: Arc<RwLock<EngineConfig>>,
}

impl ConfigManager {
    /// Create a configuration manager with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a configuration manager with custom config
    pub fn with_config(config: EngineConfig) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
        }
    }

    /// Get a copy of the current configuration
    pub fn get_config(&self) -> EngineConfig {
        self.config.read().clone()
    }

    /// Update the configuration in place
    pub fn update_config<F>(&self, updater: F)
    where
        F: FnOnce(&mut EngineConfig),
    {
        let mut config = self.config.write();
        updater(&mut config);
    }

    /// Set log level for a specific category
    pub fn set_category_level(&self, category: &str, level: &str) {
        self.update_config(|config| {
            config
                .logging
                .category_levels
                .insert(category.to_string(), level.to_string());
        });
    }

    /// Get log level for a specific category
    pub fn get_category_level(&self, category: &str) -> Option<String> {
        self.config
            .read()
            .logging
            .category_levels
            .get(category)
            .cloned()
    }
}
