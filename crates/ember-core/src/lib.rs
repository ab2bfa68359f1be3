//! Core functionality for the Ember engine
//!
//! Shared by every Ember crate: the error taxonomy, logging and the
//! engine configuration.

pub mod config;
pub mod error;
pub mod logging;

pub use config::{
    ConfigManager, DescriptorHeapSizes, DeviceConfig, EngineConfig, LoggingConfig,
    RendererConfig,
};
pub use error::{EmberError, ErrorContext, Result};
pub use logging::{LogCategory, LogLevel};

/// Framework version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize logging from the engine configuration
pub fn init(config: &EngineConfig) -> Result<()> {
    config.validate()?;
    logging::init(&config.logging);
    tracing::info!("Ember Core v{} initialized", VERSION);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_init_rejects_invalid_config() {
        let mut config = EngineConfig::default();
        config.renderer.frames_in_flight = 0;
        assert!(init(&config).is_err());
    }
}
