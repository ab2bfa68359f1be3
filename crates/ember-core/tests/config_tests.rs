//! Configuration loading tests

use ember_core::{EmberError, EngineConfig};
use pretty_assertions::assert_eq;

#[test]
fn test_ron_round_trip_preserves_values() {
    let mut config = EngineConfig::default();
    config.renderer.width = 1920;
    config.renderer.height = 1080;
    config.renderer.frames_in_flight = 3;
    config.device.descriptor_heaps.cbv_srv_uav = 512;

    let text = config.to_ron_string().unwrap();
    let parsed = EngineConfig::from_ron_str(&text).unwrap();

    assert_eq!(parsed, config);
}

#[test]
fn test_partial_json_uses_defaults() {
    let json = r#"{ "renderer": { "width": 800, "height": 600 } }"#;
    let config = EngineConfig::from_json_str(json).unwrap();

    assert_eq!(config.renderer.width, 800);
    assert_eq!(config.renderer.height, 600);
    assert_eq!(config.renderer.swap_chain_buffer_count, 2);
    assert_eq!(config.device, EngineConfig::default().device);
}

#[test]
fn test_invalid_values_are_rejected() {
    let json = r#"{ "renderer": { "swap_chain_buffer_count": 1 } }"#;
    let err = EngineConfig::from_json_str(json).unwrap_err();
    assert!(matches!(err, EmberError::Configuration { .. }));

    let json = r#"{ "device": { "descriptor_heaps": { "rtv": 0 } } }"#;
    assert!(EngineConfig::from_json_str(json).is_err());
}

#[test]
fn test_load_picks_format_from_extension() {
    let dir = std::env::temp_dir().join(format!("ember-config-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();

    let ron_path = dir.join("engine.ron");
    std::fs::write(&ron_path, "(renderer: (width: 640, height: 480))").unwrap();
    let config = EngineConfig::load(&ron_path).unwrap();
    assert_eq!(config.renderer.width, 640);

    let toml_path = dir.join("engine.toml");
    std::fs::write(&toml_path, "width = 640").unwrap();
    assert!(matches!(
        EngineConfig::load(&toml_path),
        Err(EmberError::Configuration { .. })
    ));

    let missing = dir.join("missing.ron");
    assert!(matches!(EngineConfig::load(&missing), Err(EmberError::Io(_))));

    std::fs::remove_dir_all(&dir).ok();
}
