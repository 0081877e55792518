use taskcore::{Error, RuntimeConfig, TaskManagerConfig, TaskRuntime};
use tempfile::NamedTempFile;

#[test]
fn test_config_serialization_roundtrip() {
    let original_config = RuntimeConfig::default();

    let toml_str = original_config
        .to_toml_string()
        .expect("Should be able to serialize config to TOML");
    assert!(!toml_str.is_empty(), "TOML string should not be empty");
    assert!(toml_str.contains("dispatcher_name"), "Should contain dispatcher_name field");

    let deserialized_config =
        RuntimeConfig::from_toml_str(&toml_str).expect("Should be able to deserialize TOML string");
    assert_eq!(original_config, deserialized_config);
}

#[test]
fn test_config_file_operations() {
    let mut original_config = RuntimeConfig::default();
    original_config.manager = TaskManagerConfig {
        max_jobs: Some(6),
        max_watched: 20,
    };
    original_config.task.progress_interval_ms = 50;

    let temp_file = NamedTempFile::new().expect("Should be able to create temporary file");
    original_config
        .to_toml_file(temp_file.path())
        .expect("Should be able to save config to file");

    let loaded_config =
        RuntimeConfig::from_toml_file(temp_file.path()).expect("Should be able to load config from file");
    assert_eq!(original_config, loaded_config);
}

#[test]
fn test_config_toml_structure() {
    let toml_str = RuntimeConfig::default()
        .to_toml_string()
        .expect("Should be able to serialize config");

    assert!(toml_str.contains("[task]"), "Should contain task section");
    assert!(toml_str.contains("[manager]"), "Should contain manager section");
    assert!(toml_str.contains("progress_interval_ms"), "Should contain progress_interval_ms");
    assert!(toml_str.contains("max_watched"), "Should contain max_watched");
}

#[test]
fn test_unlimited_manager_omits_max_jobs() {
    let mut config = RuntimeConfig::default();
    config.manager.max_jobs = None;

    let toml_str = config.to_toml_string().unwrap();
    assert!(!toml_str.contains("max_jobs"));

    let loaded = RuntimeConfig::from_toml_str(&toml_str).unwrap();
    assert_eq!(loaded.manager.max_jobs, None);
}

#[test]
fn test_config_error_handling() {
    let missing = RuntimeConfig::from_toml_file("/nonexistent/taskcore.toml");
    assert!(matches!(missing, Err(Error::Io(_))));

    let malformed = RuntimeConfig::from_toml_str("[manager]\nmax_watched = \"many\"\n");
    assert!(matches!(malformed, Err(Error::TomlDe(_))));

    let empty_name = RuntimeConfig::from_toml_str("dispatcher_name = \"\"\n");
    assert!(matches!(empty_name, Err(Error::Config(_))));

    let mut config = RuntimeConfig::default();
    config.task.priority = 0;
    assert!(matches!(TaskRuntime::new(config), Err(Error::InvalidPriority(0))));
}
