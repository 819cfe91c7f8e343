use super::*;
use serde::Deserialize;
use std::fs;
use tempfile::TempDir;

#[derive(Debug, Deserialize, PartialEq)]
struct Sample {
    hotload: Section,
}

#[derive(Debug, Deserialize, PartialEq)]
struct Section {
    cleanup_delay_ms: u64,
    staging_dir: Option<String>,
}

#[test]
fn test_detect_format() {
    assert_eq!(detect_format("host.yaml").unwrap(), FileFormat::Yaml);
    assert_eq!(detect_format("host.yml").unwrap(), FileFormat::Yaml);
    assert_eq!(detect_format("host.toml").unwrap(), FileFormat::Toml);
    assert_eq!(detect_format("host.json").unwrap(), FileFormat::Json);
    assert!(detect_format("host.txt").is_err());
    assert!(detect_format("host").is_err());
}

#[test]
fn test_load_toml_and_yaml_agree() {
    let dir = TempDir::new().unwrap();

    let toml_path = dir.path().join("host.toml");
    fs::write(
        &toml_path,
        "[hotload]\ncleanup_delay_ms = 1500\nstaging_dir = \"/tmp/stage\"\n",
    )
    .unwrap();

    let yaml_path = dir.path().join("host.yaml");
    fs::write(
        &yaml_path,
        "hotload:\n  cleanup_delay_ms: 1500\n  staging_dir: /tmp/stage\n",
    )
    .unwrap();

    let from_toml: Sample = load_config(&toml_path).unwrap();
    let from_yaml: Sample = load_config(&yaml_path).unwrap();

    assert_eq!(from_toml, from_yaml);
    assert_eq!(from_toml.hotload.cleanup_delay_ms, 1500);
}

#[test]
fn test_env_substitution() {
    // SAFETY: test-local variable name, not read by other tests
    unsafe { std::env::set_var("HOTLOAD_TEST_STAGE_DIR", "/var/stage") };

    let out = substitute_env_vars("a: ${HOTLOAD_TEST_STAGE_DIR}, b: $HOTLOAD_TEST_STAGE_DIR");
    assert_eq!(out, "a: /var/stage, b: /var/stage");

    let untouched = substitute_env_vars("c: ${HOTLOAD_TEST_DEFINITELY_UNSET}");
    assert_eq!(untouched, "c: ${HOTLOAD_TEST_DEFINITELY_UNSET}");
}

#[test]
fn test_from_str_json() {
    let json = r#"{ "hotload": { "cleanup_delay_ms": 10 } }"#;
    let config: Sample = from_str(json, FileFormat::Json).unwrap();
    assert_eq!(config.hotload.cleanup_delay_ms, 10);
    assert_eq!(config.hotload.staging_dir, None);
}
