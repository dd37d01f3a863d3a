use super::*;

fn write_file(path: &Path, contents: &str) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("create parent directory");
    }
    std::fs::write(path, contents.as_bytes()).expect("write file");
}

#[test]
fn default_config_is_valid_and_round_trips_stub() {
    let config = Config::default();
    validate_config(&config).expect("defaults validate");

    let stub = config_stub().expect("stub");
    let parsed: Config = serde_json::from_str(&stub).expect("parse stub");
    assert_eq!(parsed, config);
}

#[test]
fn partial_config_fills_defaults() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("config.json");
    write_file(
        &path,
        r#"{ "branch": "x86-64", "manifest_urls": ["https://example.invalid/manifest.json"] }"#,
    );

    let config = load_config(&path).expect("load");
    assert_eq!(config.branch, "x86-64");
    assert_eq!(config.retries, DEFAULT_RETRIES);
    assert_eq!(config.download_jobs, DEFAULT_DOWNLOAD_JOBS);
    assert_eq!(config.timeout(), Duration::from_secs(DEFAULT_TIMEOUT_SECS));
}

#[test]
fn unknown_keys_are_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("config.json");
    write_file(&path, r#"{ "brnach": "x86-64" }"#);

    let err = load_config(&path).expect_err("typo key");
    assert!(format!("{err:#}").contains("brnach"));
}

#[test]
fn validation_rejects_unusable_values() {
    let config = Config {
        retries: 0,
        ..Config::default()
    };
    assert!(validate_config(&config).is_err());

    let config = Config {
        manifest_urls: vec!["manifest.json".to_string()],
        ..Config::default()
    };
    assert!(validate_config(&config).is_err());

    let config = Config {
        schema_version: CONFIG_SCHEMA_VERSION + 1,
        ..Config::default()
    };
    assert!(validate_config(&config).is_err());
}

#[test]
fn explicit_values_override_platform_defaults() {
    let config = Config {
        platform: Some("windows".to_string()),
        cache_dir: Some(PathBuf::from("/tmp/patch-cache")),
        jobs: 3,
        ..Config::default()
    };
    assert_eq!(config.platform(), "windows");
    assert_eq!(config.cache_dir(), PathBuf::from("/tmp/patch-cache"));
    assert_eq!(config.hash_threads(), 3);
    assert!(Config::default().hash_threads() >= 1);
}
