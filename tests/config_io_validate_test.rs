use std::fs;
use talos::battery::Chemistry;
use talos::config::Config;

#[test]
fn save_and_load_yaml_roundtrip() {
    let tmp_dir = tempfile::tempdir().unwrap();
    let path = tmp_dir.path().join("config.yaml");

    let mut cfg = Config::default();
    cfg.battery.chemistry = Chemistry::Ncm;
    cfg.battery.cell_count = 15;
    cfg.battery.capacity_ah = Some(280.0);
    cfg.logging.file = path.with_extension("log").to_string_lossy().to_string();

    cfg.save_to_file(&path).unwrap();
    let loaded = Config::from_file(&path).unwrap();

    assert_eq!(loaded.battery.chemistry, Chemistry::Ncm);
    assert_eq!(loaded.battery.cell_count, 15);
    assert_eq!(loaded.battery.capacity_ah, Some(280.0));
    assert_eq!(loaded.logging.file, cfg.logging.file);
}

#[test]
fn config_validation_errors() {
    let mut cfg = Config::default();

    // Cell count outside the chemistry's supported range
    cfg.battery.cell_count = 2;
    assert!(cfg.validate().is_err());

    // Schedule hour out of range
    cfg = Config::default();
    cfg.schedule.end_hour = 24;
    assert!(cfg.validate().is_err());

    // Nonpositive capacity is rejected when present
    cfg = Config::default();
    cfg.battery.capacity_ah = Some(0.0);
    assert!(cfg.validate().is_err());

    // A missing capacity is a runtime concern, not a validation error
    cfg = Config::default();
    cfg.battery.capacity_ah = None;
    assert!(cfg.validate().is_ok());

    // Invalid web port
    cfg = Config::default();
    cfg.web.port = 0;
    assert!(cfg.validate().is_err());

    // Poll interval zero
    cfg = Config::default();
    cfg.poll_interval_ms = 0;
    assert!(cfg.validate().is_err());
}

#[test]
fn from_file_with_invalid_yaml_fails() {
    let tmp = tempfile::NamedTempFile::new().unwrap();
    fs::write(tmp.path(), b"bad: [unclosed").unwrap();
    let err = Config::from_file(tmp.path()).unwrap_err();
    let msg = format!("{}", err);
    assert!(msg.contains("Serialization error"));
}
