use tempfile::tempdir;
use zre_telemetry::{init_logging, LogConfig};

#[test]
fn second_initialization_is_a_no_op() {
    let dir = tempdir().expect("tempdir");
    let config = LogConfig {
        dir: dir.path().join("logs"),
        ..Default::default()
    };

    let first = init_logging(&config).expect("first init");
    assert!(!first.already_initialized());
    assert!(config.dir.is_dir());

    let second = init_logging(&config).expect("second init");
    assert!(second.already_initialized());

    tracing::info!("written after both initializations");
    drop(second);
    drop(first);

    let files: Vec<_> = std::fs::read_dir(&config.dir)
        .expect("read log dir")
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .collect();
    assert_eq!(files.len(), 1, "only one rolling file should exist: {files:?}");
    assert!(files[0].starts_with("etl_pipeline"));
}
