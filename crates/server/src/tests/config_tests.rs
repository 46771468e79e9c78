use super::{load_settings_from, normalize_database_url, prepare_database_url, Settings};

use std::{fs, io::Write};

#[test]
fn normalizes_plain_file_path_to_sqlite_url() {
    assert_eq!(
        normalize_database_url("./data/test.db"),
        "sqlite://./data/test.db"
    );
}

#[test]
fn keeps_memory_urls_untouched() {
    assert_eq!(normalize_database_url("sqlite::memory:"), "sqlite::memory:");
}

#[test]
fn empty_url_falls_back_to_default() {
    assert_eq!(
        normalize_database_url("   "),
        Settings::default().database_url
    );
}

#[test]
fn keeps_windows_absolute_path_with_single_sqlite_colon() {
    assert_eq!(
        normalize_database_url("sqlite:C:\\Users\\alice\\test.db"),
        "sqlite:C:/Users/alice/test.db"
    );
}

#[test]
fn normalizes_windows_plain_path_with_single_sqlite_colon() {
    assert_eq!(
        normalize_database_url("C:\\Users\\alice\\test.db"),
        "sqlite:C:/Users/alice/test.db"
    );
}

#[test]
fn converts_sqlite_double_slash_windows_path() {
    assert_eq!(
        normalize_database_url("sqlite://C:/Users/alice/test.db"),
        "sqlite:C:/Users/alice/test.db"
    );
}

#[test]
fn creates_parent_dir_for_relative_sqlite_url() {
    let temp_root = tempfile::tempdir().expect("temp dir");
    let db_path = temp_root.path().join("data").join("test.db");

    prepare_database_url(db_path.to_string_lossy().as_ref()).expect("prepare db url");
    assert!(temp_root.path().join("data").exists());
}

#[test]
fn missing_file_yields_defaults() {
    let temp_root = tempfile::tempdir().expect("temp dir");
    let settings =
        load_settings_from(&temp_root.path().join("absent.toml")).expect("settings");
    let defaults = Settings::default();
    assert_eq!(settings.room_capacity, defaults.room_capacity);
    assert_eq!(settings.outbound_buffer, defaults.outbound_buffer);
}

#[test]
fn file_values_override_defaults() {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("temp file");
    writeln!(file, "bind_addr = \"0.0.0.0:9000\"").expect("write");
    writeln!(file, "room_capacity = 32").expect("write");
    writeln!(file, "log_filter = \"debug,sqlx=warn\"").expect("write");

    let settings = load_settings_from(file.path()).expect("settings");
    assert_eq!(settings.bind_addr, "0.0.0.0:9000");
    assert_eq!(settings.room_capacity, 32);
    assert_eq!(settings.log_filter, "debug,sqlx=warn");
    assert_eq!(settings.gateway().room_capacity, 32);
}

#[test]
fn zero_capacity_is_rejected() {
    let temp_root = tempfile::tempdir().expect("temp dir");
    let path = temp_root.path().join("server.toml");
    fs::write(&path, "outbound_buffer = 0\n").expect("write");

    let err = load_settings_from(&path).expect_err("should fail");
    assert!(err.to_string().contains("outbound_buffer"));
}

#[tokio::test]
async fn prepared_database_url_creates_openable_sqlite_file() {
    let temp_root = tempfile::tempdir().expect("temp dir");
    let db_path = temp_root.path().join("nested").join("server.db");

    let prepared = prepare_database_url(db_path.to_string_lossy().as_ref()).expect("prepare");
    let storage = storage::Storage::new(&prepared).await.expect("open sqlite");
    drop(storage);

    assert!(
        db_path.exists(),
        "database file should be created: {}",
        db_path.display()
    );
}
