use super::{load_settings_from, normalize_database_url, prepare_database_url, Settings};

use std::{collections::HashMap, fs};

fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let vars: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |key| vars.get(key).cloned()
}

#[test]
fn normalizes_plain_file_path_to_sqlite_url() {
    assert_eq!(
        normalize_database_url("./data/boards.db"),
        "sqlite://./data/boards.db"
    );
}

#[test]
fn empty_url_falls_back_to_default() {
    assert_eq!(normalize_database_url("  "), Settings::default().database_url);
}

#[test]
fn keeps_memory_and_foreign_urls() {
    assert_eq!(normalize_database_url("sqlite::memory:"), "sqlite::memory:");
    assert_eq!(
        normalize_database_url("postgres://db/boards"),
        "postgres://db/boards"
    );
}

#[test]
fn windows_paths_use_single_colon_form() {
    assert_eq!(
        normalize_database_url("C:\\Users\\sam\\boards.db"),
        "sqlite:C:/Users/sam/boards.db"
    );
    assert_eq!(
        normalize_database_url("sqlite://C:/Users/sam/boards.db"),
        "sqlite:C:/Users/sam/boards.db"
    );
}

#[test]
fn missing_file_and_env_give_defaults() {
    let dir = tempfile::tempdir().expect("tempdir");
    let settings = load_settings_from(&dir.path().join("server.toml"), env_from(&[]));
    assert_eq!(settings, Settings::default());
}

#[test]
fn file_then_env_override_defaults() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("server.toml");
    fs::write(
        &path,
        "bind_addr = \"0.0.0.0:9000\"\ndatabase_url = \"sqlite://file.db\"\npersistence_timeout_ms = 250\n",
    )
    .expect("write settings");

    let settings = load_settings_from(
        &path,
        env_from(&[
            ("SERVER_BIND", "127.0.0.1:1"),
            ("APP__BIND_ADDR", "127.0.0.1:2"),
            ("APP__MAX_BODY_BYTES", "1024"),
        ]),
    );

    assert_eq!(settings.bind_addr, "127.0.0.1:2");
    assert_eq!(settings.database_url, "sqlite://file.db");
    assert_eq!(settings.persistence_timeout_ms, 250);
    assert_eq!(settings.max_body_bytes, 1024);
}

#[test]
fn invalid_numbers_are_ignored() {
    let dir = tempfile::tempdir().expect("tempdir");
    let settings = load_settings_from(
        &dir.path().join("server.toml"),
        env_from(&[
            ("APP__PERSISTENCE_TIMEOUT_MS", "soon"),
            ("APP__MAX_BODY_BYTES", "0"),
        ]),
    );
    assert_eq!(settings.persistence_timeout_ms, 5_000);
    assert_eq!(settings.max_body_bytes, 64 * 1024);
}

#[tokio::test]
async fn prepared_database_url_creates_openable_sqlite_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db_path = dir.path().join("nested").join("server.db");

    let prepared = prepare_database_url(db_path.to_string_lossy().as_ref()).expect("prepare");
    let storage = storage::Storage::new(&prepared).await.expect("open sqlite");
    drop(storage);

    assert!(
        db_path.exists(),
        "database file should be created: {}",
        db_path.display()
    );
}
