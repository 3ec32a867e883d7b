use crm_sync::config::{ConfigError, ConfigLoader};
use std::{
    env, fs,
    path::PathBuf,
    sync::{Mutex, MutexGuard, OnceLock},
};
use tempfile::TempDir;

const TEST_KEY: &str = "YWFhYWFhYWFhYWFhYWFhYWFhYWFhYWFhYWFhYWFhYWE=";

fn env_lock() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

fn env_guard() -> MutexGuard<'static, ()> {
    env_lock()
        .lock()
        .unwrap_or_else(|poison| poison.into_inner())
}

fn clear_env() {
    unsafe {
        for key in [
            "CRMSYNC_PROFILE",
            "CRMSYNC_API_BIND_ADDR",
            "CRMSYNC_LOG_LEVEL",
            "CRMSYNC_LOG_FORMAT",
            "CRMSYNC_CRYPTO_KEY",
            "CRMSYNC_HUBSPOT_CLIENT_ID",
            "CRMSYNC_HUBSPOT_CLIENT_SECRET",
            "CRMSYNC_EXECUTOR_MAX_RUN_SECONDS",
            "CRMSYNC_RETRY_BASE_SECONDS",
            "CRMSYNC_WEBHOOK_BATCH_THRESHOLD",
        ] {
            env::remove_var(key);
        }
    }
}

fn write_env_file(dir: &TempDir, name: &str, contents: &str) {
    let path = dir.path().join(name);
    fs::write(path, contents).unwrap();
}

fn empty_dir_loader() -> (TempDir, ConfigLoader) {
    let temp_dir = TempDir::new().unwrap();
    let loader = ConfigLoader::with_base_dir(PathBuf::from(temp_dir.path()));
    (temp_dir, loader)
}

#[test]
fn loads_defaults_when_only_crypto_key_present() {
    let _guard = env_guard();
    clear_env();
    unsafe {
        env::set_var("CRMSYNC_CRYPTO_KEY", TEST_KEY);
    }

    let (_dir, loader) = empty_dir_loader();
    let cfg = loader.load().expect("config loads with defaults");

    assert_eq!(cfg.profile, "local");
    assert_eq!(cfg.api_bind_addr, "0.0.0.0:8080");
    assert_eq!(cfg.log_format, "json");
    assert_eq!(cfg.crypto_key.as_deref().map(<[u8]>::len), Some(32));
    assert_eq!(cfg.webhook.batch_threshold, 25);
    assert_eq!(cfg.retry.base_seconds, 30);
    cfg.bind_addr().expect("default bind addr parses");
    clear_env();
}

#[test]
fn layered_env_files_apply_in_order() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(&temp_dir, ".env", "CRMSYNC_API_BIND_ADDR=127.0.0.1:3000\n");
    write_env_file(
        &temp_dir,
        ".env.test",
        "CRMSYNC_API_BIND_ADDR=192.168.0.10:5000\nCRMSYNC_WEBHOOK_BATCH_THRESHOLD=5\n",
    );
    write_env_file(
        &temp_dir,
        ".env.test.local",
        "CRMSYNC_API_BIND_ADDR=10.0.0.5:6000\n",
    );

    // Select profile via .env.local before profile-specific files load.
    write_env_file(
        &temp_dir,
        ".env.local",
        &format!(
            "CRMSYNC_PROFILE=test\nCRMSYNC_API_BIND_ADDR=127.0.0.1:4000\nCRMSYNC_CRYPTO_KEY={TEST_KEY}\n"
        ),
    );

    let loader = ConfigLoader::with_base_dir(PathBuf::from(temp_dir.path()));
    let cfg = loader.load().expect("config loads with layered env files");

    assert_eq!(cfg.profile, "test");
    assert_eq!(cfg.api_bind_addr, "10.0.0.5:6000");
    assert_eq!(cfg.webhook.batch_threshold, 5);
    clear_env();
}

#[test]
fn os_environment_has_highest_precedence() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(
        &temp_dir,
        ".env",
        "CRMSYNC_API_BIND_ADDR=127.0.0.1:3000\nCRMSYNC_RETRY_BASE_SECONDS=60\n",
    );

    unsafe {
        env::set_var("CRMSYNC_API_BIND_ADDR", "0.0.0.0:9090");
        env::set_var("CRMSYNC_CRYPTO_KEY", TEST_KEY);
    }

    let loader = ConfigLoader::with_base_dir(PathBuf::from(temp_dir.path()));
    let cfg = loader.load().expect("config loads with env override");
    assert_eq!(cfg.api_bind_addr, "0.0.0.0:9090");
    assert_eq!(cfg.retry.base_seconds, 60);

    clear_env();
}

#[test]
fn invalid_bind_addr_returns_error() {
    let _guard = env_guard();
    clear_env();

    unsafe {
        env::set_var("CRMSYNC_API_BIND_ADDR", "not-an-addr");
        env::set_var("CRMSYNC_CRYPTO_KEY", TEST_KEY);
    }
    let (_dir, loader) = empty_dir_loader();
    let err = loader.load().expect_err("invalid bind addr should fail");
    assert!(format!("{}", err).contains("invalid api bind address"));

    clear_env();
}

#[test]
fn missing_crypto_key_is_rejected() {
    let _guard = env_guard();
    clear_env();

    let (_dir, loader) = empty_dir_loader();
    let err = loader.load().expect_err("crypto key is required");
    assert!(matches!(err, ConfigError::MissingCryptoKey));

    clear_env();
}

#[test]
fn short_crypto_key_is_rejected() {
    let _guard = env_guard();
    clear_env();
    unsafe {
        // 16 bytes once decoded
        env::set_var("CRMSYNC_CRYPTO_KEY", "YWFhYWFhYWFhYWFhYWFhYQ==");
    }

    let (_dir, loader) = empty_dir_loader();
    let err = loader.load().expect_err("short key should fail");
    assert!(matches!(
        err,
        ConfigError::InvalidCryptoKeyLength { length: 16 }
    ));

    clear_env();
}

#[test]
fn production_profile_requires_hubspot_app_credentials() {
    let _guard = env_guard();
    clear_env();
    unsafe {
        env::set_var("CRMSYNC_PROFILE", "prod");
        env::set_var("CRMSYNC_CRYPTO_KEY", TEST_KEY);
    }

    let (_dir, loader) = empty_dir_loader();
    let err = loader.load().expect_err("client id required outside local");
    assert!(matches!(err, ConfigError::MissingHubSpotClientId));

    unsafe {
        env::set_var("CRMSYNC_HUBSPOT_CLIENT_ID", "app-123");
        env::set_var("CRMSYNC_HUBSPOT_CLIENT_SECRET", "shh");
    }
    let cfg = loader.load().expect("prod config loads with app credentials");
    assert_eq!(cfg.hubspot.client_secret.as_deref(), Some("shh"));

    let redacted = cfg.redacted_json().unwrap();
    assert!(!redacted.contains("shh"));
    assert!(redacted.contains("[REDACTED]"));

    clear_env();
}

#[test]
fn out_of_range_values_are_rejected() {
    let _guard = env_guard();
    clear_env();
    unsafe {
        env::set_var("CRMSYNC_CRYPTO_KEY", TEST_KEY);
        env::set_var("CRMSYNC_LOG_FORMAT", "xml");
    }

    let (_dir, loader) = empty_dir_loader();
    let err = loader.load().expect_err("unknown log format");
    assert!(matches!(err, ConfigError::InvalidLogFormat { .. }));

    unsafe {
        env::remove_var("CRMSYNC_LOG_FORMAT");
        env::set_var("CRMSYNC_EXECUTOR_MAX_RUN_SECONDS", "5");
    }
    let err = loader.load().expect_err("max run below floor");
    assert!(matches!(err, ConfigError::InvalidExecutorMaxRun { value: 5 }));

    clear_env();
}
