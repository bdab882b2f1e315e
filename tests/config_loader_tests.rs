use dirsync::config::{ConfigError, ConfigLoader, ConflictPolicy, StrategyKind};
use std::{
    env, fs,
    path::PathBuf,
    sync::{Mutex, MutexGuard, OnceLock},
};
use tempfile::TempDir;

const MANAGED_VARS: &[&str] = &[
    "DIRSYNC_PROFILE",
    "DIRSYNC_API_BIND_ADDR",
    "DIRSYNC_LOG_LEVEL",
    "DIRSYNC_LOG_FORMAT",
    "DIRSYNC_DATABASE_URL",
    "DIRSYNC_SYNC_STRATEGY",
    "DIRSYNC_CONFLICT_POLICY",
    "DIRSYNC_BATCH_SIZE",
    "DIRSYNC_QUEUE_ORG_CONCURRENCY",
];

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
    for var in MANAGED_VARS {
        unsafe {
            env::remove_var(var);
        }
    }
}

fn write_env_file(dir: &TempDir, name: &str, contents: &str) {
    let path = dir.path().join(name);
    fs::write(path, contents).unwrap();
}

fn loader(dir: &TempDir) -> ConfigLoader {
    ConfigLoader::with_base_dir(PathBuf::from(dir.path()))
}

#[test]
fn loads_defaults_when_no_env_present() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    let cfg = loader(&temp_dir).load().expect("config loads with defaults");

    assert_eq!(cfg.profile, "local");
    assert_eq!(cfg.api_bind_addr, "0.0.0.0:8080");
    assert_eq!(cfg.sync.strategy, StrategyKind::Batch);
    assert_eq!(cfg.sync.conflict_policy, ConflictPolicy::SourceWins);
    assert_eq!(cfg.sync.diff_join_threshold, 20_000);
    cfg.bind_addr().expect("default bind addr parses");
}

#[test]
fn layered_env_files_apply_in_order() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(&temp_dir, ".env", "DIRSYNC_API_BIND_ADDR=127.0.0.1:3000\n");
    write_env_file(
        &temp_dir,
        ".env.test",
        "DIRSYNC_API_BIND_ADDR=192.168.0.10:5000\nDIRSYNC_BATCH_SIZE=250\n",
    );
    write_env_file(
        &temp_dir,
        ".env.test.local",
        "DIRSYNC_API_BIND_ADDR=10.0.0.5:6000\n",
    );
    // Profile comes from .env.local before the profile files load.
    write_env_file(
        &temp_dir,
        ".env.local",
        "DIRSYNC_PROFILE=test\nDIRSYNC_API_BIND_ADDR=127.0.0.1:4000\n",
    );

    let cfg = loader(&temp_dir)
        .load()
        .expect("config loads with layered env files");

    assert_eq!(cfg.profile, "test");
    assert_eq!(cfg.api_bind_addr, "10.0.0.5:6000");
    assert_eq!(cfg.batch.size, 250);
}

#[test]
fn os_environment_has_highest_precedence() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(
        &temp_dir,
        ".env",
        "DIRSYNC_API_BIND_ADDR=127.0.0.1:3000\nDIRSYNC_SYNC_STRATEGY=queue\n",
    );
    unsafe {
        env::set_var("DIRSYNC_API_BIND_ADDR", "0.0.0.0:9090");
        env::set_var("DIRSYNC_SYNC_STRATEGY", "realtime");
    }

    let cfg = loader(&temp_dir).load().expect("config loads with env override");
    clear_env();

    assert_eq!(cfg.api_bind_addr, "0.0.0.0:9090");
    assert_eq!(cfg.sync.strategy, StrategyKind::Realtime);
}

#[test]
fn invalid_bind_addr_returns_error() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(&temp_dir, ".env", "DIRSYNC_API_BIND_ADDR=not-an-addr\n");

    let err = loader(&temp_dir)
        .load()
        .expect_err("invalid bind addr should fail");
    assert!(matches!(err, ConfigError::InvalidBindAddr { .. }));
}

#[test]
fn unknown_strategy_is_rejected() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(&temp_dir, ".env", "DIRSYNC_SYNC_STRATEGY=eventually\n");

    let err = loader(&temp_dir).load().expect_err("strategy must be known");
    assert!(err.to_string().contains("eventually"));
}

#[test]
fn out_of_range_concurrency_is_rejected() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(&temp_dir, ".env", "DIRSYNC_QUEUE_ORG_CONCURRENCY=0\n");

    let err = loader(&temp_dir).load().expect_err("zero consumers is invalid");
    assert!(matches!(err, ConfigError::InvalidConcurrency { .. }));
}
