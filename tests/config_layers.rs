use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serial_test::serial;
use subsocket::config::{CliArgs, load};

const TTL_VAR: &str = "SUBSOCKET__CACHE__TTL_SECONDS";
const EMIT_ALL_VAR: &str = "SUBSOCKET__ROOMS__EMIT_ALL";

fn write_config(contents: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!("subsocket-{}.toml", uuid::Uuid::new_v4()));
    std::fs::write(&path, contents).expect("write config file");
    path
}

fn clear_env() {
    // SAFETY: every test touching these variables runs under `#[serial]`.
    unsafe {
        std::env::remove_var(TTL_VAR);
        std::env::remove_var(EMIT_ALL_VAR);
    }
}

#[test]
#[serial]
fn config_file_values_are_applied() {
    clear_env();
    let path = write_config(
        "[server]\nport = 4500\n\n[cache]\nttl_seconds = 90\nsweep_interval_ms = 250\n",
    );
    let cli = CliArgs {
        config_file: Some(path.clone()),
        command: None,
    };

    let settings = load(&cli).expect("settings");
    std::fs::remove_file(&path).ok();

    assert_eq!(settings.server.addr.port(), 4500);
    assert_eq!(settings.cache.ttl, Duration::from_secs(90));
    assert_eq!(settings.cache.sweep_interval, Duration::from_millis(250));
}

#[test]
#[serial]
fn environment_overrides_file_and_cli_overrides_environment() {
    clear_env();
    let path = write_config("[cache]\nttl_seconds = 90\n\n[rooms]\nemit_all = false\n");
    // SAFETY: serialized with the other environment tests.
    unsafe {
        std::env::set_var(TTL_VAR, "45");
        std::env::set_var(EMIT_ALL_VAR, "true");
    }

    let from_env = load(&CliArgs {
        config_file: Some(path.clone()),
        command: None,
    })
    .expect("settings");
    assert_eq!(from_env.cache.ttl, Duration::from_secs(45));
    assert!(from_env.rooms.emit_all);

    let path_arg = path.to_string_lossy().into_owned();
    let cli = CliArgs::parse_from([
        "subsocket",
        "--config-file",
        path_arg.as_str(),
        "serve",
        "--cache-ttl-seconds",
        "7",
    ]);
    let from_cli = load(&cli).expect("settings");
    assert_eq!(from_cli.cache.ttl, Duration::from_secs(7));

    clear_env();
    std::fs::remove_file(&path).ok();
}

#[test]
#[serial]
fn missing_explicit_config_file_is_an_error() {
    clear_env();
    let cli = CliArgs {
        config_file: Some(std::env::temp_dir().join("subsocket-does-not-exist.toml")),
        command: None,
    };
    assert!(load(&cli).is_err());
}
