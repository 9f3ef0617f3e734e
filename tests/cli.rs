//! Exit codes of the `macemu` binary.
//!
//! Only paths that never reach a server are exercised here; the API itself
//! is covered by `web_api.rs`.

use std::process::{Command, Output};

fn macemu(args: &[&str]) -> Output {
    let home = tempfile::tempdir().unwrap();
    Command::new(env!("CARGO_BIN_EXE_macemu"))
        .args(args)
        .env("MACEMU_HOME", home.path())
        .env_remove("MACEMU_LOG")
        .output()
        .unwrap()
}

#[test]
fn unknown_verb_exits_with_one() {
    let out = macemu(&["bogus"]);
    assert_eq!(out.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&out.stderr).contains("bogus"));
}

#[test]
fn help_and_version_succeed() {
    let out = macemu(&["--help"]);
    assert_eq!(out.status.code(), Some(0));
    assert!(String::from_utf8_lossy(&out.stdout).contains("serve"));

    assert_eq!(macemu(&["--version"]).status.code(), Some(0));
}

#[test]
fn unreachable_server_exits_with_one() {
    let out = macemu(&["--api", "http://127.0.0.1:1", "start"]);
    assert_eq!(out.status.code(), Some(1));
}

#[test]
fn local_config_set_persists() {
    let home = tempfile::tempdir().unwrap();
    let run = |args: &[&str]| {
        Command::new(env!("CARGO_BIN_EXE_macemu"))
            .args(args)
            .env("MACEMU_HOME", home.path())
            .output()
            .unwrap()
    };

    assert!(run(&["config", "set", "RAM_MB=768"]).status.success());
    let saved = std::fs::read_to_string(home.path().join("config/qemu.conf")).unwrap();
    assert!(saved.contains("RAM_MB=768"));

    assert_eq!(run(&["config", "set", "RAM_MB=0"]).status.code(), Some(1));
}
