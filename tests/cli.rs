use assert_cmd::prelude::*;
use std::{fs, process::Command};
use tempfile::TempDir;

fn write_env(dir: &TempDir, relays: &str) -> String {
    let env_path = dir.path().join("env");
    let content = format!(
        "RELAYS_DEFAULT={relays}\nCACHE_ROOT={}\nPER_RELAY_TIMEOUT_MS=300\n",
        dir.path().join("cache").display()
    );
    fs::write(&env_path, content).unwrap();
    env_path.to_str().unwrap().to_string()
}

#[test]
fn help_lists_subcommands() {
    let out = Command::cargo_bin("relayview")
        .unwrap()
        .arg("--help")
        .output()
        .unwrap();
    assert!(out.status.success());
    let text = String::from_utf8_lossy(&out.stdout);
    for cmd in ["fetch", "get", "relays", "cache"] {
        assert!(text.contains(cmd), "missing {cmd} in help");
    }
}

#[test]
fn fetch_with_unreachable_relay_prints_summary() {
    let dir = TempDir::new().unwrap();
    let env_path = write_env(&dir, "ws://127.0.0.1:9");
    let out = Command::cargo_bin("relayview")
        .unwrap()
        .args(["--env", &env_path, "fetch", "--kind", "1", "--limit", "5"])
        .output()
        .unwrap();
    assert!(out.status.success());
    assert!(out.stdout.is_empty());
    let err = String::from_utf8_lossy(&out.stderr);
    assert!(err.contains("ws://127.0.0.1:9"));
    assert!(err.contains("\"failed\""));
}

#[test]
fn fetch_accepts_raw_filter() {
    let dir = TempDir::new().unwrap();
    let env_path = write_env(&dir, "ws://127.0.0.1:9");
    let out = Command::cargo_bin("relayview")
        .unwrap()
        .args(["--env", &env_path, "fetch", "--filter", r##"{"kinds":[1],"#t":["news"]}"##])
        .output()
        .unwrap();
    assert!(out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("\"failed\""));
}

#[test]
fn fetch_rejects_malformed_filter() {
    let dir = TempDir::new().unwrap();
    let env_path = write_env(&dir, "ws://127.0.0.1:9");
    for bad in ["{kinds", "[1, 2]"] {
        Command::cargo_bin("relayview")
            .unwrap()
            .args(["--env", &env_path, "fetch", "--filter", bad])
            .assert()
            .failure();
    }
}

#[test]
fn get_without_data_exits_cleanly() {
    let dir = TempDir::new().unwrap();
    let env_path = write_env(&dir, "");
    let out = Command::cargo_bin("relayview")
        .unwrap()
        .args(["--env", &env_path, "get", "pk", "--view", "articles"])
        .output()
        .unwrap();
    assert!(out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("no data available"));
}

#[test]
fn relays_remove_unknown_fails() {
    let dir = TempDir::new().unwrap();
    let env_path = write_env(&dir, "ws://one");
    Command::cargo_bin("relayview")
        .unwrap()
        .args(["--env", &env_path, "relays", "remove", "ws://two"])
        .assert()
        .failure();
    let data = fs::read_to_string(&env_path).unwrap();
    assert!(data.contains("RELAYS_DEFAULT=ws://one"));
}

#[test]
fn cache_purge_removes_junk() {
    let dir = TempDir::new().unwrap();
    let env_path = write_env(&dir, "");
    let cache = dir.path().join("cache");
    fs::create_dir_all(&cache).unwrap();
    fs::write(cache.join("junk.json"), "{").unwrap();
    Command::cargo_bin("relayview")
        .unwrap()
        .args(["--env", &env_path, "cache", "purge"])
        .assert()
        .success();
    assert!(!cache.join("junk.json").exists());
}
