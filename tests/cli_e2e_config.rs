//! End-to-end tests for the `mdk config` command.

mod common;
use common::prelude::*;
use std::fs;

#[test]
fn test_config_show_default() {
    let fixture = TestFixture::new();

    fixture
        .command()
        .args(["config", "show", "upstreamRemote"])
        .assert()
        .success()
        .stdout("stable\n");
}

#[test]
fn test_config_show_object() {
    let fixture = TestFixture::new();

    fixture
        .command()
        .args(["config", "show", "wording"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"prefixStable\": \"stable_\""));
}

#[test]
fn test_config_set_persists_to_user_file() {
    let fixture = TestFixture::new();

    fixture
        .command()
        .args(["config", "set", "upstreamRemote", "origin"])
        .assert()
        .success();

    let saved: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(fixture.config_path()).unwrap()).unwrap();
    assert_eq!(saved["upstreamRemote"], "origin");
    // Untouched defaults are not copied to the user file.
    assert!(saved.get("masterBranch").is_none());

    fixture
        .command()
        .args(["config", "show", "upstreamRemote"])
        .assert()
        .success()
        .stdout("origin\n");
}

#[test]
fn test_config_set_parses_json() {
    let fixture = TestFixture::new();

    fixture
        .command()
        .args(["config", "set", "masterBranch", "502"])
        .assert()
        .success();

    let saved: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(fixture.config_path()).unwrap()).unwrap();
    assert_eq!(saved["masterBranch"], 502);
}

#[test]
fn test_config_remove_restores_default() {
    let fixture = TestFixture::new();

    fixture
        .command()
        .args(["config", "set", "myRemote", "mine"])
        .assert()
        .success();
    fixture
        .command()
        .args(["config", "remove", "myRemote"])
        .assert()
        .success();
    fixture
        .command()
        .args(["config", "show", "myRemote"])
        .assert()
        .success()
        .stdout("github\n");
}

#[test]
fn test_config_flatlist() {
    let fixture = TestFixture::new();

    fixture
        .command()
        .args(["config", "flatlist"])
        .assert()
        .success()
        .stdout(predicate::str::contains("wording.prefixStable: stable_\n"))
        .stdout(predicate::str::contains("masterBranch: 501\n"));
}

#[test]
fn test_config_show_unknown_key() {
    let fixture = TestFixture::new();

    fixture
        .command()
        .args(["config", "show", "upstreamRemot"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Did you mean 'upstreamRemote'?"));
}
