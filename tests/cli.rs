use std::process::Command;

use assert_cmd::prelude::*;
use tempfile::tempdir;

fn jify() -> Command {
    Command::cargo_bin("jify").unwrap()
}

#[test]
fn index_then_find_roundtrips_through_the_cli() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("people.json");
    std::fs::write(
        &path,
        "[\n  {\"name\":\"John\",\"age\":42},\n  {\"name\":\"John\",\"age\":17},\n  {\"name\":\"John\",\"age\":50}\n]\n",
    )
    .unwrap();

    jify()
        .args(["index", path.to_str().unwrap(), "--field", "age"])
        .assert()
        .success();

    let output = jify()
        .args(["find", path.to_str().unwrap(), "--query", "age=42"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout).unwrap();
    assert!(stdout.contains("\"age\":42"));
    assert!(!stdout.contains("\"age\":17"));
}

#[test]
fn find_against_an_unindexed_field_fails_with_non_zero_exit() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("empty.json");
    std::fs::write(&path, "[\n]\n").unwrap();

    jify()
        .args(["find", path.to_str().unwrap(), "--query", "missing=1"])
        .assert()
        .failure();
}

#[test]
fn invalid_data_file_is_rejected() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("broken.json");
    std::fs::write(&path, "invalid").unwrap();

    jify()
        .args(["index", path.to_str().unwrap(), "--field", "age"])
        .assert()
        .failure();
}
