// CLI-level tests: exit codes and configuration error surfacing.

use assert_cmd::Command;
use predicates::prelude::*;

fn volta_in(dir: &std::path::Path) -> Command {
    let mut cmd = Command::cargo_bin("volta").unwrap();
    cmd.current_dir(dir).arg("-l").arg(dir.join("run.log"));
    cmd
}

#[test]
fn missing_config_flag_is_a_usage_error() {
    let dir = tempfile::tempdir().unwrap();
    volta_in(dir.path()).assert().failure();
}

#[test]
fn nonexistent_config_exits_with_config_error() {
    let dir = tempfile::tempdir().unwrap();
    volta_in(dir.path())
        .arg("-c")
        .arg("no-such-config.yaml")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("configuration error"));
}

#[test]
fn malformed_yaml_exits_with_config_error() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("bad.yaml"), "volta: [unclosed").unwrap();
    volta_in(dir.path())
        .arg("-c")
        .arg("bad.yaml")
        .assert()
        .code(2);
}

#[test]
fn non_dict_patch_exits_with_config_error() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("ok.yaml"), "core: {}\n").unwrap();
    volta_in(dir.path())
        .arg("-c")
        .arg("ok.yaml")
        .arg("-p")
        .arg("- just\n- a\n- list")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("should be a dict"));
}

#[test]
fn unknown_volta_type_exits_with_config_error() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("cfg.yaml"),
        "volta:\n  enabled: true\n  type: quantum\n  source: /tmp/x\n",
    )
    .unwrap();
    volta_in(dir.path())
        .arg("-c")
        .arg("cfg.yaml")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("unknown volta box type"));
}

#[test]
fn help_lists_the_flags() {
    Command::cargo_bin("volta")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(
            predicate::str::contains("--config")
                .and(predicate::str::contains("--patch-cfg"))
                .and(predicate::str::contains("--defaults")),
        );
}
