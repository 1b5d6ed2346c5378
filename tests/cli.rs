use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn version_flag_prints_package_version() {
    Command::cargo_bin("starter")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")))
        .stdout(predicate::str::contains("commit:"));
}

#[test]
fn unknown_flag_is_rejected() {
    Command::cargo_bin("starter")
        .unwrap()
        .arg("--starter.bogus")
        .assert()
        .failure()
        .stderr(predicate::str::contains("--starter.bogus"));
}

#[test]
fn local_slaves_need_cluster_mode() {
    Command::cargo_bin("starter")
        .unwrap()
        .args(["--starter.local", "--starter.mode", "single"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--starter.local"));
}

#[test]
fn help_lists_starter_options() {
    Command::cargo_bin("starter")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--starter.data-dir"))
        .stdout(predicate::str::contains("--cluster.agency-size"));
}
