use assert_cmd::Command;
use predicates::prelude::*;

fn mcpvm() -> Command {
    Command::cargo_bin("mcpvm").unwrap()
}

#[test]
fn help_works() {
    mcpvm()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Disposable RHEL test VMs"));
}

#[test]
fn help_lists_subcommands() {
    mcpvm()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("setup"))
        .stdout(predicate::str::contains("list"))
        .stdout(predicate::str::contains("delete"));
}

#[test]
fn setup_requires_version() {
    mcpvm()
        .arg("setup")
        .assert()
        .failure()
        .stderr(predicate::str::contains("--version"));
}

#[test]
fn setup_rejects_malformed_version() {
    // Input validation runs before any backend is touched, so this fails
    // the same way on machines without a hypervisor.
    mcpvm()
        .args(["setup", "--version", "banana"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid version"));
}

#[test]
fn setup_rejects_version_without_minor() {
    mcpvm()
        .args(["setup", "--version", "9"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid version"));
}

#[test]
fn setup_rejects_name_outside_convention() {
    mcpvm()
        .args(["setup", "--version", "9.5", "Bad.Name"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid name"));
}

#[test]
fn setup_rejects_unprefixed_name() {
    mcpvm()
        .args(["setup", "--version", "9.5", "swift-otter"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid name"));
}

#[test]
fn unknown_subcommand_fails() {
    mcpvm().arg("teleport").assert().failure();
}

#[test]
fn start_requires_name() {
    mcpvm().arg("start").assert().failure();
}
