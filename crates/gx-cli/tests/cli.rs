use assert_cmd::Command;

fn gx() -> Command {
    Command::cargo_bin("gx").expect("gx binary builds")
}

#[test]
fn version_flag_works() {
    gx().arg("--version").assert().success();
}

#[test]
fn help_lists_both_commands() {
    let assert = gx().arg("--help").assert().success();
    let output = String::from_utf8_lossy(&assert.get_output().stdout).to_string();
    assert!(output.contains("install"));
    assert!(output.contains("cleanup"));
}

#[test]
fn missing_requirements_file_exits_nonzero() {
    let temp = tempfile::tempdir().unwrap();
    gx().current_dir(temp.path())
        .args([
            "install",
            "--quiet",
            "-r",
            "does-not-exist.yml",
            "--cache-dir",
            temp.path().join("cache").to_str().unwrap(),
            "-p",
            temp.path().join("collections").to_str().unwrap(),
        ])
        .assert()
        .code(1);
}

#[test]
fn cleanup_with_empty_registry_succeeds() {
    let temp = tempfile::tempdir().unwrap();
    gx().current_dir(temp.path())
        .args([
            "cleanup",
            "--quiet",
            "--cache-dir",
            temp.path().join("cache").to_str().unwrap(),
        ])
        .assert()
        .success();
}
