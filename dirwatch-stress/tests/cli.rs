use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;

fn stress() -> assert_cmd::Command {
    let mut cmd = cargo_bin_cmd!("dirwatch-stress");
    cmd.env_remove("DIRWATCH_CONFIG_PATH")
        .env_remove("DIRWATCH_CONFIG_JSON")
        .env("RUST_LOG", "warn");
    cmd
}

#[test]
fn help_lists_both_modes() {
    stress()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("sequential"))
        .stdout(predicate::str::contains("concurrent"));
}

#[test]
fn run_help_documents_options() {
    let out = stress()
        .arg("sequential")
        .arg("--help")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8_lossy(&out);
    for flag in ["--iterations", "--deadline-secs", "--backend", "--json", "--config"] {
        assert!(text.contains(flag), "sequential help missing {flag}");
    }
}

#[test]
fn scripted_dry_run_passes_and_reports_json() {
    let work = tempfile::tempdir().unwrap();
    stress()
        .current_dir(work.path())
        .args(["sequential", "--backend", "scripted", "--fail-every", "2"])
        .args(["--iterations", "4", "--json", "--dir"])
        .arg(work.path())
        .assert()
        .code(0)
        .stdout(predicate::str::contains(r#""verdict": "passed""#))
        .stdout(predicate::str::contains(r#""planned_iterations": 4"#));
}

#[test]
fn dry_run_without_injected_failures_is_inconclusive() {
    let work = tempfile::tempdir().unwrap();
    stress()
        .current_dir(work.path())
        .args(["concurrent", "--backend", "scripted", "--fail-every", "0"])
        .args(["--iterations", "3", "--dir"])
        .arg(work.path())
        .assert()
        .code(2)
        .stdout(predicate::str::contains("cannot reproduce"));
}

#[test]
fn inline_env_settings_are_applied() {
    let work = tempfile::tempdir().unwrap();
    stress()
        .current_dir(work.path())
        .env("DIRWATCH_CONFIG_JSON", r#"{"iterations": 2, "settle_ms": 1}"#)
        .args(["sequential", "--backend", "scripted", "--fail-every", "1", "--json"])
        .arg("--dir")
        .arg(work.path())
        .assert()
        .code(0)
        .stdout(predicate::str::contains(r#""planned_iterations": 2"#));
}

#[test]
fn zero_iterations_is_rejected() {
    let work = tempfile::tempdir().unwrap();
    stress()
        .current_dir(work.path())
        .args(["sequential", "--backend", "scripted", "--iterations", "0"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("iterations must be at least 1"));
}
