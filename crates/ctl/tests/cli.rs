use std::io::Write;
use std::process::Command;

use predicates::prelude::*;

fn ctl() -> assert_cmd::Command {
    assert_cmd::Command::from_std(Command::new(assert_cmd::cargo::cargo_bin!("stapply-ctl")))
}

fn plan_file(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".stay.ini")
        .tempfile()
        .expect("tempfile");
    write!(file, "{contents}").expect("write plan");
    file
}

#[test]
fn help_lists_every_subcommand() {
    ctl()
        .arg("--help")
        .assert()
        .success()
        .stdout(
            predicate::str::contains("ping")
                .and(predicate::str::contains("discover"))
                .and(predicate::str::contains("update"))
                .and(predicate::str::contains("status"))
                .and(predicate::str::contains("run"))
                .and(predicate::str::contains("preflight"))
                .and(predicate::str::contains("adhoc")),
        );
}

#[test]
fn version_prints_the_crate_version() {
    ctl()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn status_summarises_a_plan() {
    let plan = plan_file(
        "[env:prod]\n\
         hosts = web1\n\
         apps = nginx\n\
         concurrency = 2\n\
         \n\
         [host:web1]\n\
         agent_id = web1.lan\n\
         \n\
         [app:nginx]\n\
         step1 = cmd:echo hi\n",
    );

    ctl()
        .args(["status", "-c"])
        .arg(plan.path())
        .assert()
        .success()
        .stdout(
            predicate::str::contains("prod")
                .and(predicate::str::contains("web1 (agent_id=web1.lan)"))
                .and(predicate::str::contains("nginx (1 steps)")),
        );
}

#[test]
fn status_rejects_the_wrong_extension() {
    let mut file = tempfile::Builder::new()
        .suffix(".ini")
        .tempfile()
        .expect("tempfile");
    writeln!(file, "[env:e]").expect("write");

    ctl()
        .args(["status", "-c"])
        .arg(file.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains(".stay.ini"));
}

#[test]
fn status_reports_parse_errors_with_line_numbers() {
    let plan = plan_file("[env:prod]\nregion = eu\n");

    ctl()
        .args(["status", "-c"])
        .arg(plan.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("line 2"));
}

#[test]
fn run_requires_config_and_env() {
    ctl().arg("run").assert().failure();
}

#[test]
fn invalid_timeout_is_rejected() {
    ctl()
        .args(["--timeout", "soon", "ping", "web1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("soon"));
}
