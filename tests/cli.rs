use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::tempdir;

#[test]
fn quill_runs_script_file() {
    let dir = tempdir().expect("create temp dir");
    let script = dir.path().join("hello.ql");
    fs::write(
        &script,
        r#"
        class Greeter {
            var name = "quill";
            function greet() { return "Hello from " + this.name + "!"; }
        }
        println(new Greeter().greet());
        "#,
    )
    .expect("write script");

    let mut cmd = Command::cargo_bin("quill").expect("binary exists");
    cmd.arg(&script);
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("Hello from quill!"));
}

#[test]
fn quill_reports_script_errors_without_formatting() {
    let dir = tempdir().expect("create temp dir");
    let script = dir.path().join("broken.ql");
    fs::write(&script, "function f() { return 1 / 0; }\nf();\n").expect("write script");

    let mut cmd = Command::cargo_bin("quill").expect("binary exists");
    cmd.arg("-noformat").arg(&script);
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("Traceback (most recent call last):"))
        .stderr(predicate::str::contains("Runtime Error: division by zero"))
        .stderr(predicate::str::contains("\u{1b}[").not());
}

#[test]
fn quill_repl_reads_lines_until_quit() {
    let mut cmd = Command::cargo_bin("quill").expect("binary exists");
    cmd.arg("--noformat")
        .write_stdin("var x = 20;\n\nx * 2 + 2;\nquit\nprintln(\"ignored\");\n");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("42"))
        .stdout(predicate::str::contains("ignored").not());
}
