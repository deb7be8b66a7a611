use assert_cmd::Command;
use predicates::str::contains;
use std::io::Write;
use tempfile::NamedTempFile;

/// Helper: write a temporary project definition YAML file.
fn write_project(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("failed to create temp file");
    write!(file, "{}", contents).expect("failed to write YAML");
    file
}

#[tokio::test]
async fn test_run_flow_executes_a_linear_chain() {
    let yaml = r#"
name: linear
steps:
  - name: a
    type: mock
    config:
      out: "x"
  - name: b
    type: mock
edges:
  - source: a
    target: b
"#;
    let file = write_project(yaml);

    Command::cargo_bin("workflow-core")
        .unwrap()
        .arg("run-flow")
        .arg(file.path())
        .assert()
        .success()
        .stdout(contains("output:"))
        .stdout(contains("Completed"));
}

#[tokio::test]
async fn test_run_flow_rejects_a_cycle() {
    let yaml = r#"
name: cyclic
steps:
  - name: a
    type: mock
  - name: b
    type: mock
edges:
  - source: a
    target: b
  - source: b
    target: a
"#;
    let file = write_project(yaml);

    Command::cargo_bin("workflow-core")
        .unwrap()
        .arg("run-flow")
        .arg(file.path())
        .assert()
        .failure()
        .stderr(contains("run failed"));
}

#[tokio::test]
async fn test_run_flow_handles_missing_file() {
    Command::cargo_bin("workflow-core")
        .unwrap()
        .arg("run-flow")
        .arg("config/does_not_exist.yml")
        .assert()
        .failure();
}

#[tokio::test]
async fn test_run_flow_condition_prunes_the_false_branch() {
    let yaml = r#"
name: branch
steps:
  - name: a
    type: mock
    config:
      out: 5
  - name: c
    type: condition
    config:
      expr: "$ > 3"
  - name: t
    type: mock
    config:
      out: "yes"
  - name: f
    type: mock
    config:
      out: "no"
edges:
  - source: a
    target: c
  - source: c
    source_port: "true"
    target: t
  - source: c
    source_port: "false"
    target: f
"#;
    let file = write_project(yaml);

    Command::cargo_bin("workflow-core")
        .unwrap()
        .arg("run-flow")
        .arg(file.path())
        .assert()
        .success()
        .stdout(contains("f [Skipped]"))
        .stdout(contains("output: \"yes\""));
}

#[tokio::test]
async fn test_seed_validate_accepts_the_builtin_catalog() {
    Command::cargo_bin("workflow-core")
        .unwrap()
        .arg("seed")
        .arg("--validate")
        .assert()
        .success()
        .stdout(contains("catalog is valid"));
}
