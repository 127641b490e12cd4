//! CLI integration tests for mssql-snowflake-migrate.
//!
//! These tests verify command-line argument parsing, help output,
//! and exit codes for configuration errors.

use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;

/// Get a command for the mssql-snowflake-migrate binary.
fn cmd() -> Command {
    Command::cargo_bin("mssql-snowflake-migrate").unwrap()
}

fn config_file(content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

// =============================================================================
// Help and Version Tests
// =============================================================================

#[test]
fn test_help_shows_all_commands() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("export"))
        .stdout(predicate::str::contains("load"))
        .stdout(predicate::str::contains("health-check"));
}

#[test]
fn test_run_subcommand_help() {
    cmd()
        .args(["run", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--dry-run"))
        .stdout(predicate::str::contains("--workers"));
}

#[test]
fn test_load_subcommand_help() {
    cmd()
        .args(["load", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--workers"))
        .stdout(predicate::str::contains("--dry-run").not());
}

#[test]
fn test_version_flag() {
    cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("mssql-snowflake-migrate"));
}

// =============================================================================
// Global Flags Tests
// =============================================================================

#[test]
fn test_output_json_flag_exists() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--output-json"));
}

#[test]
fn test_log_format_flag_exists() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--log-format"))
        .stdout(predicate::str::contains("[default: text]"));
}

#[test]
fn test_verbosity_flag_exists() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--verbosity"))
        .stdout(predicate::str::contains("[default: info]"));
}

#[test]
fn test_config_default_path() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("[default: config.yaml]"));
}

#[test]
fn test_short_config_flag() {
    cmd()
        .args(["-c", "some_config.yaml", "--help"])
        .assert()
        .success();
}

// =============================================================================
// Exit Code Tests
// =============================================================================

#[test]
fn test_missing_config_exits_with_code_7() {
    // Missing file is an IO error, not a config error
    cmd()
        .args(["--config", "nonexistent_config_file.yaml", "run"])
        .assert()
        .code(7);
}

#[test]
fn test_invalid_yaml_exits_with_code_1() {
    let file = config_file("invalid: yaml: content: [\n");

    cmd()
        .args(["--config", file.path().to_str().unwrap(), "export"])
        .assert()
        .code(1);
}

#[test]
fn test_empty_config_exits_with_code_1() {
    let file = tempfile::NamedTempFile::new().unwrap();

    cmd()
        .args(["--config", file.path().to_str().unwrap(), "health-check"])
        .assert()
        .code(1);
}

#[test]
fn test_missing_max_retries_exits_with_code_1() {
    let file = config_file(
        "source: { host: h, database: d, user: u }\n\
         target: { account: a, token: t, database: D }\n\
         migration: { batch_size: 100 }\n",
    );

    cmd()
        .args(["--config", file.path().to_str().unwrap(), "load"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("max_retries is required"));
}

#[test]
fn test_wrong_target_type_exits_with_code_1() {
    let file = config_file(
        "source: { host: h, database: d, user: u }\n\
         target: { type: postgres, account: a, token: t, database: D }\n\
         migration: { max_retries: 3 }\n",
    );

    cmd()
        .args(["--config", file.path().to_str().unwrap(), "run"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("target.type"));
}

#[test]
fn test_unknown_log_format_exits_with_code_1() {
    cmd()
        .args(["--log-format", "xml", "run"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("unknown log format"));
}

// =============================================================================
// Subcommand Existence Tests
// =============================================================================

#[test]
fn test_health_check_command_exists() {
    cmd()
        .args(["health-check", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Test source and destination connections"));
}

#[test]
fn test_export_command_exists() {
    cmd()
        .args(["export", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("staging directory"));
}

#[test]
fn test_no_subcommand_shows_help() {
    cmd()
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage:"));
}
