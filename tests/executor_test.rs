//! Executor tests against a real /bin/sh.

use ghostknock::config::Action;
use ghostknock::executor::{execute, redacted_params, sanitize_params};
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};
use tempfile::TempDir;

const SOURCE: &str = "203.0.113.5";

fn action(command: &str) -> Action {
    Action {
        command: command.to_string(),
        revert_command: None,
        revert_delay_seconds: 0,
        timeout_seconds: 0,
        cooldown_seconds: None,
        run_as_user: None,
        sensitive_params: Vec::new(),
    }
}

fn src() -> IpAddr {
    SOURCE.parse().unwrap()
}

fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

// =============================================================================
// SANITIZATION
// =============================================================================

#[test]
fn test_sanitize_rejects_shell_metacharacters() {
    for bad in ["foo;rm -rf /", "a|b", "$(id)", "`id`", "a b", "..", "", "-flag"] {
        let err = sanitize_params(&params(&[("x", bad)])).unwrap_err();
        assert_eq!(err.reason(), "unsafe_param", "{bad:?} must be rejected");
    }
}

#[test]
fn test_sanitize_accepts_safe_values() {
    assert!(sanitize_params(&params(&[("user", "alice_01"), ("file", "a.b-c")])).is_ok());
    assert!(sanitize_params(&HashMap::new()).is_ok());
}

#[tokio::test]
async fn test_unsafe_param_spawns_nothing() {
    let dir = TempDir::new().unwrap();
    let marker = dir.path().join("ran");
    let action = action(&format!("touch {}", marker.display()));

    // The unsafe value is not even referenced by the template; every param
    // is vetted regardless.
    let err = execute(&action, "add_user", src(), &params(&[("username", "foo;rm -rf /")]))
        .await
        .unwrap_err();
    assert_eq!(err.reason(), "unsafe_param");
    assert!(!marker.exists(), "no child process may run after an unsafe param");
}

#[tokio::test]
async fn test_missing_template_param_spawns_nothing() {
    let dir = TempDir::new().unwrap();
    let marker = dir.path().join("ran");
    let action = action(&format!("touch {} && useradd {{{{.Params.username}}}}", marker.display()));

    let err = execute(&action, "add_user", src(), &HashMap::new()).await.unwrap_err();
    assert_eq!(err.reason(), "missing_param");
    assert!(!marker.exists());
}

// =============================================================================
// EXECUTION
// =============================================================================

#[tokio::test]
async fn test_execute_expands_source_ip_and_params() {
    let dir = TempDir::new().unwrap();
    let out = dir.path().join("out");
    let action = action(&format!("echo {{{{.SourceIP}}}} {{{{.Params.who}}}} > {}", out.display()));

    execute(&action, "echo", src(), &params(&[("who", "alice")])).await.unwrap();

    let written = std::fs::read_to_string(&out).unwrap();
    assert_eq!(written.trim(), format!("{SOURCE} alice"));
}

#[tokio::test]
async fn test_execute_supports_shell_pipelines() {
    let dir = TempDir::new().unwrap();
    let out = dir.path().join("out");
    let action = action(&format!("printf 'b\\na\\n' | sort > {}", out.display()));

    execute(&action, "sorted", src(), &HashMap::new()).await.unwrap();
    assert_eq!(std::fs::read_to_string(&out).unwrap(), "a\nb\n");
}

#[tokio::test]
async fn test_non_zero_exit_reported() {
    let action = action("exit 3");
    let err = execute(&action, "fail", src(), &HashMap::new()).await.unwrap_err();
    assert_eq!(err.reason(), "non_zero_exit");
    assert_eq!(err.to_string(), "command exited with status 3");
}

#[tokio::test]
async fn test_timeout_kills_the_child() {
    let mut action = action("sleep 30");
    action.timeout_seconds = 1;

    let started = Instant::now();
    let err = execute(&action, "slow", src(), &HashMap::new()).await.unwrap_err();
    assert_eq!(err.reason(), "timeout");
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_zero_timeout_means_unlimited() {
    let action = action("sleep 2 && true");
    execute(&action, "slowish", src(), &HashMap::new()).await.unwrap();
}

// =============================================================================
// REVERT
// =============================================================================

#[tokio::test]
async fn test_revert_runs_after_delay() {
    let dir = TempDir::new().unwrap();
    let main_marker = dir.path().join("main");
    let revert_marker = dir.path().join("revert");

    let mut action = action(&format!("touch {}", main_marker.display()));
    action.revert_command = Some(format!("touch {}", revert_marker.display()));
    action.revert_delay_seconds = 1;

    execute(&action, "open", src(), &HashMap::new()).await.unwrap();
    assert!(main_marker.exists());
    assert!(!revert_marker.exists(), "revert must wait for its delay");

    tokio::time::sleep(Duration::from_millis(1700)).await;
    assert!(revert_marker.exists());
}

#[tokio::test]
async fn test_failed_main_command_skips_revert() {
    let dir = TempDir::new().unwrap();
    let revert_marker = dir.path().join("revert");

    let mut action = action("exit 1");
    action.revert_command = Some(format!("touch {}", revert_marker.display()));
    action.revert_delay_seconds = 1;

    assert!(execute(&action, "open", src(), &HashMap::new()).await.is_err());
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(!revert_marker.exists());
}

// =============================================================================
// SENSITIVE PARAMS
// =============================================================================

#[test]
fn test_redacted_params_masks_copy_only() {
    let mut action = action("true");
    action.sensitive_params = vec!["password".to_string()];

    let original = params(&[("password", "hunter2.x"), ("user", "alice")]);
    let masked = redacted_params(&action, &original);

    assert_eq!(masked["password"], "*****");
    assert_eq!(masked["user"], "alice");
    // The original map is never mutated.
    assert_eq!(original["password"], "hunter2.x");
}

#[tokio::test]
async fn test_sensitive_params_still_reach_the_command() {
    let dir = TempDir::new().unwrap();
    let out = dir.path().join("out");
    let mut action = action(&format!("echo {{{{.Params.token}}}} > {}", out.display()));
    action.sensitive_params = vec!["token".to_string()];

    execute(&action, "login", src(), &params(&[("token", "sesame.42")])).await.unwrap();
    assert_eq!(std::fs::read_to_string(&out).unwrap().trim(), "sesame.42");
}
