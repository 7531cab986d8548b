//! Sandboxed command execution.
//!
//! Every command goes through the same pipeline: sanitize the client
//! params, check the template references only params that exist, expand,
//! then run `/bin/sh -c` with optional privilege drop and timeout. The
//! revert branch reruns the identical pipeline after its delay on a
//! detached task.
//!
//! Param values are the only client-controlled bytes that reach the shell,
//! which is why the accepted alphabet is a single conservative class and
//! `..` is banned outright.

use crate::config::Action;
use std::collections::HashMap;
use std::net::IpAddr;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

/// Placeholder substituted with the knock's source address.
const SOURCE_IP_MARKER: &str = "{{.SourceIP}}";

/// Prefix of a parameter placeholder; the name runs until `}}`.
const PARAM_MARKER_PREFIX: &str = "{{.Params.";

const PARAM_MARKER_SUFFIX: &str = "}}";

#[derive(Error, Debug)]
pub enum ExecError {
    #[error("parameter '{0}' contains unsafe characters")]
    UnsafeParam(String),
    #[error("template references parameter '{0}' which was not provided")]
    MissingParam(String),
    #[error("failed to spawn command: {0}")]
    SpawnFailed(#[source] std::io::Error),
    #[error("command killed after {0}s timeout")]
    Timeout(u64),
    #[error("command exited with status {0}")]
    NonZeroExit(i32),
}

impl ExecError {
    /// Stable machine-parseable reason for the audit log.
    pub fn reason(&self) -> &'static str {
        match self {
            ExecError::UnsafeParam(_) => "unsafe_param",
            ExecError::MissingParam(_) => "missing_param",
            ExecError::SpawnFailed(_) => "spawn_failed",
            ExecError::Timeout(_) => "timeout",
            ExecError::NonZeroExit(_) => "non_zero_exit",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommandKind {
    Main,
    Revert,
}

impl CommandKind {
    fn as_str(self) -> &'static str {
        match self {
            CommandKind::Main => "main",
            CommandKind::Revert => "revert",
        }
    }
}

/// Accepts `^[A-Za-z0-9._][A-Za-z0-9._-]*$`, except the literal `..`.
fn is_safe_value(value: &str) -> bool {
    if value == ".." {
        return false;
    }
    let bytes = value.as_bytes();
    let Some((&first, rest)) = bytes.split_first() else {
        return false;
    };
    let body_ok = |b: u8| b.is_ascii_alphanumeric() || b == b'.' || b == b'_' || b == b'-';
    (first.is_ascii_alphanumeric() || first == b'.' || first == b'_')
        && rest.iter().all(|&b| body_ok(b))
}

/// Every value must pass [`is_safe_value`] before anything runs.
pub fn sanitize_params(params: &HashMap<String, String>) -> Result<(), ExecError> {
    for (name, value) in params {
        if !is_safe_value(value) {
            return Err(ExecError::UnsafeParam(name.clone()));
        }
    }
    Ok(())
}

/// Names referenced by `{{.Params.<name>}}` placeholders, in order of
/// appearance.
pub fn referenced_params(template: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut rest = template;
    while let Some(start) = rest.find(PARAM_MARKER_PREFIX) {
        let after = &rest[start + PARAM_MARKER_PREFIX.len()..];
        match after.find(PARAM_MARKER_SUFFIX) {
            Some(end) => {
                names.push(after[..end].to_string());
                rest = &after[end + PARAM_MARKER_SUFFIX.len()..];
            }
            None => break,
        }
    }
    names
}

/// Substitute the source IP and every parameter placeholder. Fails if the
/// template references a parameter the client did not provide.
pub fn expand_template(
    template: &str,
    source_ip: IpAddr,
    params: &HashMap<String, String>,
) -> Result<String, ExecError> {
    let mut expanded = template.replace(SOURCE_IP_MARKER, &source_ip.to_string());
    for name in referenced_params(template) {
        let value = params.get(&name).ok_or_else(|| ExecError::MissingParam(name.clone()))?;
        let marker = format!("{PARAM_MARKER_PREFIX}{name}{PARAM_MARKER_SUFFIX}");
        expanded = expanded.replace(&marker, value);
    }
    Ok(expanded)
}

/// Copy of `params` with sensitive values masked, for logging only. The
/// original map is never touched.
pub fn redacted_params(
    action: &Action,
    params: &HashMap<String, String>,
) -> HashMap<String, String> {
    let mut copy = params.clone();
    for name in &action.sensitive_params {
        if let Some(value) = copy.get_mut(name) {
            *value = "*****".to_string();
        }
    }
    copy
}

/// Run the main command for an authorized knock and, on success, schedule
/// the revert if one is configured.
pub async fn execute(
    action: &Action,
    action_id: &str,
    source_ip: IpAddr,
    params: &HashMap<String, String>,
) -> Result<(), ExecError> {
    debug!(
        action_id,
        source_ip = %source_ip,
        params = ?redacted_params(action, params),
        "executing action"
    );

    run_command(CommandKind::Main, &action.command, action, source_ip, params).await?;

    if let Some(revert_command) = &action.revert_command {
        if action.revert_delay_seconds > 0 {
            schedule_revert(
                action.clone(),
                revert_command.clone(),
                action_id.to_string(),
                source_ip,
                params.clone(),
            );
        }
    }

    Ok(())
}

/// Detached timer: sleep, then run the same pipeline for the revert
/// template. Failures are logged; there is nobody left to propagate to.
fn schedule_revert(
    action: Action,
    revert_command: String,
    action_id: String,
    source_ip: IpAddr,
    params: HashMap<String, String>,
) {
    let delay = Duration::from_secs(action.revert_delay_seconds);
    tokio::spawn(async move {
        info!(
            %action_id,
            source_ip = %source_ip,
            delay_secs = action.revert_delay_seconds,
            "revert scheduled"
        );
        tokio::time::sleep(delay).await;

        info!(%action_id, source_ip = %source_ip, "running revert");
        if let Err(err) =
            run_command(CommandKind::Revert, &revert_command, &action, source_ip, &params).await
        {
            error!(
                %action_id,
                source_ip = %source_ip,
                reason = err.reason(),
                error = %err,
                "revert failed"
            );
        }
    });
}

async fn run_command(
    kind: CommandKind,
    template: &str,
    action: &Action,
    source_ip: IpAddr,
    params: &HashMap<String, String>,
) -> Result<(), ExecError> {
    sanitize_params(params)?;
    let final_command = expand_template(template, source_ip, params)?;

    // With sensitive params configured the expanded command must never hit
    // the logs, only the raw template behind a marker.
    let loggable = if action.sensitive_params.is_empty() {
        final_command.clone()
    } else {
        format!("[REDACTED] {template}")
    };
    info!(kind = kind.as_str(), command = %loggable, source_ip = %source_ip, "running shell command");

    let mut command = Command::new("/bin/sh");
    command
        .arg("-c")
        .arg(&final_command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    if let Some(account) = &action.run_as_user {
        let user = nix::unistd::User::from_name(account)
            .map_err(|errno| ExecError::SpawnFailed(std::io::Error::from(errno)))?
            .ok_or_else(|| {
                ExecError::SpawnFailed(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("system user '{account}' not found"),
                ))
            })?;
        command.uid(user.uid.as_raw()).gid(user.gid.as_raw());
    }

    let child = command.spawn().map_err(ExecError::SpawnFailed)?;

    let output = if action.timeout_seconds == 0 {
        child.wait_with_output().await.map_err(ExecError::SpawnFailed)?
    } else {
        let limit = Duration::from_secs(action.timeout_seconds);
        match tokio::time::timeout(limit, child.wait_with_output()).await {
            Ok(waited) => waited.map_err(ExecError::SpawnFailed)?,
            // Dropping the wait future kills the child (kill_on_drop).
            Err(_) => return Err(ExecError::Timeout(action.timeout_seconds)),
        }
    };

    if !output.stdout.is_empty() {
        debug!(
            kind = kind.as_str(),
            output = %String::from_utf8_lossy(&output.stdout),
            "command stdout"
        );
    }
    if !output.stderr.is_empty() {
        warn!(
            kind = kind.as_str(),
            output = %String::from_utf8_lossy(&output.stderr),
            "command stderr"
        );
    }

    if !output.status.success() {
        return Err(ExecError::NonZeroExit(output.status.code().unwrap_or(-1)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_values() {
        for ok in ["foo", "user.name", "a", "1.2.3.4", "_tmp", "x-y_z.9"] {
            assert!(is_safe_value(ok), "{ok} should be safe");
        }
        for bad in ["", "..", "-leading", "a b", "foo;rm -rf /", "a$(id)", "café", "a\nb"] {
            assert!(!is_safe_value(bad), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn test_referenced_params() {
        let template = "useradd {{.Params.username}} && echo {{.Params.shell}} {{.SourceIP}}";
        assert_eq!(referenced_params(template), vec!["username", "shell"]);
        assert!(referenced_params("no placeholders").is_empty());
        // Unterminated marker is ignored rather than looping forever.
        assert!(referenced_params("{{.Params.broken").is_empty());
    }

    #[test]
    fn test_expand_template() {
        let mut params = HashMap::new();
        params.insert("username".to_string(), "foo".to_string());
        let expanded = expand_template(
            "useradd {{.Params.username}} # from {{.SourceIP}}",
            "203.0.113.5".parse().unwrap(),
            &params,
        )
        .unwrap();
        assert_eq!(expanded, "useradd foo # from 203.0.113.5");
    }

    #[test]
    fn test_expand_missing_param() {
        let err = expand_template(
            "useradd {{.Params.username}}",
            "203.0.113.5".parse().unwrap(),
            &HashMap::new(),
        )
        .unwrap_err();
        assert_eq!(err.reason(), "missing_param");
    }
}
