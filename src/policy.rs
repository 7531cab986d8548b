//! Authorization policy checks.
//!
//! Applied to a payload whose signature already verified, in a fixed order
//! chosen so that the cheapest checks run first and every rejection maps to
//! one stable `reason` string for the audit log.

use crate::config::{Action, User};
use crate::protocol::Payload;
use chrono::Utc;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum PolicyRejection {
    #[error("timestamp outside the replay window (age {age_secs:.3}s)")]
    OutsideReplayWindow { age_secs: f64 },
    #[error("action '{0}' is not allowed for this user")]
    UnauthorizedAction(String),
    #[error("source {0} does not match any allowed range")]
    UnauthorizedSource(IpAddr),
    #[error("action '{0}' is not defined in the actions map")]
    UnknownAction(String),
}

impl PolicyRejection {
    /// Stable machine-parseable reason for the audit log.
    pub fn reason(&self) -> &'static str {
        match self {
            PolicyRejection::OutsideReplayWindow { .. } => "outside_replay_window",
            PolicyRejection::UnauthorizedAction(_) => "unauthorized_action",
            PolicyRejection::UnauthorizedSource(_) => "unauthorized_source",
            PolicyRejection::UnknownAction(_) => "unknown_action",
        }
    }
}

/// Run the ordered policy checks and resolve the action definition.
pub fn authorize<'a>(
    payload: &Payload,
    user: &User,
    source_ip: IpAddr,
    actions: &'a HashMap<String, Action>,
    replay_window: Duration,
) -> Result<&'a Action, PolicyRejection> {
    let now_ns = Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX);
    authorize_at(payload, user, source_ip, actions, replay_window, now_ns)
}

/// [`authorize`] with an explicit clock.
pub fn authorize_at<'a>(
    payload: &Payload,
    user: &User,
    source_ip: IpAddr,
    actions: &'a HashMap<String, Action>,
    replay_window: Duration,
    now_ns: i64,
) -> Result<&'a Action, PolicyRejection> {
    // 1. Timestamp window: packets from the future are as suspect as stale
    // ones.
    let age_ns = now_ns.saturating_sub(payload.timestamp);
    let age_secs = age_ns as f64 / 1e9;
    if age_ns < 0 || age_secs > replay_window.as_secs_f64() {
        return Err(PolicyRejection::OutsideReplayWindow { age_secs });
    }

    // 2. Per-user allow-list.
    if !user.allowed_actions.contains(&payload.action_id) {
        return Err(PolicyRejection::UnauthorizedAction(payload.action_id.clone()));
    }

    // 3. Source gate: an empty list means any source.
    if !user.source_cidrs.is_empty()
        && !user.source_cidrs.iter().any(|net| net.contains(&source_ip))
    {
        return Err(PolicyRejection::UnauthorizedSource(source_ip));
    }

    // 4. Referential integrity is enforced at config load; a miss here is a
    // configuration bug, not client input.
    actions
        .get(&payload.action_id)
        .ok_or_else(|| PolicyRejection::UnknownAction(payload.action_id.clone()))
}
