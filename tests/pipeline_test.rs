//! End-to-end pipeline tests: sealed datagrams in, shell side effects out.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ed25519_dalek::VerifyingKey;
use ghostknock::config::{
    Action, Config, DaemonConfig, ListenerConfig, LoggingConfig, SecurityConfig, User,
};
use ghostknock::listener::PacketInfo;
use ghostknock::protocol::{seal_v2, KnockKeypair, Payload};
use ghostknock::server::Server;
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

const SOURCE: &str = "203.0.113.5";

struct Harness {
    server: Server,
    client: KnockKeypair,
    server_public: VerifyingKey,
    log: PathBuf,
    _dir: TempDir,
}

impl Harness {
    /// One user "alice" allowed "open_ssh"; the action appends a line to a
    /// scratch file so executions are countable.
    fn new(cooldown_seconds: Option<u64>) -> Self {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("knocks");

        let client = KnockKeypair::generate();
        let server_key = KnockKeypair::generate();
        let server_public = server_key.verifying_key();

        let action = Action {
            command: format!("echo {{{{.SourceIP}}}} >> {}", log.display()),
            revert_command: None,
            revert_delay_seconds: 0,
            timeout_seconds: 5,
            cooldown_seconds,
            run_as_user: None,
            sensitive_params: Vec::new(),
        };
        let mut actions = HashMap::new();
        actions.insert("open_ssh".to_string(), action);

        let user = User {
            name: "alice".to_string(),
            public_key: client.verifying_key(),
            public_key_b64: BASE64.encode(client.public_bytes()),
            allowed_actions: ["open_ssh".to_string()].into_iter().collect(),
            source_cidrs: Vec::new(),
        };

        let config = Config {
            listener: ListenerConfig {
                interface: "lo".to_string(),
                port: 3001,
                listen_ip: None,
            },
            logging: LoggingConfig::default(),
            daemon: DaemonConfig::default(),
            security: SecurityConfig {
                replay_window_seconds: 5,
                default_action_cooldown_seconds: 15,
                rate_limit_per_second: 1.0,
                rate_limit_burst: 3,
            },
            users: vec![user],
            actions,
            server_key,
        };

        Self { server: Server::new(Arc::new(config)), client, server_public, log, _dir: dir }
    }

    fn knock(&self, action_id: &str) -> Vec<u8> {
        seal_v2(&Payload::new(action_id), &self.client, &self.server_public).unwrap()
    }

    async fn send(&self, payload: Vec<u8>) {
        self.send_from(payload, SOURCE).await;
    }

    async fn send_from(&self, payload: Vec<u8>, source: &str) {
        let source_ip: IpAddr = source.parse().unwrap();
        self.server.process_knock(PacketInfo { payload, source_ip }).await;
    }

    fn executions(&self) -> usize {
        match std::fs::read_to_string(&self.log) {
            Ok(text) => text.lines().count(),
            Err(_) => 0,
        }
    }
}

#[tokio::test]
async fn test_happy_path_executes_with_source_ip() {
    let harness = Harness::new(None);
    harness.send(harness.knock("open_ssh")).await;

    assert_eq!(harness.executions(), 1);
    let line = std::fs::read_to_string(&harness.log).unwrap();
    assert_eq!(line.trim(), SOURCE);
}

#[tokio::test]
async fn test_replayed_datagram_rejected_before_crypto() {
    let harness = Harness::new(Some(0));
    let datagram = harness.knock("open_ssh");

    harness.send(datagram.clone()).await;
    harness.send(datagram).await;

    // Cooldown is disabled, so only the replay cache can stop the second
    // copy.
    assert_eq!(harness.executions(), 1);
}

#[tokio::test]
async fn test_cooldown_blocks_fresh_knocks() {
    let harness = Harness::new(Some(60));

    harness.send(harness.knock("open_ssh")).await;
    // A brand new datagram (new nonce, new signature) for the same (user,
    // action) hits the cooldown instead.
    harness.send(harness.knock("open_ssh")).await;

    assert_eq!(harness.executions(), 1);
}

#[tokio::test]
async fn test_rate_limit_drains_after_burst() {
    let harness = Harness::new(Some(0));

    for _ in 0..6 {
        harness.send(harness.knock("open_ssh")).await;
    }

    // burst=3 at 1/s: the refill within this test is negligible.
    assert_eq!(harness.executions(), 3);
}

#[tokio::test]
async fn test_rate_limit_is_per_source() {
    let harness = Harness::new(Some(0));

    for _ in 0..4 {
        harness.send(harness.knock("open_ssh")).await;
    }
    // Another source still has a full bucket.
    harness.send_from(harness.knock("open_ssh"), "198.51.100.7").await;

    assert_eq!(harness.executions(), 4);
}

#[tokio::test]
async fn test_stale_timestamp_rejected() {
    let harness = Harness::new(None);

    let mut payload = Payload::new("open_ssh");
    payload.timestamp -= 10_000_000_000; // 10s ago, window is 5s
    let datagram = seal_v2(&payload, &harness.client, &harness.server_public).unwrap();
    harness.send(datagram).await;

    assert_eq!(harness.executions(), 0);
}

#[tokio::test]
async fn test_unauthorized_action_rejected() {
    let harness = Harness::new(None);
    harness.send(harness.knock("shutdown")).await;
    assert_eq!(harness.executions(), 0);
}

#[tokio::test]
async fn test_unknown_signer_rejected() {
    let harness = Harness::new(None);

    let stranger = KnockKeypair::generate();
    let datagram =
        seal_v2(&Payload::new("open_ssh"), &stranger, &harness.server_public).unwrap();
    harness.send(datagram).await;

    assert_eq!(harness.executions(), 0);
}

#[tokio::test]
async fn test_short_datagram_rejected() {
    let harness = Harness::new(None);
    harness.send(vec![0u8; 88]).await;
    harness.send(Vec::new()).await;
    assert_eq!(harness.executions(), 0);
}
