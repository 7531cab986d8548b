//! The knock pipeline.
//!
//! One task consumes the listener channel and runs every defense in strict
//! order: rate limit → size → replay lookup → signature loop → replay
//! record → decrypt → deserialize → policy → cooldown → execute. Cheap
//! filters always run before expensive ones, so an attacker cannot force a
//! decryption or a JSON parse without first presenting a valid signature.
//!
//! Every dropped packet produces exactly one structured event with a
//! stable `reason` field.

use crate::cache::{CooldownDecision, KnockCaches, CACHE_SWEEP_INTERVAL};
use crate::config::Config;
use crate::executor;
use crate::listener::PacketInfo;
use crate::policy;
use crate::protocol::{self, CodecError, NONCE_SIZE, SIGNATURE_SIZE};
use crate::rate_limit::{SourceLimiter, LIMITER_EVICTION_AGE, LIMITER_SWEEP_INTERVAL};
use ed25519_dalek::VerifyingKey;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub struct Server {
    config: Arc<Config>,
    limiter: SourceLimiter,
    caches: KnockCaches,
    /// X25519 form of the server key, derived once at startup.
    server_secret: crypto_box::SecretKey,
    /// Verification keys in user order; index maps back into `config.users`.
    user_keys: Vec<VerifyingKey>,
    replay_window: Duration,
}

impl Server {
    pub fn new(config: Arc<Config>) -> Self {
        let security = &config.security;
        let replay_window = Duration::from_secs(security.replay_window_seconds);
        let limiter = SourceLimiter::new(
            security.rate_limit_per_second,
            f64::from(security.rate_limit_burst),
        );
        let caches = KnockCaches::new(
            replay_window,
            Duration::from_secs(security.default_action_cooldown_seconds),
        );
        let server_secret = protocol::x25519_secret_from_ed25519(&config.server_key);
        let user_keys = config.users.iter().map(|user| user.public_key).collect();
        Self { config, limiter, caches, server_secret, user_keys, replay_window }
    }

    /// Consume the packet channel until the listener closes it. Janitors
    /// start here and stop with the cancellation token; in-flight command
    /// executions always run to completion.
    pub async fn run(self: Arc<Self>, mut packets: mpsc::Receiver<PacketInfo>, cancel: CancellationToken) {
        self.spawn_janitors(cancel);

        info!(
            users = self.config.users.len(),
            actions = self.config.actions.len(),
            "knock pipeline running"
        );
        while let Some(packet) = packets.recv().await {
            self.process_knock(packet).await;
        }
        info!("packet channel closed, pipeline stopped");
    }

    fn spawn_janitors(self: &Arc<Self>, cancel: CancellationToken) {
        let server = Arc::clone(self);
        let limiter_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(LIMITER_SWEEP_INTERVAL);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = limiter_cancel.cancelled() => break,
                    _ = tick.tick() => {
                        server.limiter.evict_idle(LIMITER_EVICTION_AGE).await;
                    }
                }
            }
        });

        let server = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(CACHE_SWEEP_INTERVAL);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => {
                        server.caches.sweep().await;
                    }
                }
            }
        });
    }

    pub async fn process_knock(&self, packet: PacketInfo) {
        let source_ip = packet.source_ip;

        if !self.limiter.allow(&source_ip.to_string()).await {
            warn!(reason = "rate_limit_exceeded", source_ip = %source_ip, "knock dropped");
            return;
        }

        if packet.payload.len() <= SIGNATURE_SIZE + NONCE_SIZE {
            debug!(
                reason = "too_short",
                source_ip = %source_ip,
                bytes = packet.payload.len(),
                "knock dropped"
            );
            return;
        }

        // Replay lookup runs before any cryptographic work: a replayed
        // signature flood must cost a map probe, not a verification.
        let mut signature = [0u8; SIGNATURE_SIZE];
        signature.copy_from_slice(&packet.payload[..SIGNATURE_SIZE]);
        if self.caches.is_replay(&signature).await {
            warn!(reason = "replay_attack_pre_auth", source_ip = %source_ip, "knock dropped");
            return;
        }

        let opened =
            match protocol::open_v2(&packet.payload, &self.user_keys, &self.server_secret) {
                Ok(opened) => opened,
                Err(err @ (CodecError::BadSignature | CodecError::BadDecryption)) => {
                    warn!(reason = codec_reason(&err), source_ip = %source_ip, "knock dropped");
                    return;
                }
                Err(err) => {
                    debug!(
                        reason = codec_reason(&err),
                        source_ip = %source_ip,
                        error = %err,
                        "knock dropped"
                    );
                    return;
                }
            };
        self.caches.record_signature(signature).await;

        let user = &self.config.users[opened.user_index];
        let payload = &opened.payload;

        let action = match policy::authorize(
            payload,
            user,
            source_ip,
            &self.config.actions,
            self.replay_window,
        ) {
            Ok(action) => action,
            Err(rejection @ policy::PolicyRejection::UnknownAction(_)) => {
                // Referential integrity is checked at load; reaching this is
                // a configuration bug worth shouting about.
                error!(
                    reason = rejection.reason(),
                    source_ip = %source_ip,
                    user = %user.name,
                    action_id = %payload.action_id,
                    "knock dropped"
                );
                return;
            }
            Err(rejection) => {
                warn!(
                    reason = rejection.reason(),
                    source_ip = %source_ip,
                    user = %user.name,
                    action_id = %payload.action_id,
                    detail = %rejection,
                    "knock dropped"
                );
                return;
            }
        };

        let effective = self.caches.effective_cooldown(action.cooldown_seconds);
        let cooldown_key = (user.public_key_b64.clone(), payload.action_id.clone());
        if let CooldownDecision::Active { remaining } =
            self.caches.check_and_set_cooldown(cooldown_key, effective).await
        {
            warn!(
                reason = "cooldown_active",
                source_ip = %source_ip,
                user = %user.name,
                action_id = %payload.action_id,
                remaining_secs = remaining.as_secs(),
                "knock dropped"
            );
            return;
        }

        info!(
            user = %user.name,
            action_id = %payload.action_id,
            source_ip = %source_ip,
            "Knock válido recibido y autorizado"
        );

        if let Err(err) =
            executor::execute(action, &payload.action_id, source_ip, &payload.params).await
        {
            error!(
                reason = err.reason(),
                source_ip = %source_ip,
                user = %user.name,
                action_id = %payload.action_id,
                error = %err,
                "action failed"
            );
        }
    }
}

fn codec_reason(err: &CodecError) -> &'static str {
    match err {
        CodecError::TooShort(_) => "too_short",
        CodecError::BadSignature => "bad_signature",
        CodecError::BadDecryption => "bad_decryption",
        CodecError::BadJson(_) => "bad_json",
        CodecError::EmptyAction => "empty_action",
        CodecError::BadKey | CodecError::SealFailed => "bad_key",
    }
}
