//! Configuration loading and startup validation.
//!
//! The YAML file is parsed into raw serde structs, then validated and
//! decoded into the typed [`Config`] the daemon runs on: base64 keys become
//! `VerifyingKey`s, source strings become CIDR ranges (a bare IP is
//! treated as /32), and referential integrity between users and actions is
//! enforced. Everything here is fatal; the config is immutable afterwards.

use crate::protocol::{CodecError, KnockKeypair, PUBLIC_KEY_SIZE};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ed25519_dalek::VerifyingKey;
use ipnet::IpNet;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("could not read config file '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid listener port: {0}")]
    InvalidPort(u16),
    #[error("listener interface must not be empty")]
    EmptyInterface,
    #[error("no users defined in the 'users' section")]
    NoUsers,
    #[error("no actions defined in the 'actions' section")]
    NoActions,
    #[error("user at position {0} has no name")]
    UnnamedUser(usize),
    #[error("user '{0}' has no public_key")]
    MissingPublicKey(String),
    #[error("public key of user '{0}' is not valid base64")]
    BadBase64(String),
    #[error("public key of user '{user}' has wrong size: expected {expected} bytes, got {got}")]
    BadKeySize { user: String, expected: usize, got: usize },
    #[error("public key of user '{0}' is not a valid Ed25519 key")]
    BadPublicKey(String),
    #[error("user '{0}' has no allowed actions")]
    NoAllowedActions(String),
    #[error("user '{user}' lists action '{action}' twice")]
    DuplicateAction { user: String, action: String },
    #[error("user '{user}' is allowed action '{action}', which is not defined in 'actions'")]
    UndefinedAction { user: String, action: String },
    #[error("user '{user}' has invalid source '{cidr}': not an IP or CIDR")]
    BadSourceCidr { user: String, cidr: String },
    #[error("action '{0}' has an empty command")]
    EmptyCommand(String),
    #[error("action '{0}' must not run as root")]
    RunAsRoot(String),
    #[error("action '{action}' refers to unknown system user '{account}'")]
    UnknownAccount { action: String, account: String },
    #[error("could not look up system user '{account}': {errno}")]
    AccountLookup { account: String, errno: nix::errno::Errno },
    #[error("server_private_key_path is required")]
    MissingServerKey,
    #[error("could not read server private key '{path}': {source}")]
    ServerKeyRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("server private key '{path}' is malformed (want 64 raw bytes)")]
    ServerKeyInvalid { path: PathBuf },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Info
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListenerConfig {
    pub interface: String,
    pub port: u16,
    #[serde(default)]
    pub listen_ip: Option<IpAddr>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub log_level: LogLevel,
    /// Absent means stderr; the packaged config points at
    /// /var/log/ghostknockd.log.
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub pid_file: Option<PathBuf>,
}

fn default_replay_window() -> u64 {
    5
}

fn default_cooldown() -> u64 {
    15
}

fn default_rate() -> f64 {
    1.0
}

fn default_burst() -> u32 {
    3
}

#[derive(Debug, Clone, Deserialize)]
pub struct SecurityConfig {
    #[serde(default = "default_replay_window")]
    pub replay_window_seconds: u64,
    #[serde(default = "default_cooldown")]
    pub default_action_cooldown_seconds: u64,
    #[serde(default = "default_rate")]
    pub rate_limit_per_second: f64,
    #[serde(default = "default_burst")]
    pub rate_limit_burst: u32,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            replay_window_seconds: default_replay_window(),
            default_action_cooldown_seconds: default_cooldown(),
            rate_limit_per_second: default_rate(),
            rate_limit_burst: default_burst(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Action {
    pub command: String,
    #[serde(default)]
    pub revert_command: Option<String>,
    #[serde(default)]
    pub revert_delay_seconds: u64,
    /// 0 means no timeout.
    #[serde(default)]
    pub timeout_seconds: u64,
    /// Absent means the global default; an explicit 0 disables it.
    #[serde(default)]
    pub cooldown_seconds: Option<u64>,
    #[serde(default)]
    pub run_as_user: Option<String>,
    /// Values of these params never reach the logs.
    #[serde(default)]
    pub sensitive_params: Vec<String>,
}

/// An authorized client, fully decoded.
#[derive(Debug, Clone)]
pub struct User {
    pub name: String,
    pub public_key: VerifyingKey,
    /// Kept verbatim: it is the stable identifier in cooldown keys and logs.
    pub public_key_b64: String,
    pub allowed_actions: HashSet<String>,
    /// Empty means any source is acceptable.
    pub source_cidrs: Vec<IpNet>,
}

pub struct Config {
    pub listener: ListenerConfig,
    pub logging: LoggingConfig,
    pub daemon: DaemonConfig,
    pub security: SecurityConfig,
    pub users: Vec<User>,
    pub actions: HashMap<String, Action>,
    pub server_key: KnockKeypair,
}

#[derive(Deserialize)]
struct RawUser {
    #[serde(default)]
    name: String,
    #[serde(default)]
    public_key: String,
    #[serde(default)]
    actions: Vec<String>,
    #[serde(default)]
    source_ips: Vec<String>,
}

#[derive(Deserialize)]
struct RawConfig {
    listener: ListenerConfig,
    #[serde(default)]
    logging: LoggingConfig,
    #[serde(default)]
    daemon: DaemonConfig,
    #[serde(default)]
    security: SecurityConfig,
    server_private_key_path: Option<PathBuf>,
    #[serde(default)]
    users: Vec<RawUser>,
    #[serde(default)]
    actions: HashMap<String, Action>,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        let raw: RawConfig = serde_yaml::from_str(&text)?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawConfig) -> Result<Self, ConfigError> {
        if raw.listener.port == 0 {
            return Err(ConfigError::InvalidPort(raw.listener.port));
        }
        if raw.listener.interface.is_empty() {
            return Err(ConfigError::EmptyInterface);
        }
        if raw.users.is_empty() {
            return Err(ConfigError::NoUsers);
        }
        if raw.actions.is_empty() {
            return Err(ConfigError::NoActions);
        }

        for (id, action) in &raw.actions {
            validate_action(id, action)?;
        }

        let mut users = Vec::with_capacity(raw.users.len());
        for (index, raw_user) in raw.users.into_iter().enumerate() {
            users.push(validate_user(index, raw_user, &raw.actions)?);
        }

        let key_path = raw.server_private_key_path.ok_or(ConfigError::MissingServerKey)?;
        let server_key = load_private_key(&key_path)?;

        Ok(Self {
            listener: raw.listener,
            logging: raw.logging,
            daemon: raw.daemon,
            security: raw.security,
            users,
            actions: raw.actions,
            server_key,
        })
    }
}

fn validate_user(
    index: usize,
    raw: RawUser,
    actions: &HashMap<String, Action>,
) -> Result<User, ConfigError> {
    if raw.name.is_empty() {
        return Err(ConfigError::UnnamedUser(index));
    }
    let name = raw.name;
    if raw.public_key.is_empty() {
        return Err(ConfigError::MissingPublicKey(name));
    }

    let key_bytes = BASE64
        .decode(&raw.public_key)
        .map_err(|_| ConfigError::BadBase64(name.clone()))?;
    if key_bytes.len() != PUBLIC_KEY_SIZE {
        return Err(ConfigError::BadKeySize {
            user: name,
            expected: PUBLIC_KEY_SIZE,
            got: key_bytes.len(),
        });
    }
    let raw_key: [u8; PUBLIC_KEY_SIZE] = key_bytes
        .try_into()
        .map_err(|_| ConfigError::BadPublicKey(name.clone()))?;
    let public_key =
        VerifyingKey::from_bytes(&raw_key).map_err(|_| ConfigError::BadPublicKey(name.clone()))?;

    if raw.actions.is_empty() {
        return Err(ConfigError::NoAllowedActions(name));
    }
    let mut allowed_actions = HashSet::with_capacity(raw.actions.len());
    for action in raw.actions {
        if !actions.contains_key(&action) {
            return Err(ConfigError::UndefinedAction { user: name, action });
        }
        if !allowed_actions.insert(action.clone()) {
            return Err(ConfigError::DuplicateAction { user: name, action });
        }
    }

    let mut source_cidrs = Vec::with_capacity(raw.source_ips.len());
    for source in raw.source_ips {
        source_cidrs.push(parse_source(&source).ok_or_else(|| ConfigError::BadSourceCidr {
            user: name.clone(),
            cidr: source,
        })?);
    }

    Ok(User {
        name,
        public_key,
        public_key_b64: raw.public_key,
        allowed_actions,
        source_cidrs,
    })
}

/// Accepts `10.0.0.0/8` style CIDR or a bare address, which becomes a
/// host route (/32 or /128).
pub fn parse_source(source: &str) -> Option<IpNet> {
    if let Ok(net) = source.parse::<IpNet>() {
        return Some(net);
    }
    source.parse::<IpAddr>().ok().map(IpNet::from)
}

fn validate_action(id: &str, action: &Action) -> Result<(), ConfigError> {
    if action.command.is_empty() {
        return Err(ConfigError::EmptyCommand(id.to_string()));
    }
    if let Some(account) = &action.run_as_user {
        if account == "root" {
            return Err(ConfigError::RunAsRoot(id.to_string()));
        }
        let found = nix::unistd::User::from_name(account).map_err(|errno| {
            ConfigError::AccountLookup { account: account.clone(), errno }
        })?;
        if found.is_none() {
            return Err(ConfigError::UnknownAccount {
                action: id.to_string(),
                account: account.clone(),
            });
        }
    }
    Ok(())
}

fn load_private_key(path: &Path) -> Result<KnockKeypair, ConfigError> {
    let bytes = std::fs::read(path)
        .map_err(|source| ConfigError::ServerKeyRead { path: path.to_path_buf(), source })?;
    KnockKeypair::from_keypair_bytes(&bytes).map_err(|_: CodecError| {
        ConfigError::ServerKeyInvalid { path: path.to_path_buf() }
    })
}
