pub mod cache;
pub mod config;
pub mod daemon;
pub mod executor;
pub mod listener;
pub mod policy;
pub mod protocol;
pub mod rate_limit;
pub mod server;

pub use cache::{CooldownDecision, KnockCaches};
pub use config::{Action, Config, ConfigError, SecurityConfig, User};
pub use executor::ExecError;
pub use listener::{extract_packet_info, PacketInfo, MAX_PAYLOAD_SIZE};
pub use policy::PolicyRejection;
pub use protocol::{
    open_v1, open_v2, seal_v1, seal_v2, CodecError, KnockKeypair, Payload, NONCE_SIZE,
    SIGNATURE_SIZE,
};
pub use rate_limit::{SourceLimiter, TokenBucket};
pub use server::Server;
