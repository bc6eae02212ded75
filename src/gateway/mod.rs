//! Gateway session engine
//!
//! One [`GatewaySession`] per shard, each on its own task. The
//! [`ShardManager`] discovers the gateway, spawns sessions and owns the
//! [`ShardState`] registry they report into.

pub mod decoder;
pub mod heartbeat;
pub mod identify;
pub mod manager;
pub mod opcode;
pub mod payload;
pub mod session;
pub mod state;

pub use decoder::FrameDecoder;
pub use heartbeat::HeartbeatTimer;
pub use identify::IdentifyQueue;
pub use manager::ShardManager;
pub use opcode::{classify_close, CloseAction, OpCode};
pub use payload::{
    Envelope, IdentifyPayload, PresenceUpdate, RequestGuildMembers, ResumePayload,
    VoiceStateUpdate,
};
pub use session::{GatewaySession, Shard, ShardHandle, ShardInfo};
pub use state::{ConnectionState, ShardState};
