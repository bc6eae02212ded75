//! Gateway operation codes and close codes

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Gateway operation codes
///
/// Op codes define the type of message carried by an [`Envelope`](super::Envelope).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    /// Server dispatches an event (server only)
    Dispatch = 0,
    /// Heartbeat (client/server)
    Heartbeat = 1,
    /// Start a new session (client only)
    Identify = 2,
    /// Update presence (client only)
    StatusUpdate = 3,
    /// Join / move / leave voice channels (client only)
    VoiceStateUpdate = 4,
    VoiceServerPing = 5,
    /// Resume a dropped session (client only)
    Resume = 6,
    /// Server asks the client to reconnect and resume (server only)
    Reconnect = 7,
    /// Request offline guild members (client only)
    RequestGuildMembers = 8,
    /// Session invalidated; `d` says whether it is resumable (server only)
    InvalidSession = 9,
    /// Sent on connect with the heartbeat interval (server only)
    Hello = 10,
    /// Heartbeat acknowledged (server only)
    HeartbeatAck = 11,
}

impl OpCode {
    /// Create an `OpCode` from a raw integer value
    #[must_use]
    pub fn from_u64(value: u64) -> Option<Self> {
        match value {
            0 => Some(Self::Dispatch),
            1 => Some(Self::Heartbeat),
            2 => Some(Self::Identify),
            3 => Some(Self::StatusUpdate),
            4 => Some(Self::VoiceStateUpdate),
            5 => Some(Self::VoiceServerPing),
            6 => Some(Self::Resume),
            7 => Some(Self::Reconnect),
            8 => Some(Self::RequestGuildMembers),
            9 => Some(Self::InvalidSession),
            10 => Some(Self::Hello),
            11 => Some(Self::HeartbeatAck),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Dispatch => "Dispatch",
            Self::Heartbeat => "Heartbeat",
            Self::Identify => "Identify",
            Self::StatusUpdate => "StatusUpdate",
            Self::VoiceStateUpdate => "VoiceStateUpdate",
            Self::VoiceServerPing => "VoiceServerPing",
            Self::Resume => "Resume",
            Self::Reconnect => "Reconnect",
            Self::RequestGuildMembers => "RequestGuildMembers",
            Self::InvalidSession => "InvalidSession",
            Self::Hello => "Hello",
            Self::HeartbeatAck => "HeartbeatAck",
        }
    }
}

impl Serialize for OpCode {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u8(self.as_u8())
    }
}

impl<'de> Deserialize<'de> for OpCode {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = u64::deserialize(deserializer)?;
        Self::from_u64(value)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid op code: {value}")))
    }
}

impl std::fmt::Display for OpCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name(), self.as_u8())
    }
}

/// What a session does after the socket closed with a given code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseAction {
    /// Reconnect and resume the existing session
    Resume,
    /// Reconnect with a fresh Identify (session state is no longer valid)
    Reidentify,
    /// Close code 4004
    FatalAuthentication,
    /// Close codes 4010 / 4011
    FatalSharding,
    /// Close codes 4012 and above
    FatalRejected,
}

impl CloseAction {
    pub const fn is_fatal(self) -> bool {
        matches!(
            self,
            Self::FatalAuthentication | Self::FatalSharding | Self::FatalRejected
        )
    }
}

/// Gateway close codes the client reacts to specifically
pub mod close_code {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const UNKNOWN_ERROR: u16 = 4000;
    pub const AUTHENTICATION_FAILED: u16 = 4004;
    pub const INVALID_SEQUENCE: u16 = 4007;
    pub const SESSION_TIMED_OUT: u16 = 4009;
    pub const INVALID_SHARD: u16 = 4010;
    pub const SHARDING_REQUIRED: u16 = 4011;
    /// Private-use code the client closes with when it drops a connection
    /// itself; anything but 1000/1001 keeps the session resumable.
    pub const CLIENT_RECONNECT: u16 = 4900;
}

/// Classify a close code. `None` means the socket dropped without a close
/// frame, which is always recoverable.
pub fn classify_close(code: Option<u16>) -> CloseAction {
    use close_code::*;

    match code {
        None | Some(NORMAL | GOING_AWAY) => CloseAction::Resume,
        Some(AUTHENTICATION_FAILED) => CloseAction::FatalAuthentication,
        Some(INVALID_SEQUENCE | SESSION_TIMED_OUT) => CloseAction::Reidentify,
        Some(INVALID_SHARD | SHARDING_REQUIRED) => CloseAction::FatalSharding,
        Some(UNKNOWN_ERROR..=SESSION_TIMED_OUT) => CloseAction::Resume,
        Some(4012..=4899) => CloseAction::FatalRejected,
        // Abnormal closures (1006, 1011, ...) and anything else
        Some(_) => CloseAction::Resume,
    }
}
