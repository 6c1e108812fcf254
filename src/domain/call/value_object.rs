//! Call value objects

use crate::domain::shared::value_objects::{CallId, SipUri};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Call direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    /// We received the INVITE
    Incoming,
    /// We sent the INVITE
    Outgoing,
}

impl CallDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallDirection::Incoming => "incoming",
            CallDirection::Outgoing => "outgoing",
        }
    }
}

/// Call state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallState {
    /// Created, waiting for the session to be started or notified
    Idle,
    /// Incoming call received, ringing locally
    IncomingReceived,
    /// Outgoing call created, INVITE about to be sent
    OutgoingInit,
    /// 100 Trying received
    OutgoingProgress,
    /// 180 Ringing received
    OutgoingRinging,
    /// 183 Session Progress received
    OutgoingEarlyMedia,
    /// 200 OK sent/received
    Connected,
    /// Media streams are established
    StreamsRunning,
    /// Local pause in progress
    Pausing,
    /// Paused by us
    Paused,
    /// Local resume in progress
    Resuming,
    /// Remote asked us to call someone else
    Referred,
    /// Call failed
    Error,
    /// Call ended normally
    End,
    /// Paused by the remote party
    PausedByRemote,
    /// Remote sent a re-INVITE that waits for our answer
    UpdatedByRemote,
    /// Early media accepted on an incoming call
    IncomingEarlyMedia,
    /// Local re-INVITE in progress
    Updating,
    /// All resources released, the call is gone
    Released,
    /// Remote UPDATE received during early dialog
    EarlyUpdatedByRemote,
    /// Local UPDATE sent during early dialog
    EarlyUpdating,
}

impl CallState {
    /// Error, End and Released are terminal
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallState::Error | CallState::End | CallState::Released)
    }

    /// Outgoing attempt that has not been answered yet
    pub fn is_outgoing_pending(&self) -> bool {
        matches!(
            self,
            CallState::OutgoingInit
                | CallState::OutgoingProgress
                | CallState::OutgoingRinging
                | CallState::OutgoingEarlyMedia
        )
    }

    /// Incoming call that can still be accepted or declined
    pub fn is_incoming_pending(&self) -> bool {
        matches!(
            self,
            CallState::IncomingReceived | CallState::IncomingEarlyMedia
        )
    }

    /// States that require the ring tone
    pub fn is_ringable(&self, ring_during_early_media: bool) -> bool {
        match self {
            CallState::IncomingReceived => true,
            CallState::IncomingEarlyMedia => ring_during_early_media,
            _ => false,
        }
    }

    /// The dialog has been answered and the call is not over
    pub fn is_connected_like(&self) -> bool {
        matches!(
            self,
            CallState::Connected
                | CallState::StreamsRunning
                | CallState::Pausing
                | CallState::Paused
                | CallState::Resuming
                | CallState::PausedByRemote
                | CallState::UpdatedByRemote
                | CallState::Updating
                | CallState::Referred
        )
    }

    /// Check if a transition reported by the session is acceptable
    pub fn can_transition_to(&self, new_state: CallState) -> bool {
        use CallState::*;

        if *self == new_state {
            return false;
        }

        match (self, new_state) {
            // Nothing leaves Released
            (Released, _) => false,

            // End and Error can only be released
            (End | Error, Released) => true,
            (End | Error, _) => false,

            // Any live call may end, fail or be released by the session
            (_, End | Error | Released) => true,

            // Idle waits for either direction to start
            (Idle, IncomingReceived | OutgoingInit) => true,

            // Outgoing establishment
            (OutgoingInit, OutgoingProgress | OutgoingRinging | OutgoingEarlyMedia | Connected) => true,
            (OutgoingProgress, OutgoingRinging | OutgoingEarlyMedia | Connected) => true,
            (OutgoingRinging, OutgoingEarlyMedia | Connected | EarlyUpdating | EarlyUpdatedByRemote) => true,
            (OutgoingEarlyMedia, OutgoingRinging | Connected | EarlyUpdating | EarlyUpdatedByRemote) => true,

            // Incoming establishment
            (IncomingReceived, IncomingEarlyMedia | Connected | EarlyUpdatedByRemote) => true,
            (IncomingEarlyMedia, Connected | EarlyUpdating | EarlyUpdatedByRemote) => true,

            // Early updates go back to an early state or get answered
            (EarlyUpdating | EarlyUpdatedByRemote, OutgoingRinging | OutgoingEarlyMedia | IncomingReceived | IncomingEarlyMedia | Connected) => true,

            // Established call
            (Connected, StreamsRunning | PausedByRemote | UpdatedByRemote | Updating | Pausing | Referred) => true,
            (StreamsRunning, Pausing | PausedByRemote | UpdatedByRemote | Updating | Referred) => true,
            (Pausing, Paused | StreamsRunning) => true,
            (Paused, Resuming | UpdatedByRemote | Updating | PausedByRemote) => true,
            (Resuming, StreamsRunning | PausedByRemote | Paused) => true,
            (PausedByRemote, StreamsRunning | UpdatedByRemote | Updating | Pausing | Paused | Referred) => true,
            (UpdatedByRemote, StreamsRunning | PausedByRemote | Paused | Connected) => true,
            (Updating, StreamsRunning | PausedByRemote | Paused | Connected) => true,
            (Referred, StreamsRunning | Pausing | Paused | PausedByRemote) => true,

            _ => false,
        }
    }

    /// Get state name
    pub fn name(&self) -> &'static str {
        match self {
            CallState::Idle => "Idle",
            CallState::IncomingReceived => "IncomingReceived",
            CallState::OutgoingInit => "OutgoingInit",
            CallState::OutgoingProgress => "OutgoingProgress",
            CallState::OutgoingRinging => "OutgoingRinging",
            CallState::OutgoingEarlyMedia => "OutgoingEarlyMedia",
            CallState::Connected => "Connected",
            CallState::StreamsRunning => "StreamsRunning",
            CallState::Pausing => "Pausing",
            CallState::Paused => "Paused",
            CallState::Resuming => "Resuming",
            CallState::Referred => "Referred",
            CallState::Error => "Error",
            CallState::End => "End",
            CallState::PausedByRemote => "PausedByRemote",
            CallState::UpdatedByRemote => "UpdatedByRemote",
            CallState::IncomingEarlyMedia => "IncomingEarlyMedia",
            CallState::Updating => "Updating",
            CallState::Released => "Released",
            CallState::EarlyUpdatedByRemote => "EarlyUpdatedByRemote",
            CallState::EarlyUpdating => "EarlyUpdating",
        }
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Why a call was declined or terminated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reason {
    None,
    NoResponse,
    Forbidden,
    Declined,
    NotFound,
    NotAnswered,
    Busy,
    UnsupportedContent,
    IoError,
    DoNotDisturb,
    Unauthorized,
    NotAcceptable,
    MovedPermanently,
    MovedTemporarily,
    Gone,
    TemporarilyUnavailable,
    AddressIncomplete,
    NotImplemented,
    BadGateway,
    ServerTimeout,
    Unknown,
}

impl Reason {
    /// SIP status code used when this reason goes on the wire
    pub fn sip_code(&self) -> u16 {
        match self {
            Reason::None => 200,
            Reason::NoResponse => 408,
            Reason::Forbidden => 403,
            Reason::Declined => 603,
            Reason::NotFound => 404,
            Reason::NotAnswered => 408,
            Reason::Busy => 486,
            Reason::UnsupportedContent => 415,
            Reason::IoError => 503,
            Reason::DoNotDisturb => 600,
            Reason::Unauthorized => 401,
            Reason::NotAcceptable => 488,
            Reason::MovedPermanently => 301,
            Reason::MovedTemporarily => 302,
            Reason::Gone => 410,
            Reason::TemporarilyUnavailable => 480,
            Reason::AddressIncomplete => 484,
            Reason::NotImplemented => 501,
            Reason::BadGateway => 502,
            Reason::ServerTimeout => 504,
            Reason::Unknown => 500,
        }
    }

    /// Default reason phrase
    pub fn phrase(&self) -> &'static str {
        match self {
            Reason::None => "OK",
            Reason::NoResponse => "No response",
            Reason::Forbidden => "Forbidden",
            Reason::Declined => "Declined",
            Reason::NotFound => "Not Found",
            Reason::NotAnswered => "Request Timeout",
            Reason::Busy => "Busy Here",
            Reason::UnsupportedContent => "Unsupported Media Type",
            Reason::IoError => "Service Unavailable",
            Reason::DoNotDisturb => "Busy Everywhere",
            Reason::Unauthorized => "Unauthorized",
            Reason::NotAcceptable => "Not Acceptable Here",
            Reason::MovedPermanently => "Moved Permanently",
            Reason::MovedTemporarily => "Moved Temporarily",
            Reason::Gone => "Gone",
            Reason::TemporarilyUnavailable => "Temporarily Unavailable",
            Reason::AddressIncomplete => "Address Incomplete",
            Reason::NotImplemented => "Not Implemented",
            Reason::BadGateway => "Bad Gateway",
            Reason::ServerTimeout => "Server Time-out",
            Reason::Unknown => "Unknown error",
        }
    }
}

/// Reason code and detail attached to a terminated call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub reason: Reason,
    pub protocol: String,
    pub protocol_code: u16,
    pub phrase: String,
    pub warnings: Option<String>,
}

impl ErrorInfo {
    pub fn new(reason: Reason) -> Self {
        Self {
            reason,
            protocol: "SIP".to_string(),
            protocol_code: reason.sip_code(),
            phrase: reason.phrase().to_string(),
            warnings: None,
        }
    }

    pub fn with_phrase(mut self, phrase: &str) -> Self {
        self.phrase = phrase.to_string();
        self
    }

    pub fn with_warnings(mut self, warnings: &str) -> Self {
        self.warnings = Some(warnings.to_string());
        self
    }
}

impl Default for ErrorInfo {
    fn default() -> Self {
        Self::new(Reason::None)
    }
}

/// SRTP family used on the media streams
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaEncryption {
    #[default]
    None,
    Srtp,
    Zrtp,
    Dtls,
}

/// Parameters handed to the session for offers and answers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaParams {
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub realtime_text_enabled: bool,
    pub early_media_sending: bool,
    pub low_bandwidth: bool,
    pub media_encryption: MediaEncryption,
    pub record_file: Option<String>,
}

impl Default for MediaParams {
    fn default() -> Self {
        Self {
            audio_enabled: true,
            video_enabled: false,
            realtime_text_enabled: false,
            early_media_sending: false,
            low_bandwidth: false,
            media_encryption: MediaEncryption::None,
            record_file: None,
        }
    }
}

/// Media stream kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamType {
    Audio,
    Video,
    Text,
}

/// Indication tones played by the hardware controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tone {
    Busy,
    CallLost,
    CallEnd,
    CallOnHold,
    Undefined,
}

impl Tone {
    /// Tone played when a call fails for the given reason
    pub fn for_reason(reason: Reason) -> Option<Tone> {
        match reason {
            Reason::None => None,
            Reason::Busy | Reason::DoNotDisturb => Some(Tone::Busy),
            Reason::IoError => Some(Tone::CallLost),
            _ => Some(Tone::Undefined),
        }
    }
}

/// Destination of a call transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferTarget {
    /// Blind transfer to a new destination
    Address(SipUri),
    /// Attended transfer to another live call
    Call(CallId),
}
