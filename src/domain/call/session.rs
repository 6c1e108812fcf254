//! Signaling and media session port
//!
//! A `Session` wraps the SIP dialog and the media streams of one call. The
//! call engine drives it through these primitives and the signaling layer
//! reports back through the `Call::on_session_*` entry points on a later tick.
//! Implementations must not call back into the owning call synchronously.

use crate::domain::call::value_object::{CallState, ErrorInfo, MediaParams, StreamType};
use crate::domain::shared::result::Result;
use crate::domain::shared::value_objects::SipUri;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// RTP statistics snapshot for one stream
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallStats {
    pub stream_type: Option<StreamType>,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_lost: u64,
    pub jitter_ms: f32,
    pub round_trip_delay_ms: f32,
    pub quality: f32,
}

/// SIP INFO message payload
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfoMessage {
    pub content_type: Option<String>,
    pub body: Option<String>,
    pub headers: Headers,
}

/// Custom SIP headers exposed on ACK and INFO processing
pub type Headers = BTreeMap<String, String>;

/// Session primitives used by the call state machine
#[cfg_attr(test, mockall::automock)]
pub trait Session {
    /// Prepare the session for an incoming INVITE
    fn initiate_incoming(&mut self);

    /// Prepare the session for an outgoing INVITE; false if it cannot be created
    fn initiate_outgoing(&mut self) -> bool;

    /// Send the INVITE
    fn start_invite(&mut self, destination: &SipUri) -> Result<()>;

    fn accept(&mut self, params: Option<MediaParams>) -> Result<()>;

    fn accept_early_media(&mut self, params: Option<MediaParams>) -> Result<()>;

    fn accept_update(&mut self, params: Option<MediaParams>) -> Result<()>;

    fn decline(&mut self, info: &ErrorInfo) -> Result<()>;

    fn terminate(&mut self, info: Option<ErrorInfo>) -> Result<()>;

    fn redirect(&mut self, target: &SipUri) -> Result<()>;

    fn update(&mut self, params: Option<MediaParams>) -> Result<()>;

    fn defer_update(&mut self) -> Result<()>;

    fn pause(&mut self) -> Result<()>;

    fn resume(&mut self) -> Result<()>;

    /// Send a REFER, with a Replaces token for attended transfers
    fn refer(&mut self, target: &SipUri, replaces: Option<String>) -> Result<()>;

    /// Report the progress of a transfer we were asked to perform (NOTIFY)
    fn notify_refer_state(&mut self, state: CallState) -> Result<()>;

    /// Dialog identifier usable in a Replaces header
    fn replaces_token(&self) -> Option<String>;

    fn send_dtmf(&mut self, dtmf: char) -> Result<()>;

    fn send_dtmfs(&mut self, dtmfs: &str) -> Result<()>;

    fn cancel_dtmfs(&mut self);

    fn send_info(&mut self, info: &InfoMessage) -> Result<()>;

    /// Time since the last RTP packet on a started audio stream
    fn audio_inactivity(&self) -> Option<Duration>;

    fn stats(&self, stream: StreamType) -> Option<CallStats>;

    fn set_microphone_muted(&mut self, muted: bool);

    fn microphone_muted(&self) -> bool;

    fn start_recording(&mut self) -> Result<()>;

    fn stop_recording(&mut self);

    fn take_video_snapshot(&mut self, file: &str) -> Result<()>;

    /// Negotiated parameters, once media is up
    fn current_params(&self) -> Option<MediaParams>;
}

/// Creates sessions for outgoing calls
#[cfg_attr(test, mockall::automock)]
pub trait SessionFactory {
    fn create_outgoing(
        &self,
        from: &SipUri,
        to: &SipUri,
        params: &MediaParams,
    ) -> Result<Box<dyn Session>>;
}
