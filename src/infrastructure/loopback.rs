//! Loopback signaling session
//!
//! A `Session` that performs no network I/O. Every primitive succeeds and is
//! recorded on a shared `LoopbackProbe`, which also lets the host simulate
//! media inactivity or a refused outgoing session. The demo binary and the
//! integration tests drive calls through it.

use crate::domain::call::session::{CallStats, InfoMessage, Session, SessionFactory};
use crate::domain::call::value_object::{CallState, ErrorInfo, MediaParams, StreamType};
use crate::domain::shared::error::DomainError;
use crate::domain::shared::result::Result;
use crate::domain::shared::value_objects::SipUri;
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;
use tracing::trace;
use uuid::Uuid;

/// Primitive invoked on a loopback session
#[derive(Debug, Clone, PartialEq)]
pub enum SessionCommand {
    InitiateIncoming,
    InitiateOutgoing,
    Invite(SipUri),
    Accept,
    AcceptEarlyMedia,
    AcceptUpdate,
    Decline(ErrorInfo),
    Terminate(Option<ErrorInfo>),
    Redirect(SipUri),
    Update,
    DeferUpdate,
    Pause,
    Resume,
    Refer {
        target: SipUri,
        replaces: Option<String>,
    },
    NotifyRefer(CallState),
    Dtmf(char),
    Dtmfs(String),
    CancelDtmfs,
    Info(InfoMessage),
    StartRecording,
    StopRecording,
    Snapshot(String),
}

#[derive(Debug, Default)]
struct ProbeState {
    commands: Vec<SessionCommand>,
    audio_inactivity: Option<Duration>,
    refuse_outgoing: bool,
    fail_accept: bool,
}

/// Shared view on every session created from it
#[derive(Debug, Clone, Default)]
pub struct LoopbackProbe {
    state: Rc<RefCell<ProbeState>>,
}

impl LoopbackProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commands(&self) -> Vec<SessionCommand> {
        self.state.borrow().commands.clone()
    }

    pub fn clear(&self) {
        self.state.borrow_mut().commands.clear();
    }

    /// Time without RTP reported by every audio stream
    pub fn set_audio_inactivity(&self, inactivity: Option<Duration>) {
        self.state.borrow_mut().audio_inactivity = inactivity;
    }

    pub fn refuse_outgoing(&self, refuse: bool) {
        self.state.borrow_mut().refuse_outgoing = refuse;
    }

    /// Make `accept` fail, as a codec mismatch would
    pub fn fail_accept(&self, fail: bool) {
        self.state.borrow_mut().fail_accept = fail;
    }

    fn record(&self, command: SessionCommand) {
        trace!("Loopback session: {:?}", command);
        self.state.borrow_mut().commands.push(command);
    }
}

pub struct LoopbackSession {
    probe: LoopbackProbe,
    dialog_id: String,
    muted: bool,
    recording: bool,
    params: Option<MediaParams>,
}

impl LoopbackSession {
    pub fn new(probe: LoopbackProbe) -> Self {
        Self {
            probe,
            dialog_id: Uuid::new_v4().to_string(),
            muted: false,
            recording: false,
            params: None,
        }
    }

    pub fn is_recording(&self) -> bool {
        self.recording
    }
}

impl Session for LoopbackSession {
    fn initiate_incoming(&mut self) {
        self.probe.record(SessionCommand::InitiateIncoming);
    }

    fn initiate_outgoing(&mut self) -> bool {
        self.probe.record(SessionCommand::InitiateOutgoing);
        !self.probe.state.borrow().refuse_outgoing
    }

    fn start_invite(&mut self, destination: &SipUri) -> Result<()> {
        self.probe.record(SessionCommand::Invite(destination.clone()));
        Ok(())
    }

    fn accept(&mut self, params: Option<MediaParams>) -> Result<()> {
        if self.probe.state.borrow().fail_accept {
            return Err(DomainError::Session("No compatible codec".to_string()));
        }
        self.probe.record(SessionCommand::Accept);
        self.params = Some(params.unwrap_or_default());
        Ok(())
    }

    fn accept_early_media(&mut self, _params: Option<MediaParams>) -> Result<()> {
        self.probe.record(SessionCommand::AcceptEarlyMedia);
        Ok(())
    }

    fn accept_update(&mut self, params: Option<MediaParams>) -> Result<()> {
        self.probe.record(SessionCommand::AcceptUpdate);
        if params.is_some() {
            self.params = params;
        }
        Ok(())
    }

    fn decline(&mut self, info: &ErrorInfo) -> Result<()> {
        self.probe.record(SessionCommand::Decline(info.clone()));
        Ok(())
    }

    fn terminate(&mut self, info: Option<ErrorInfo>) -> Result<()> {
        self.probe.record(SessionCommand::Terminate(info));
        Ok(())
    }

    fn redirect(&mut self, target: &SipUri) -> Result<()> {
        self.probe.record(SessionCommand::Redirect(target.clone()));
        Ok(())
    }

    fn update(&mut self, params: Option<MediaParams>) -> Result<()> {
        self.probe.record(SessionCommand::Update);
        if params.is_some() {
            self.params = params;
        }
        Ok(())
    }

    fn defer_update(&mut self) -> Result<()> {
        self.probe.record(SessionCommand::DeferUpdate);
        Ok(())
    }

    fn pause(&mut self) -> Result<()> {
        self.probe.record(SessionCommand::Pause);
        Ok(())
    }

    fn resume(&mut self) -> Result<()> {
        self.probe.record(SessionCommand::Resume);
        Ok(())
    }

    fn refer(&mut self, target: &SipUri, replaces: Option<String>) -> Result<()> {
        self.probe.record(SessionCommand::Refer {
            target: target.clone(),
            replaces,
        });
        Ok(())
    }

    fn notify_refer_state(&mut self, state: CallState) -> Result<()> {
        self.probe.record(SessionCommand::NotifyRefer(state));
        Ok(())
    }

    fn replaces_token(&self) -> Option<String> {
        Some(self.dialog_id.clone())
    }

    fn send_dtmf(&mut self, dtmf: char) -> Result<()> {
        self.probe.record(SessionCommand::Dtmf(dtmf));
        Ok(())
    }

    fn send_dtmfs(&mut self, dtmfs: &str) -> Result<()> {
        self.probe.record(SessionCommand::Dtmfs(dtmfs.to_string()));
        Ok(())
    }

    fn cancel_dtmfs(&mut self) {
        self.probe.record(SessionCommand::CancelDtmfs);
    }

    fn send_info(&mut self, info: &InfoMessage) -> Result<()> {
        self.probe.record(SessionCommand::Info(info.clone()));
        Ok(())
    }

    fn audio_inactivity(&self) -> Option<Duration> {
        self.probe.state.borrow().audio_inactivity
    }

    fn stats(&self, stream: StreamType) -> Option<CallStats> {
        self.params.as_ref()?;
        Some(CallStats {
            stream_type: Some(stream),
            ..CallStats::default()
        })
    }

    fn set_microphone_muted(&mut self, muted: bool) {
        self.muted = muted;
    }

    fn microphone_muted(&self) -> bool {
        self.muted
    }

    fn start_recording(&mut self) -> Result<()> {
        self.probe.record(SessionCommand::StartRecording);
        self.recording = true;
        Ok(())
    }

    fn stop_recording(&mut self) {
        if self.recording {
            self.probe.record(SessionCommand::StopRecording);
            self.recording = false;
        }
    }

    fn take_video_snapshot(&mut self, file: &str) -> Result<()> {
        self.probe.record(SessionCommand::Snapshot(file.to_string()));
        Ok(())
    }

    fn current_params(&self) -> Option<MediaParams> {
        self.params.clone()
    }
}

/// Creates loopback sessions sharing one probe
#[derive(Debug, Clone, Default)]
pub struct LoopbackSessionFactory {
    probe: LoopbackProbe,
}

impl LoopbackSessionFactory {
    pub fn new(probe: LoopbackProbe) -> Self {
        Self { probe }
    }

    pub fn probe(&self) -> &LoopbackProbe {
        &self.probe
    }
}

impl SessionFactory for LoopbackSessionFactory {
    fn create_outgoing(
        &self,
        _from: &SipUri,
        _to: &SipUri,
        _params: &MediaParams,
    ) -> Result<Box<dyn Session>> {
        Ok(Box::new(LoopbackSession::new(self.probe.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::call::value_object::Reason;

    #[test]
    fn test_commands_are_recorded() {
        let probe = LoopbackProbe::new();
        let mut session = LoopbackSession::new(probe.clone());

        session.initiate_incoming();
        session.decline(&ErrorInfo::new(Reason::Busy)).unwrap();

        assert_eq!(
            probe.commands(),
            vec![
                SessionCommand::InitiateIncoming,
                SessionCommand::Decline(ErrorInfo::new(Reason::Busy)),
            ]
        );
    }

    #[test]
    fn test_negotiated_params_after_accept() {
        let mut session = LoopbackSession::new(LoopbackProbe::new());
        assert!(session.current_params().is_none());
        assert!(session.stats(StreamType::Audio).is_none());

        session.accept(None).unwrap();
        assert_eq!(session.current_params(), Some(MediaParams::default()));
        assert!(session.stats(StreamType::Audio).is_some());
    }

    #[test]
    fn test_probe_controls() {
        let probe = LoopbackProbe::new();
        let mut session = LoopbackSession::new(probe.clone());

        probe.refuse_outgoing(true);
        assert!(!session.initiate_outgoing());

        probe.set_audio_inactivity(Some(Duration::from_secs(5)));
        assert_eq!(session.audio_inactivity(), Some(Duration::from_secs(5)));

        probe.fail_accept(true);
        assert!(session.accept(None).is_err());
    }
}
