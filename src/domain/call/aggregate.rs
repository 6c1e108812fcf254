//! Call aggregate root
//!
//! `Call` is a cheap, clonable handle on one call. The registry of the
//! `CallManager` holds one handle and callers may hold more; the call is
//! destroyed when the last handle is dropped.
//!
//! Every state change goes through `set_state`, which commits the new state,
//! runs the cross-call arbitration of the manager and then notifies the
//! observers. No `RefCell` borrow is held while observers or the manager
//! run, so both may issue new commands on any call.

use crate::domain::call::listener::{dispatch, CallListener, ListenerSet};
use crate::domain::call::session::{CallStats, Headers, InfoMessage, Session};
use crate::domain::call::value_object::{
    CallDirection, CallState, ErrorInfo, MediaParams, Reason, StreamType, TransferTarget,
};
use crate::domain::call_manager::{CallManager, ManagerShared};
use crate::domain::platform::BackgroundTaskToken;
use crate::domain::shared::error::DomainError;
use crate::domain::shared::result::Result;
use crate::domain::shared::value_objects::{CallId, ConferenceId, SipUri};
use chrono::{DateTime, Utc};
use std::cell::{Ref, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Handle on a call
#[derive(Clone)]
pub struct Call {
    inner: Rc<CallInner>,
}

pub(crate) struct CallInner {
    id: CallId,
    direction: CallDirection,
    manager: Weak<ManagerShared>,
    data: RefCell<CallData>,
    session: RefCell<Option<Box<dyn Session>>>,
    listeners: RefCell<ListenerSet<dyn CallListener>>,
}

pub(crate) struct CallData {
    pub(crate) state: CallState,
    pub(crate) prev_state: CallState,
    /// Bumped on every committed transition
    pub(crate) generation: u64,
    pub(crate) local_address: SipUri,
    pub(crate) remote_address: SipUri,
    pub(crate) account: Option<String>,
    pub(crate) conference: Option<ConferenceId>,
    pub(crate) params: MediaParams,
    pub(crate) error_info: ErrorInfo,
    pub(crate) transferer: Option<CallId>,
    pub(crate) transfer_target: Option<CallId>,
    pub(crate) replaced_call: Option<CallId>,
    pub(crate) transfer_state: CallState,
    pub(crate) refer_to: Option<SipUri>,
    /// The remote party asked us to perform the transfer
    pub(crate) referred_by_remote: bool,
    pub(crate) background_task: Option<BackgroundTaskToken>,
    pub(crate) background_task_requested: bool,
    pub(crate) ring_elapsed: Duration,
    pub(crate) duration: Duration,
    pub(crate) started_at: DateTime<Utc>,
    pub(crate) connected_at: Option<DateTime<Utc>>,
    pub(crate) ended_at: Option<DateTime<Utc>>,
    pub(crate) update_deferred: bool,
    pub(crate) playing_ringback_tone: bool,
    pub(crate) encrypted: bool,
    pub(crate) auth_token: Option<String>,
    pub(crate) next_video_frame_requested: bool,
}

impl Call {
    pub(crate) fn new(
        manager: Weak<ManagerShared>,
        direction: CallDirection,
        local_address: SipUri,
        remote_address: SipUri,
        params: MediaParams,
        session: Box<dyn Session>,
    ) -> Self {
        let id = CallId::new();
        debug!(
            "Creating {} call {} with {}",
            direction.as_str(),
            id,
            remote_address
        );
        Self {
            inner: Rc::new(CallInner {
                id,
                direction,
                manager,
                data: RefCell::new(CallData {
                    state: CallState::Idle,
                    prev_state: CallState::Idle,
                    generation: 0,
                    local_address,
                    remote_address,
                    account: None,
                    conference: None,
                    params,
                    error_info: ErrorInfo::default(),
                    transferer: None,
                    transfer_target: None,
                    replaced_call: None,
                    transfer_state: CallState::Idle,
                    refer_to: None,
                    referred_by_remote: false,
                    background_task: None,
                    background_task_requested: false,
                    ring_elapsed: Duration::ZERO,
                    duration: Duration::ZERO,
                    started_at: Utc::now(),
                    connected_at: None,
                    ended_at: None,
                    update_deferred: false,
                    playing_ringback_tone: false,
                    encrypted: false,
                    auth_token: None,
                    next_video_frame_requested: false,
                }),
                session: RefCell::new(Some(session)),
                listeners: RefCell::new(ListenerSet::new()),
            }),
        }
    }

    // -------------------------------------------------------------------------
    // Accessors

    pub fn id(&self) -> CallId {
        self.inner.id
    }

    pub fn direction(&self) -> CallDirection {
        self.inner.direction
    }

    pub fn state(&self) -> CallState {
        self.data().state
    }

    pub fn prev_state(&self) -> CallState {
        self.data().prev_state
    }

    pub fn local_address(&self) -> SipUri {
        self.data().local_address.clone()
    }

    pub fn remote_address(&self) -> SipUri {
        self.data().remote_address.clone()
    }

    pub fn account(&self) -> Option<String> {
        self.data().account.clone()
    }

    pub fn set_account(&self, account: Option<String>) {
        self.data_mut().account = account;
    }

    pub fn conference(&self) -> Option<ConferenceId> {
        self.data().conference
    }

    pub fn is_in_conference(&self) -> bool {
        self.data().conference.is_some()
    }

    /// Attach or detach the call from a conference
    pub fn set_conference(&self, conference: Option<ConferenceId>) {
        self.data_mut().conference = conference;
    }

    /// Parameters requested locally
    pub fn params(&self) -> MediaParams {
        self.data().params.clone()
    }

    pub fn set_params(&self, params: MediaParams) {
        self.data_mut().params = params;
    }

    /// Parameters negotiated by the session, or the local ones before that
    pub fn current_params(&self) -> MediaParams {
        let negotiated = self
            .inner
            .session
            .borrow()
            .as_ref()
            .and_then(|s| s.current_params());
        negotiated.unwrap_or_else(|| self.params())
    }

    pub fn reason(&self) -> Reason {
        self.data().error_info.reason
    }

    pub fn error_info(&self) -> ErrorInfo {
        self.data().error_info.clone()
    }

    /// Connected time accumulated by the ticks
    pub fn duration(&self) -> Duration {
        self.data().duration
    }

    /// Time spent ringing as an incoming call
    pub fn ring_elapsed(&self) -> Duration {
        self.data().ring_elapsed
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.data().started_at
    }

    pub fn connected_at(&self) -> Option<DateTime<Utc>> {
        self.data().connected_at
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.data().ended_at
    }

    pub fn transferer_call(&self) -> Option<Call> {
        let id = self.data().transferer?;
        self.manager()?.find_call(id)
    }

    pub fn transfer_target_call(&self) -> Option<Call> {
        let id = self.data().transfer_target?;
        self.manager()?.find_call(id)
    }

    pub fn replaced_call(&self) -> Option<Call> {
        let id = self.data().replaced_call?;
        self.manager()?.find_call(id)
    }

    pub fn transferer_id(&self) -> Option<CallId> {
        self.data().transferer
    }

    pub fn transfer_target_id(&self) -> Option<CallId> {
        self.data().transfer_target
    }

    pub fn replaced_call_id(&self) -> Option<CallId> {
        self.data().replaced_call
    }

    /// State of the call created to satisfy our transfer
    pub fn transfer_state(&self) -> CallState {
        self.data().transfer_state
    }

    pub fn refer_to(&self) -> Option<SipUri> {
        self.data().refer_to.clone()
    }

    pub fn has_transfer_pending(&self) -> bool {
        self.data().refer_to.is_some()
            && !matches!(
                self.data().transfer_state,
                CallState::Idle | CallState::Connected | CallState::StreamsRunning
            )
            && !self.data().transfer_state.is_terminal()
    }

    pub fn is_update_deferred(&self) -> bool {
        self.data().update_deferred
    }

    pub fn is_playing_ringback_tone(&self) -> bool {
        self.data().playing_ringback_tone
    }

    pub fn is_encrypted(&self) -> bool {
        self.data().encrypted
    }

    pub fn authentication_token(&self) -> Option<String> {
        self.data().auth_token.clone()
    }

    pub fn has_background_task(&self) -> bool {
        self.data().background_task.is_some()
    }

    pub fn has_session(&self) -> bool {
        self.inner.session.borrow().is_some()
    }

    // -------------------------------------------------------------------------
    // Observers

    pub fn add_listener(&self, listener: Rc<dyn CallListener>) {
        self.inner.listeners.borrow_mut().add(listener);
    }

    pub fn remove_listener(&self, listener: &Rc<dyn CallListener>) -> bool {
        self.inner.listeners.borrow_mut().remove(listener)
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.borrow().len()
    }

    // -------------------------------------------------------------------------
    // Transitions

    /// Start the session of a new outgoing call and send the INVITE
    pub(crate) fn initiate_outgoing(&self) -> Result<()> {
        let created = self.with_session(|s| Ok(s.initiate_outgoing()))?;
        if !created {
            let error = ErrorInfo::new(Reason::IoError).with_phrase("Could not create session");
            self.fail(error, "Could not create session");
            return Err(DomainError::Session(format!(
                "Could not create session for call {}",
                self.id()
            )));
        }

        self.set_state(CallState::OutgoingInit, "Starting outgoing call");

        let destination = self.remote_address();
        if let Err(e) = self.with_session(|s| s.start_invite(&destination)) {
            warn!("Call {}: could not send INVITE: {}", self.id(), e);
            let error = ErrorInfo::new(Reason::IoError).with_phrase(&e.to_string());
            self.fail(error, "Call failed");
            return Err(e);
        }
        Ok(())
    }

    /// Attach the session of an incoming call; the call waits in `Idle`
    pub(crate) fn initiate_incoming(&self) -> Result<()> {
        self.with_session(|s| {
            s.initiate_incoming();
            Ok(())
        })
    }

    /// Notify the application of the incoming call
    pub(crate) fn start_incoming_notification(&self) -> Result<()> {
        let state = self.state();
        if state != CallState::Idle {
            return Err(self.invalid("start incoming notification", state));
        }
        self.set_state(CallState::IncomingReceived, "Incoming call");
        Ok(())
    }

    /// Answer an incoming call
    pub fn accept(&self, params: Option<MediaParams>) -> Result<()> {
        let state = self.state();
        if !state.is_incoming_pending() {
            return Err(self.invalid("accept", state));
        }

        if let Some(manager) = self.manager() {
            manager.check_for_acceptation(self);
            manager.preempt_focus(self);
        }

        // Arbitration runs observers, which may already have ended this call
        let state = self.state();
        if !state.is_incoming_pending() {
            return Err(self.invalid("accept", state));
        }

        self.with_session(|s| s.accept(params.clone()))?;
        if let Some(params) = params {
            self.data_mut().params = params;
        }
        self.set_state(CallState::Connected, "Connected");

        if let Some(replaced) = self.replaced_call() {
            info!(
                "Call {} replaces call {}, terminating it",
                self.id(),
                replaced.id()
            );
            if let Err(e) = replaced.terminate(None) {
                warn!("Could not terminate replaced call {}: {}", replaced.id(), e);
            }
        }
        Ok(())
    }

    /// Answer an incoming call with early media only
    pub fn accept_early_media(&self, params: Option<MediaParams>) -> Result<()> {
        let state = self.state();
        if state != CallState::IncomingReceived {
            return Err(self.invalid("accept early media", state));
        }

        self.with_session(|s| s.accept_early_media(params.clone()))?;
        if let Some(params) = params {
            self.data_mut().params = params;
        }
        self.set_state(CallState::IncomingEarlyMedia, "Incoming call early media");
        Ok(())
    }

    /// Answer a renegotiation from the remote party
    pub fn accept_update(&self, params: Option<MediaParams>) -> Result<()> {
        let state = self.state();
        if !matches!(
            state,
            CallState::UpdatedByRemote | CallState::EarlyUpdatedByRemote
        ) {
            return Err(self.invalid("accept update", state));
        }

        self.with_session(|s| s.accept_update(params.clone()))?;
        let target = {
            let mut data = self.data_mut();
            data.update_deferred = false;
            if let Some(params) = params {
                data.params = params;
            }
            state_after_update(state, data.prev_state)
        };
        self.set_state(target, "Update accepted");
        Ok(())
    }

    /// Decline an incoming call
    pub fn decline(&self, reason: Reason) -> Result<()> {
        self.decline_with_error_info(ErrorInfo::new(reason))
    }

    /// Decline an incoming call with a full error description.
    ///
    /// A terminated call ignores the request. A call that is no longer an
    /// incoming offer is terminated instead.
    pub fn decline_with_error_info(&self, error_info: ErrorInfo) -> Result<()> {
        let state = self.state();
        if state.is_terminal() {
            debug!("Call {} already in {}, decline ignored", self.id(), state);
            return Ok(());
        }
        let declinable = state.is_incoming_pending()
            || (state == CallState::Idle && self.direction() == CallDirection::Incoming);
        if !declinable {
            return self.terminate(Some(error_info));
        }

        if let Err(e) = self.with_session(|s| s.decline(&error_info)) {
            warn!("Call {}: session could not decline: {}", self.id(), e);
        }
        info!(
            "Call {} declined with reason {:?} ({})",
            self.id(),
            error_info.reason,
            error_info.protocol_code
        );
        self.data_mut().error_info = error_info;
        self.set_state(CallState::End, "Call declined");
        Ok(())
    }

    /// Terminate the call. Terminating a terminated call is a no-op.
    pub fn terminate(&self, error_info: Option<ErrorInfo>) -> Result<()> {
        let state = self.state();
        if state.is_terminal() {
            debug!("Call {} already in {}, terminate ignored", self.id(), state);
            return Ok(());
        }

        if let Err(e) = self.with_session(|s| s.terminate(error_info.clone())) {
            warn!("Call {}: session could not terminate: {}", self.id(), e);
        }
        self.data_mut().error_info = error_info.unwrap_or_default();
        self.set_state(CallState::End, "Call terminated");
        Ok(())
    }

    /// Redirect an incoming call to another address
    pub fn redirect(&self, target: &SipUri) -> Result<()> {
        let state = self.state();
        if !state.is_incoming_pending() {
            return Err(self.invalid("redirect", state));
        }

        self.with_session(|s| s.redirect(target))?;
        info!("Call {} redirected to {}", self.id(), target);
        self.data_mut().error_info = ErrorInfo::new(Reason::MovedTemporarily);
        self.set_state(CallState::End, "Call redirected");
        Ok(())
    }

    /// Renegotiate the media of the call
    pub fn update(&self, params: Option<MediaParams>) -> Result<()> {
        let state = self.state();
        let target = match state {
            CallState::Connected | CallState::StreamsRunning | CallState::PausedByRemote => {
                CallState::Updating
            }
            CallState::OutgoingRinging
            | CallState::OutgoingEarlyMedia
            | CallState::IncomingEarlyMedia => CallState::EarlyUpdating,
            _ => return Err(self.invalid("update", state)),
        };

        self.with_session(|s| s.update(params.clone()))?;
        if let Some(params) = params {
            self.data_mut().params = params;
        }
        self.set_state(target, "Updating call");
        Ok(())
    }

    /// Keep a remote update pending until `accept_update` is called.
    ///
    /// There is no timeout: the offer stays open until the caller answers it.
    pub fn defer_update(&self) -> Result<()> {
        let state = self.state();
        if !matches!(
            state,
            CallState::UpdatedByRemote | CallState::EarlyUpdatedByRemote
        ) {
            return Err(self.invalid("defer update", state));
        }

        self.with_session(|s| s.defer_update())?;
        self.data_mut().update_deferred = true;
        debug!("Call {}: update deferred", self.id());
        Ok(())
    }

    pub fn pause(&self) -> Result<()> {
        let state = self.state();
        if state != CallState::StreamsRunning {
            return Err(self.invalid("pause", state));
        }

        self.with_session(|s| s.pause())?;
        self.set_state(CallState::Pausing, "Pausing call");
        Ok(())
    }

    pub fn resume(&self) -> Result<()> {
        let state = self.state();
        if state != CallState::Paused {
            return Err(self.invalid("resume", state));
        }

        if let Some(manager) = self.manager() {
            manager.preempt_focus(self);
        }

        self.with_session(|s| s.resume())?;
        self.set_state(CallState::Resuming, "Resuming call");
        Ok(())
    }

    /// Transfer the call to a new address or to another live call
    pub fn transfer(&self, target: TransferTarget) -> Result<()> {
        let state = self.state();
        if !state.is_connected_like() {
            return Err(self.invalid("transfer", state));
        }
        let manager = self.manager().ok_or_else(|| {
            DomainError::InvalidOperation(format!("Call {} has no call manager", self.id()))
        })?;

        match target {
            TransferTarget::Address(address) => {
                // A call that cannot be created leaves this one untouched
                let target_call = manager.prepare_transfer_call(self, &address)?;

                if matches!(state, CallState::StreamsRunning | CallState::Referred) {
                    self.with_session(|s| s.pause())?;
                    self.set_state(CallState::Pausing, "Pausing call before transfer");
                }

                {
                    let mut data = self.data_mut();
                    data.transfer_target = Some(target_call.id());
                    data.refer_to = Some(address.clone());
                }
                manager.launch_transfer_call(&target_call)?;
                info!(
                    "Call {} transferred to {} through new call {}",
                    self.id(),
                    address,
                    target_call.id()
                );
                // Mirroring may have missed states committed during launch
                self.set_transfer_state(target_call.state());
            }
            TransferTarget::Call(other_id) => {
                if other_id == self.id() {
                    return Err(DomainError::InvalidOperation(
                        "A call cannot be transferred to itself".to_string(),
                    ));
                }
                let other = manager
                    .find_call(other_id)
                    .ok_or_else(|| DomainError::NotFound(format!("Call {}", other_id)))?;
                if other.state().is_terminal() {
                    return Err(DomainError::InvalidOperation(format!(
                        "Transfer target call {} is {}",
                        other_id,
                        other.state()
                    )));
                }

                let address = other.remote_address();
                let replaces = other.replaces_token();
                self.with_session(|s| s.refer(&address, replaces.clone()))?;
                info!(
                    "Call {} transferred to existing call {} ({})",
                    self.id(),
                    other_id,
                    address
                );
                {
                    let mut data = self.data_mut();
                    data.transfer_target = Some(other_id);
                    data.refer_to = Some(address);
                }
                other.data_mut().transferer = Some(self.id());
                self.set_transfer_state(CallState::OutgoingInit);
            }
        }
        Ok(())
    }

    pub fn send_dtmf(&self, dtmf: char) -> Result<()> {
        self.check_dtmf_allowed()?;
        if !is_valid_dtmf(dtmf) {
            return Err(DomainError::InvalidOperation(format!(
                "Invalid DTMF digit '{}'",
                dtmf
            )));
        }
        self.with_session(|s| s.send_dtmf(dtmf))
    }

    pub fn send_dtmfs(&self, dtmfs: &str) -> Result<()> {
        self.check_dtmf_allowed()?;
        if dtmfs.is_empty() || !dtmfs.chars().all(is_valid_dtmf) {
            return Err(DomainError::InvalidOperation(format!(
                "Invalid DTMF sequence '{}'",
                dtmfs
            )));
        }
        self.with_session(|s| s.send_dtmfs(dtmfs))
    }

    pub fn cancel_dtmfs(&self) {
        if let Some(session) = self.inner.session.borrow_mut().as_mut() {
            session.cancel_dtmfs();
        }
    }

    pub fn send_info_message(&self, message: &InfoMessage) -> Result<()> {
        let state = self.state();
        if !state.is_connected_like() {
            return Err(self.invalid("send INFO", state));
        }
        self.with_session(|s| s.send_info(message))
    }

    // -------------------------------------------------------------------------
    // Media pass-through

    pub fn start_recording(&self) -> Result<()> {
        if self.data().params.record_file.is_none() {
            return Err(DomainError::InvalidOperation(format!(
                "Call {} has no record file",
                self.id()
            )));
        }
        self.with_session(|s| s.start_recording())
    }

    pub fn stop_recording(&self) {
        if let Some(session) = self.inner.session.borrow_mut().as_mut() {
            session.stop_recording();
        }
    }

    pub fn set_microphone_muted(&self, muted: bool) {
        if let Some(session) = self.inner.session.borrow_mut().as_mut() {
            session.set_microphone_muted(muted);
        }
    }

    pub fn microphone_muted(&self) -> bool {
        self.inner
            .session
            .borrow()
            .as_ref()
            .map(|s| s.microphone_muted())
            .unwrap_or(false)
    }

    pub fn take_video_snapshot(&self, file: &str) -> Result<()> {
        if !self.current_params().video_enabled {
            return Err(DomainError::InvalidOperation(format!(
                "Call {} has no video stream",
                self.id()
            )));
        }
        self.with_session(|s| s.take_video_snapshot(file))
    }

    pub fn stats(&self, stream: StreamType) -> Option<CallStats> {
        self.inner.session.borrow().as_ref()?.stats(stream)
    }

    /// Ask for a single `on_next_video_frame_decoded` notification
    pub fn request_next_video_frame_decoded(&self) {
        self.data_mut().next_video_frame_requested = true;
    }

    // -------------------------------------------------------------------------
    // Session callbacks

    /// The session moved the dialog to a new state
    pub fn on_session_state_changed(&self, state: CallState, message: &str) -> Result<()> {
        let current = self.state();
        if !current.can_transition_to(state) {
            warn!(
                "Call {}: session reported {} while in {}, ignored",
                self.id(),
                state,
                current
            );
            return Err(self.invalid(&format!("enter {}", state), current));
        }

        if state == CallState::Connected && self.direction() == CallDirection::Outgoing {
            if let Some(manager) = self.manager() {
                manager.check_for_acceptation(self);
            }
            let now = self.state();
            if now != current {
                debug!(
                    "Call {} moved to {} during arbitration, {} dropped",
                    self.id(),
                    now,
                    state
                );
                return Ok(());
            }
        }

        match state {
            CallState::UpdatedByRemote | CallState::EarlyUpdatedByRemote => {
                self.data_mut().update_deferred = false;
            }
            CallState::Error => {
                let mut data = self.data_mut();
                if data.error_info.reason == Reason::None {
                    data.error_info = ErrorInfo::new(Reason::Unknown).with_phrase(message);
                }
            }
            _ => {}
        }

        self.set_state(state, message);

        // Remote updates are answered right away unless an observer deferred them
        if matches!(
            state,
            CallState::UpdatedByRemote | CallState::EarlyUpdatedByRemote
        ) && self.state() == state
            && !self.is_update_deferred()
        {
            if let Err(e) = self.accept_update(None) {
                warn!("Call {}: automatic update answer failed: {}", self.id(), e);
            }
        }
        Ok(())
    }

    /// The session could not establish or modify the call
    pub fn on_session_failed(&self, error_info: ErrorInfo) {
        if self.state().is_terminal() {
            return;
        }
        let message = error_info.phrase.clone();
        self.fail(error_info, &message);
    }

    pub fn on_dtmf_received(&self, dtmf: char) {
        debug!("Call {}: DTMF '{}' received", self.id(), dtmf);
        self.notify("dtmf_received", |l| l.on_dtmf_received(self, dtmf));
    }

    pub fn on_encryption_changed(&self, activated: bool, auth_token: Option<&str>) {
        {
            let mut data = self.data_mut();
            data.encrypted = activated;
            data.auth_token = auth_token.map(str::to_string);
        }
        info!(
            "Call {}: encryption {}",
            self.id(),
            if activated { "on" } else { "off" }
        );
        self.notify("encryption_changed", |l| {
            l.on_encryption_changed(self, activated, auth_token)
        });
    }

    pub fn on_stats_updated(&self, stats: &CallStats) {
        self.notify("stats_updated", |l| l.on_stats_updated(self, stats));
    }

    pub fn on_info_received(&self, message: &InfoMessage) {
        self.notify("info_message_received", |l| {
            l.on_info_message_received(self, message)
        });
    }

    pub fn on_ack_being_sent(&self, headers: &Headers) {
        self.notify("ack_processing", |l| l.on_ack_processing(self, headers, false));
    }

    pub fn on_ack_received(&self, headers: &Headers) {
        self.notify("ack_processing", |l| l.on_ack_processing(self, headers, true));
    }

    /// The remote party starts or stops sending its own ringback tone
    pub fn on_ringback_tone_requested(&self, requested: bool) {
        let remote_allowed = self
            .manager()
            .map(|m| m.config().sound.remote_ringback_tone)
            .unwrap_or(true);
        let playing = requested && remote_allowed;
        self.data_mut().playing_ringback_tone = playing;

        if playing && self.state() == CallState::OutgoingRinging {
            if let Some(manager) = self.manager() {
                manager.stop_ringback(self.id());
            }
        }
    }

    /// The remote party asked us to call `target` in its place
    pub fn on_refer_received(&self, target: SipUri) -> Result<()> {
        let state = self.state();
        if !state.is_connected_like() {
            return Err(self.invalid("handle REFER", state));
        }
        info!("Call {} referred to {}", self.id(), target);
        self.data_mut().referred_by_remote = true;
        if state != CallState::Referred {
            self.set_state(CallState::Referred, "Referred");
        }
        self.transfer(TransferTarget::Address(target))
    }

    /// NOTIFY received for a REFER we sent
    pub fn on_transfer_progress(&self, state: CallState) {
        self.set_transfer_state(state);
    }

    pub fn on_first_video_frame_decoded(&self) {
        let requested = std::mem::take(&mut self.data_mut().next_video_frame_requested);
        if requested {
            self.notify("next_video_frame_decoded", |l| {
                l.on_next_video_frame_decoded(self)
            });
        }
    }

    // -------------------------------------------------------------------------
    // Internals

    pub(crate) fn data(&self) -> Ref<'_, CallData> {
        self.inner.data.borrow()
    }

    pub(crate) fn data_mut(&self) -> std::cell::RefMut<'_, CallData> {
        self.inner.data.borrow_mut()
    }

    pub(crate) fn manager(&self) -> Option<CallManager> {
        self.inner.manager.upgrade().map(CallManager::from_shared)
    }

    pub(crate) fn with_session<T>(
        &self,
        f: impl FnOnce(&mut dyn Session) -> Result<T>,
    ) -> Result<T> {
        let mut session = self.inner.session.borrow_mut();
        match session.as_mut() {
            Some(session) => f(session.as_mut()),
            None => Err(DomainError::Session(format!(
                "Call {} has no session",
                self.id()
            ))),
        }
    }

    pub(crate) fn replaces_token(&self) -> Option<String> {
        self.inner.session.borrow().as_ref()?.replaces_token()
    }

    pub(crate) fn audio_inactivity(&self) -> Option<Duration> {
        self.inner.session.borrow().as_ref()?.audio_inactivity()
    }

    fn invalid(&self, operation: &str, state: CallState) -> DomainError {
        DomainError::InvalidStateTransition(format!(
            "Cannot {} call {} in state {}",
            operation,
            self.id(),
            state
        ))
    }

    fn check_dtmf_allowed(&self) -> Result<()> {
        let state = self.state();
        if state.is_connected_like() || state == CallState::OutgoingEarlyMedia {
            Ok(())
        } else {
            Err(self.invalid("send DTMF", state))
        }
    }

    fn fail(&self, error_info: ErrorInfo, message: &str) {
        warn!(
            "Call {} failed: {:?} {} {}",
            self.id(),
            error_info.reason,
            error_info.protocol_code,
            error_info.phrase
        );
        self.data_mut().error_info = error_info;
        self.set_state(CallState::Error, message);
    }

    /// Commit a new state, run arbitration, then notify observers
    pub(crate) fn set_state(&self, new_state: CallState, message: &str) {
        let (prev_state, generation) = {
            let mut data = self.data_mut();
            if data.state == new_state {
                return;
            }
            let prev_state = data.state;
            data.prev_state = prev_state;
            data.state = new_state;
            data.generation += 1;
            match new_state {
                CallState::Connected if data.connected_at.is_none() => {
                    data.connected_at = Some(Utc::now());
                }
                CallState::End | CallState::Error if data.ended_at.is_none() => {
                    data.ended_at = Some(Utc::now());
                }
                _ => {}
            }
            (prev_state, data.generation)
        };

        info!(
            "Call {} state changed: {} -> {} ({})",
            self.id(),
            prev_state,
            new_state,
            message
        );

        let manager = self.manager();
        if let Some(manager) = &manager {
            manager.on_call_state_committed(self, prev_state, new_state);
        }

        self.start_background_task_once();

        let snapshot = self.inner.listeners.borrow().snapshot();
        dispatch(
            &snapshot,
            "state_changed",
            || self.data().generation == generation,
            |l| l.on_state_changed(self, new_state, message),
        );
        if let Some(manager) = &manager {
            manager.notify_call_state_changed(self, new_state, message, generation);
        }

        if new_state == CallState::Released {
            self.release_resources();
        }

        self.mirror_to_transferer(new_state);
    }

    pub(crate) fn generation(&self) -> u64 {
        self.data().generation
    }

    fn notify(&self, event: &str, mut deliver: impl FnMut(&dyn CallListener)) {
        let snapshot = self.inner.listeners.borrow().snapshot();
        dispatch(&snapshot, event, || true, |l| deliver(l));
    }

    fn set_transfer_state(&self, state: CallState) {
        let (changed, referred_by_remote) = {
            let mut data = self.data_mut();
            let changed = data.transfer_state != state;
            data.transfer_state = state;
            (changed, data.referred_by_remote)
        };
        if !changed {
            return;
        }
        debug!("Call {}: transfer state is now {}", self.id(), state);

        if referred_by_remote && !self.state().is_terminal() {
            if let Err(e) = self.with_session(|s| s.notify_refer_state(state)) {
                warn!("Call {}: could not notify transfer progress: {}", self.id(), e);
            }
        }
        self.notify("transfer_state_changed", |l| {
            l.on_transfer_state_changed(self, state)
        });
    }

    fn mirror_to_transferer(&self, state: CallState) {
        let Some(transferer) = self.transferer_call() else {
            return;
        };
        if transferer.transfer_target_id() == Some(self.id()) {
            transferer.set_transfer_state(state);
        }
    }

    fn start_background_task_once(&self) {
        if std::mem::replace(&mut self.data_mut().background_task_requested, true) {
            return;
        }
        let Some(manager) = self.manager() else {
            return;
        };
        match manager.begin_background_task(self.id()) {
            Some(token) => self.data_mut().background_task = Some(token),
            None => warn!(
                "Call {}: no background task available, continuing without it",
                self.id()
            ),
        }
    }

    fn release_resources(&self) {
        let token = self.data_mut().background_task.take();
        if let Some(token) = token {
            if let Some(manager) = self.manager() {
                manager.end_background_task(token);
            }
        }
        let session = self.inner.session.borrow_mut().take();
        drop(session);
        debug!("Call {} released its resources", self.id());
    }
}

impl PartialEq for Call {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Call {}

impl fmt::Debug for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = self.data();
        f.debug_struct("Call")
            .field("id", &self.inner.id)
            .field("direction", &self.inner.direction)
            .field("state", &data.state)
            .field("remote", &data.remote_address.to_string())
            .finish()
    }
}

impl Drop for CallInner {
    fn drop(&mut self) {
        let token = self.data.get_mut().background_task.take();
        if let Some(token) = token {
            warn!("Call {} dropped with a background task, ending it", self.id);
            if let Some(manager) = self.manager.upgrade() {
                CallManager::from_shared(manager).end_background_task(token);
            }
        }
        debug!("Call {} destroyed", self.id);
    }
}

fn is_valid_dtmf(dtmf: char) -> bool {
    matches!(dtmf, '0'..='9' | '*' | '#' | 'A'..='D')
}

/// State restored once an update is answered
fn state_after_update(update_state: CallState, before_update: CallState) -> CallState {
    match (update_state, before_update) {
        (
            CallState::EarlyUpdatedByRemote,
            prev @ (CallState::OutgoingRinging
            | CallState::OutgoingEarlyMedia
            | CallState::IncomingReceived
            | CallState::IncomingEarlyMedia),
        ) => prev,
        (CallState::EarlyUpdatedByRemote, _) => CallState::Connected,
        (_, prev @ (CallState::Paused | CallState::PausedByRemote)) => prev,
        _ => CallState::StreamsRunning,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::domain::call::event::EventLog;
    use crate::domain::call::session::{MockSession, MockSessionFactory};
    use crate::infrastructure::background::LocalBackgroundTasks;
    use crate::infrastructure::devices::LocalHardware;

    fn manager() -> CallManager {
        CallManager::new(
            Config::default(),
            SipUri::parse("sip:me@example.com").unwrap(),
            Box::new(LocalHardware::new()),
            Box::new(LocalBackgroundTasks::new()),
            Box::new(MockSessionFactory::new()),
        )
    }

    fn permissive_session() -> MockSession {
        let mut session = MockSession::new();
        session.expect_initiate_incoming().return_const(());
        session.expect_accept().returning(|_| Ok(()));
        session.expect_accept_early_media().returning(|_| Ok(()));
        session.expect_accept_update().returning(|_| Ok(()));
        session.expect_decline().returning(|_| Ok(()));
        session.expect_terminate().returning(|_| Ok(()));
        session.expect_update().returning(|_| Ok(()));
        session.expect_defer_update().returning(|| Ok(()));
        session.expect_pause().returning(|| Ok(()));
        session.expect_resume().returning(|| Ok(()));
        session.expect_send_dtmf().returning(|_| Ok(()));
        session.expect_send_dtmfs().returning(|_| Ok(()));
        session.expect_current_params().returning(|| None);
        session
    }

    fn incoming(manager: &CallManager, session: MockSession) -> Call {
        manager
            .handle_incoming(
                Box::new(session),
                &SipUri::parse("sip:alice@example.com").unwrap(),
                &SipUri::parse("sip:me@example.com").unwrap(),
                None,
            )
            .unwrap()
    }

    #[test]
    fn test_incoming_call_lifecycle() {
        let manager = manager();
        let call = incoming(&manager, permissive_session());
        let log = Rc::new(EventLog::new());
        call.add_listener(log.clone());

        assert_eq!(call.state(), CallState::IncomingReceived);
        assert_eq!(call.direction(), CallDirection::Incoming);

        call.accept(None).unwrap();
        assert_eq!(call.state(), CallState::Connected);
        assert!(call.connected_at().is_some());

        call.on_session_state_changed(CallState::StreamsRunning, "Streams running")
            .unwrap();
        call.pause().unwrap();
        assert_eq!(call.state(), CallState::Pausing);
        call.on_session_state_changed(CallState::Paused, "Paused")
            .unwrap();
        call.resume().unwrap();
        assert_eq!(call.state(), CallState::Resuming);
        call.on_session_state_changed(CallState::StreamsRunning, "Resumed")
            .unwrap();

        call.terminate(None).unwrap();
        assert_eq!(call.state(), CallState::End);
        assert!(call.ended_at().is_some());

        assert_eq!(
            log.states_for(call.id()),
            vec![
                CallState::Connected,
                CallState::StreamsRunning,
                CallState::Pausing,
                CallState::Paused,
                CallState::Resuming,
                CallState::StreamsRunning,
                CallState::End,
            ]
        );
    }

    #[test]
    fn test_accept_rejected_when_not_incoming() {
        let manager = manager();
        let call = incoming(&manager, permissive_session());
        call.accept(None).unwrap();

        let result = call.accept(None);
        assert!(matches!(result, Err(DomainError::InvalidStateTransition(_))));
        assert_eq!(call.state(), CallState::Connected);
    }

    #[test]
    fn test_session_refusing_accept_leaves_state() {
        let manager = manager();
        let mut session = MockSession::new();
        session.expect_initiate_incoming().return_const(());
        session
            .expect_accept()
            .returning(|_| Err(DomainError::Session("no codec".to_string())));
        let call = incoming(&manager, session);

        assert!(call.accept(None).is_err());
        assert_eq!(call.state(), CallState::IncomingReceived);
    }

    #[test]
    fn test_terminate_is_idempotent() {
        let manager = manager();
        let mut session = MockSession::new();
        session.expect_initiate_incoming().return_const(());
        session.expect_terminate().times(1).returning(|_| Ok(()));
        let call = incoming(&manager, session);

        call.terminate(Some(ErrorInfo::new(Reason::Busy))).unwrap();
        call.terminate(None).unwrap();
        call.decline(Reason::Declined).unwrap();

        assert_eq!(call.state(), CallState::End);
        assert_eq!(call.reason(), Reason::Busy);
    }

    #[test]
    fn test_transfer_keeps_call_when_target_cannot_be_created() {
        let mut factory = MockSessionFactory::new();
        factory
            .expect_create_outgoing()
            .returning(|_, _, _| Err(DomainError::Session("no transport".to_string())));
        let manager = CallManager::new(
            Config::default(),
            SipUri::parse("sip:me@example.com").unwrap(),
            Box::new(LocalHardware::new()),
            Box::new(LocalBackgroundTasks::new()),
            Box::new(factory),
        );

        // No pause expectation: the session must not be touched
        let mut session = MockSession::new();
        session.expect_initiate_incoming().return_const(());
        session.expect_accept().returning(|_| Ok(()));
        session.expect_current_params().returning(|| None);
        let call = incoming(&manager, session);
        call.accept(None).unwrap();
        call.on_session_state_changed(CallState::StreamsRunning, "Streams running")
            .unwrap();

        let result = call.transfer(TransferTarget::Address(
            SipUri::parse("sip:bob@example.com").unwrap(),
        ));
        assert!(matches!(result, Err(DomainError::Session(_))));
        assert_eq!(call.state(), CallState::StreamsRunning);
        assert_eq!(call.transfer_target_id(), None);
        assert_eq!(manager.call_count(), 1);
    }

    #[test]
    fn test_decline_sets_reason() {
        let manager = manager();
        let call = incoming(&manager, permissive_session());

        call.decline(Reason::DoNotDisturb).unwrap();
        assert_eq!(call.state(), CallState::End);
        assert_eq!(call.error_info().protocol_code, 600);
    }

    #[test]
    fn test_pause_rejected_outside_streams_running() {
        let manager = manager();
        let call = incoming(&manager, permissive_session());

        assert!(call.pause().is_err());
        assert!(call.resume().is_err());
        assert_eq!(call.state(), CallState::IncomingReceived);
    }

    #[test]
    fn test_remote_update_is_answered_automatically() {
        let manager = manager();
        let call = incoming(&manager, permissive_session());
        call.accept(None).unwrap();
        call.on_session_state_changed(CallState::StreamsRunning, "Streams running")
            .unwrap();

        call.on_session_state_changed(CallState::UpdatedByRemote, "Updated by remote")
            .unwrap();
        assert_eq!(call.state(), CallState::StreamsRunning);
    }

    struct Deferring;

    impl CallListener for Deferring {
        fn on_state_changed(&self, call: &Call, state: CallState, _message: &str) {
            if state == CallState::UpdatedByRemote {
                call.defer_update().unwrap();
            }
        }
    }

    #[test]
    fn test_deferred_update_stays_pending() {
        let manager = manager();
        let call = incoming(&manager, permissive_session());
        call.add_listener(Rc::new(Deferring));
        call.accept(None).unwrap();
        call.on_session_state_changed(CallState::StreamsRunning, "Streams running")
            .unwrap();

        call.on_session_state_changed(CallState::UpdatedByRemote, "Updated by remote")
            .unwrap();
        assert_eq!(call.state(), CallState::UpdatedByRemote);
        assert!(call.is_update_deferred());

        call.accept_update(None).unwrap();
        assert_eq!(call.state(), CallState::StreamsRunning);
        assert!(!call.is_update_deferred());
    }

    #[test]
    fn test_invalid_session_transition_is_rejected() {
        let manager = manager();
        let call = incoming(&manager, permissive_session());

        let result = call.on_session_state_changed(CallState::OutgoingRinging, "Ringing");
        assert!(result.is_err());
        assert_eq!(call.state(), CallState::IncomingReceived);
    }

    #[test]
    fn test_session_failure_sets_error() {
        let manager = manager();
        let call = incoming(&manager, permissive_session());
        call.accept(None).unwrap();

        call.on_session_failed(ErrorInfo::new(Reason::NotAcceptable));
        assert_eq!(call.state(), CallState::Error);
        assert_eq!(call.reason(), Reason::NotAcceptable);

        // Late failures do not overwrite the first one
        call.on_session_failed(ErrorInfo::new(Reason::IoError));
        assert_eq!(call.reason(), Reason::NotAcceptable);
    }

    #[test]
    fn test_dtmf_validation() {
        let manager = manager();
        let call = incoming(&manager, permissive_session());
        assert!(call.send_dtmf('1').is_err());

        call.accept(None).unwrap();
        call.send_dtmf('#').unwrap();
        call.send_dtmfs("123A*").unwrap();
        assert!(call.send_dtmf('x').is_err());
        assert!(call.send_dtmfs("12z").is_err());
    }

    #[test]
    fn test_next_video_frame_notified_once() {
        let manager = manager();
        let call = incoming(&manager, permissive_session());
        let log = Rc::new(EventLog::new());
        call.add_listener(log.clone());

        call.on_first_video_frame_decoded();
        assert!(log.is_empty());

        call.request_next_video_frame_decoded();
        call.on_first_video_frame_decoded();
        call.on_first_video_frame_decoded();
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn test_state_after_update() {
        assert_eq!(
            state_after_update(CallState::UpdatedByRemote, CallState::StreamsRunning),
            CallState::StreamsRunning
        );
        assert_eq!(
            state_after_update(CallState::UpdatedByRemote, CallState::PausedByRemote),
            CallState::PausedByRemote
        );
        assert_eq!(
            state_after_update(CallState::EarlyUpdatedByRemote, CallState::IncomingEarlyMedia),
            CallState::IncomingEarlyMedia
        );
    }
}
