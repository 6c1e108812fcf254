//! Call registry and cross-call arbitration
//!
//! The `CallManager` owns every live call and the device-wide singletons
//! (ring card, media focus, background tasks). Calls report each committed
//! state change here before their observers hear about it, so the policies
//! below always run on a consistent registry:
//!
//! - the current call is the one holding the media focus
//! - accepting a call cancels every unanswered outgoing attempt
//! - the ring tone plays while at least one call is ringable
//! - shared bandwidth state is reset once the registry is empty

use crate::config::Config;
use crate::domain::call::aggregate::Call;
use crate::domain::call::listener::{dispatch, CoreListener, ListenerSet};
use crate::domain::call::session::{Session, SessionFactory};
use crate::domain::call::timer::Tick;
use crate::domain::call::value_object::{
    CallDirection, CallState, ErrorInfo, MediaParams, Reason, Tone,
};
use crate::domain::platform::{BackgroundTaskService, BackgroundTaskToken, HardwareController};
use crate::domain::shared::error::DomainError;
use crate::domain::shared::result::Result;
use crate::domain::shared::value_objects::{CallId, SipUri};
use crate::infrastructure::metrics;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::rc::Rc;
use tracing::{debug, info, warn};

/// Snapshot of the registry for monitoring
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallStatistics {
    pub total_active_calls: usize,
    pub incoming_calls: usize,
    pub outgoing_calls: usize,
    pub calls_ringing: usize,
    pub calls_paused: usize,
    pub calls_in_conference: usize,
    pub longest_call_seconds: u64,
    pub current_call: Option<CallId>,
}

/// Process-wide owner of the live calls
#[derive(Clone)]
pub struct CallManager {
    shared: Rc<ManagerShared>,
}

pub(crate) struct ManagerShared {
    config: Config,
    identity: SipUri,
    registry: RefCell<CallRegistry>,
    hardware: RefCell<Box<dyn HardwareController>>,
    background: Box<dyn BackgroundTaskService>,
    session_factory: Box<dyn SessionFactory>,
    listeners: RefCell<ListenerSet<dyn CoreListener>>,
}

#[derive(Default)]
struct CallRegistry {
    /// Live calls in creation order
    calls: Vec<Call>,
    current: Option<CallId>,
    /// Ended calls waiting for their `Released` notification
    pending_release: Vec<Call>,
}

impl CallManager {
    pub fn new(
        config: Config,
        identity: SipUri,
        hardware: Box<dyn HardwareController>,
        background: Box<dyn BackgroundTaskService>,
        session_factory: Box<dyn SessionFactory>,
    ) -> Self {
        info!(
            "Call manager for {} (max {} calls, ring timeout {}s)",
            identity, config.calls.max_calls, config.calls.incoming_timeout_secs
        );
        Self {
            shared: Rc::new(ManagerShared {
                config,
                identity,
                registry: RefCell::new(CallRegistry::default()),
                hardware: RefCell::new(hardware),
                background,
                session_factory,
                listeners: RefCell::new(ListenerSet::new()),
            }),
        }
    }

    pub(crate) fn from_shared(shared: Rc<ManagerShared>) -> Self {
        Self { shared }
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Local address used for outgoing calls
    pub fn identity(&self) -> &SipUri {
        &self.shared.identity
    }

    // -------------------------------------------------------------------------
    // Call creation

    /// Place a new outgoing call
    pub fn invite(&self, to: &SipUri, params: Option<MediaParams>) -> Result<Call> {
        self.create_outgoing(to, params.unwrap_or_default(), None)
    }

    /// Register a call for an INVITE received by the signaling layer.
    ///
    /// When the registry is full the call is declined with `Busy` right away
    /// and returned in `End`.
    pub fn handle_incoming(
        &self,
        mut session: Box<dyn Session>,
        from: &SipUri,
        to: &SipUri,
        replaces: Option<CallId>,
    ) -> Result<Call> {
        let replaced = match replaces {
            Some(id) => match self.find_call(id) {
                Some(call) => Some(call),
                None => {
                    warn!(
                        "Incoming call from {} replaces unknown call {}, declining",
                        from, id
                    );
                    if let Err(e) = session.decline(&ErrorInfo::new(Reason::NotFound)) {
                        warn!("Could not decline incoming call from {}: {}", from, e);
                    }
                    return Err(DomainError::NotFound(format!("Replaced call {}", id)));
                }
            },
            None => None,
        };
        let full = self.call_count() >= self.shared.config.calls.max_calls;

        let call = Call::new(
            Rc::downgrade(&self.shared),
            CallDirection::Incoming,
            to.clone(),
            from.clone(),
            MediaParams::default(),
            session,
        );
        if let Some(replaced) = &replaced {
            call.data_mut().replaced_call = Some(replaced.id());
        }
        self.register(&call);
        call.initiate_incoming()?;

        if full {
            warn!(
                "Too many calls, declining incoming call {} from {}",
                call.id(),
                from
            );
            call.decline(Reason::Busy)?;
            return Ok(call);
        }

        call.start_incoming_notification()?;
        Ok(call)
    }

    fn create_outgoing(
        &self,
        to: &SipUri,
        params: MediaParams,
        transferer: Option<CallId>,
    ) -> Result<Call> {
        let call = self.prepare_outgoing(to, params, transferer)?;
        self.launch_outgoing(&call)?;
        Ok(call)
    }

    /// Build an outgoing call without registering or starting it.
    ///
    /// Nothing observable happens when this fails.
    fn prepare_outgoing(
        &self,
        to: &SipUri,
        params: MediaParams,
        transferer: Option<CallId>,
    ) -> Result<Call> {
        let max_calls = self.shared.config.calls.max_calls;
        if self.call_count() >= max_calls {
            return Err(DomainError::ResourceUnavailable(format!(
                "Maximum number of calls ({}) reached",
                max_calls
            )));
        }

        let session =
            self.shared
                .session_factory
                .create_outgoing(&self.shared.identity, to, &params)?;
        let call = Call::new(
            Rc::downgrade(&self.shared),
            CallDirection::Outgoing,
            self.shared.identity.clone(),
            to.clone(),
            params,
            session,
        );
        call.data_mut().transferer = transferer;
        Ok(call)
    }

    /// Register a prepared call, hand it the media focus and send the INVITE
    fn launch_outgoing(&self, call: &Call) -> Result<()> {
        self.register(call);
        self.preempt_focus(call);
        call.initiate_outgoing()
    }

    /// Prepare the call that carries out a blind transfer of `transferer`
    pub(crate) fn prepare_transfer_call(&self, transferer: &Call, to: &SipUri) -> Result<Call> {
        self.prepare_outgoing(to, transferer.params(), Some(transferer.id()))
    }

    pub(crate) fn launch_transfer_call(&self, call: &Call) -> Result<()> {
        self.launch_outgoing(call)
    }

    fn register(&self, call: &Call) {
        let count = {
            let mut registry = self.shared.registry.borrow_mut();
            registry.calls.push(call.clone());
            registry.calls.len()
        };
        debug!("Call {} registered, {} live calls", call.id(), count);
        metrics::record_call_created(call.direction());
        metrics::update_live_calls(count);

        let snapshot = self.shared.listeners.borrow().snapshot();
        dispatch(&snapshot, "call_created", || true, |l| l.on_call_created(call));
    }

    // -------------------------------------------------------------------------
    // Registry queries

    /// Live calls in creation order
    pub fn calls(&self) -> Vec<Call> {
        self.shared.registry.borrow().calls.clone()
    }

    pub fn call_count(&self) -> usize {
        self.shared.registry.borrow().calls.len()
    }

    /// Find a live call, or an ended one that has not been released yet
    pub fn find_call(&self, id: CallId) -> Option<Call> {
        let registry = self.shared.registry.borrow();
        registry
            .calls
            .iter()
            .chain(registry.pending_release.iter())
            .find(|c| c.id() == id)
            .cloned()
    }

    pub fn current_call(&self) -> Option<Call> {
        let registry = self.shared.registry.borrow();
        let current = registry.current?;
        registry.calls.iter().find(|c| c.id() == current).cloned()
    }

    pub fn is_in_call(&self) -> bool {
        self.shared.registry.borrow().current.is_some()
    }

    pub fn statistics(&self) -> CallStatistics {
        let calls = self.calls();
        let ring_during_early_media = self.shared.config.sound.ring_during_incoming_early_media;

        let mut stats = CallStatistics {
            total_active_calls: calls.len(),
            current_call: self.shared.registry.borrow().current,
            ..Default::default()
        };
        for call in &calls {
            let state = call.state();
            match call.direction() {
                CallDirection::Incoming => stats.incoming_calls += 1,
                CallDirection::Outgoing => stats.outgoing_calls += 1,
            }
            if state.is_ringable(ring_during_early_media) {
                stats.calls_ringing += 1;
            }
            if matches!(state, CallState::Paused | CallState::PausedByRemote) {
                stats.calls_paused += 1;
            }
            if call.is_in_conference() {
                stats.calls_in_conference += 1;
            }
            stats.longest_call_seconds = stats.longest_call_seconds.max(call.duration().as_secs());
        }
        stats
    }

    // -------------------------------------------------------------------------
    // Host loop entry points

    /// Advance every call by one tick.
    ///
    /// Calls that ended during the previous tick are released first.
    pub fn iterate(&self, tick: Tick) {
        let released = std::mem::take(&mut self.shared.registry.borrow_mut().pending_release);
        for call in &released {
            call.set_state(CallState::Released, "Call released");
        }
        drop(released);

        for call in self.calls() {
            call.iterate(tick, &self.shared.config.calls);
        }
        metrics::update_live_calls(self.call_count());
    }

    pub fn terminate_all_calls(&self) {
        for call in self.calls() {
            if let Err(e) = call.terminate(None) {
                warn!("Could not terminate call {}: {}", call.id(), e);
            }
        }
    }

    pub fn add_listener(&self, listener: Rc<dyn CoreListener>) {
        self.shared.listeners.borrow_mut().add(listener);
    }

    pub fn remove_listener(&self, listener: &Rc<dyn CoreListener>) -> bool {
        self.shared.listeners.borrow_mut().remove(listener)
    }

    // -------------------------------------------------------------------------
    // Arbitration, driven by the calls

    /// Terminate every unanswered outgoing attempt other than `call`
    pub(crate) fn check_for_acceptation(&self, call: &Call) {
        for other in self.calls() {
            if other == *call || !other.state().is_outgoing_pending() {
                continue;
            }
            info!(
                "Call {} is being accepted, terminating outgoing call {}",
                call.id(),
                other.id()
            );
            if let Err(e) = other.terminate(None) {
                warn!("Could not terminate call {}: {}", other.id(), e);
            }
        }
    }

    /// Hand the media focus to `call`, pausing the current call first
    pub(crate) fn preempt_focus(&self, call: &Call) {
        if let Some(current) = self.current_call() {
            if current != *call && current.state() == CallState::StreamsRunning {
                info!(
                    "Pausing current call {} to give focus to call {}",
                    current.id(),
                    call.id()
                );
                if let Err(e) = current.pause() {
                    warn!("Could not pause call {}: {}", current.id(), e);
                }
            }
        }

        {
            let mut registry = self.shared.registry.borrow_mut();
            if registry.current != Some(call.id()) {
                registry.current = None;
            }
        }

        if let Err(e) = self.shared.hardware.borrow_mut().preempt_focus(call.id()) {
            warn!("Call {}: could not take media focus: {}", call.id(), e);
        }
    }

    /// Registry side effects of a committed state change
    pub(crate) fn on_call_state_committed(&self, call: &Call, prev: CallState, new: CallState) {
        let id = call.id();

        match new {
            CallState::StreamsRunning => {
                let became_current = {
                    let mut registry = self.shared.registry.borrow_mut();
                    let present = registry.calls.iter().any(|c| c.id() == id);
                    if registry.current.is_none() && present {
                        registry.current = Some(id);
                        true
                    } else {
                        false
                    }
                };
                if became_current {
                    debug!("Call {} is now the current call", id);
                    let mut hardware = self.shared.hardware.borrow_mut();
                    if hardware.focused_call() != Some(id) {
                        if let Err(e) = hardware.preempt_focus(id) {
                            warn!("Call {}: could not take media focus: {}", id, e);
                        }
                    }
                }
            }
            CallState::Pausing | CallState::Paused => {
                let mut registry = self.shared.registry.borrow_mut();
                if registry.current == Some(id) {
                    registry.current = None;
                }
            }
            CallState::End | CallState::Error | CallState::Released => {
                self.on_call_set_terminated(call, new);
            }
            _ => {}
        }

        if new == CallState::OutgoingRinging && !call.is_playing_ringback_tone() {
            if let Err(e) = self.shared.hardware.borrow_mut().start_ringback(id) {
                warn!("Call {}: could not start ringback tone: {}", id, e);
            }
        } else if prev == CallState::OutgoingRinging {
            self.stop_ringback(id);
        }

        self.reevaluate_ringing();
    }

    fn on_call_set_terminated(&self, call: &Call, state: CallState) {
        let id = call.id();
        let (was_current, remaining) = {
            let mut registry = self.shared.registry.borrow_mut();
            let removed = registry
                .calls
                .iter()
                .position(|c| c.id() == id)
                .map(|index| registry.calls.remove(index));
            if state == CallState::Released {
                registry.pending_release.retain(|c| c.id() != id);
            } else if let Some(removed) = removed {
                registry.pending_release.push(removed);
            }
            let was_current = registry.current == Some(id);
            if was_current {
                registry.current = None;
            }
            (was_current, registry.calls.len())
        };

        if was_current {
            debug!("Current call {} terminated", id);
        }
        {
            let mut hardware = self.shared.hardware.borrow_mut();
            if hardware.focused_call() == Some(id) {
                hardware.release_focus(id);
            }
            hardware.stop_ringback(id);
            if remaining == 0 {
                debug!("No call left, resetting bandwidth");
                hardware.reset_bandwidth();
            }
        }

        if state != CallState::Released {
            let reason = call.reason();
            metrics::record_call_terminated(reason, call.duration());
            if state == CallState::Error {
                if let Some(tone) = Tone::for_reason(reason) {
                    self.play_tone(tone);
                }
            }
        }
        metrics::update_live_calls(remaining);
    }

    /// Start or stop the ring tone to match the ringable calls
    fn reevaluate_ringing(&self) {
        let ring_during_early_media = self.shared.config.sound.ring_during_incoming_early_media;
        let should_ring = self
            .calls()
            .iter()
            .any(|c| c.state().is_ringable(ring_during_early_media));

        let mut hardware = self.shared.hardware.borrow_mut();
        if should_ring && !hardware.is_ringing() {
            if let Err(e) = hardware.start_ringing() {
                warn!("Could not start ringing: {}", e);
            }
        } else if !should_ring && hardware.is_ringing() {
            hardware.stop_ringing();
        }
    }

    pub(crate) fn stop_ringback(&self, call: CallId) {
        self.shared.hardware.borrow_mut().stop_ringback(call);
    }

    pub(crate) fn play_tone(&self, tone: Tone) {
        debug!("Playing {:?} tone", tone);
        self.shared.hardware.borrow_mut().play_tone(tone);
    }

    pub(crate) fn begin_background_task(&self, call: CallId) -> Option<BackgroundTaskToken> {
        self.shared
            .background
            .begin(&format!("call notification {}", call))
    }

    pub(crate) fn end_background_task(&self, token: BackgroundTaskToken) {
        self.shared.background.end(token);
    }

    pub(crate) fn notify_call_state_changed(
        &self,
        call: &Call,
        state: CallState,
        message: &str,
        generation: u64,
    ) {
        let snapshot = self.shared.listeners.borrow().snapshot();
        dispatch(
            &snapshot,
            "call_state_changed",
            || call.generation() == generation,
            |l| l.on_call_state_changed(call, state, message),
        );
    }
}

impl Drop for ManagerShared {
    fn drop(&mut self) {
        // Calls cannot reach the manager any more, end their leases here
        let registry = std::mem::take(self.registry.get_mut());
        for call in registry.calls.iter().chain(registry.pending_release.iter()) {
            let token = call.data_mut().background_task.take();
            if let Some(token) = token {
                debug!(
                    "Call manager dropped, ending background task of call {}",
                    call.id()
                );
                self.background.end(token);
            }
        }
    }
}
