//! End-to-end call scenarios driven through the loopback session

use callplane::config::Config;
use callplane::domain::call::{
    Call, CallListener, CallState, CoreListener, ErrorInfo, EventLog, Reason, Tick, Tone,
    TransferTarget,
};
use callplane::domain::call_manager::CallManager;
use callplane::domain::platform::HardwareController;
use callplane::domain::shared::value_objects::SipUri;
use callplane::infrastructure::{
    run_host_loop, LocalBackgroundTasks, LocalHardware, LoopbackProbe, LoopbackSession,
    LoopbackSessionFactory, SessionCommand,
};
use callplane::DomainError;
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

struct Harness {
    manager: CallManager,
    hardware: LocalHardware,
    background: LocalBackgroundTasks,
    probe: LoopbackProbe,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(Config::default())
    }

    fn with_config(config: Config) -> Self {
        let hardware = LocalHardware::new();
        let background = LocalBackgroundTasks::new();
        let probe = LoopbackProbe::new();
        let manager = CallManager::new(
            config,
            uri("me"),
            Box::new(hardware.clone()),
            Box::new(background.clone()),
            Box::new(LoopbackSessionFactory::new(probe.clone())),
        );
        Self {
            manager,
            hardware,
            background,
            probe,
        }
    }

    fn incoming(&self, user: &str) -> Call {
        self.incoming_replacing(user, None)
    }

    fn incoming_replacing(&self, user: &str, replaces: Option<&Call>) -> Call {
        self.manager
            .handle_incoming(
                Box::new(LoopbackSession::new(self.probe.clone())),
                &uri(user),
                self.manager.identity(),
                replaces.map(|c| c.id()),
            )
            .unwrap()
    }

    fn running_incoming(&self, user: &str) -> Call {
        let call = self.incoming(user);
        call.accept(None).unwrap();
        call.on_session_state_changed(CallState::StreamsRunning, "Streams running")
            .unwrap();
        call
    }

    fn ringing_outgoing(&self, user: &str) -> Call {
        let call = self.manager.invite(&uri(user), None).unwrap();
        call.on_session_state_changed(CallState::OutgoingRinging, "Ringing")
            .unwrap();
        call
    }

    fn seconds(&self, count: usize) {
        for _ in 0..count {
            self.manager.iterate(Tick::second());
            self.assert_invariants();
        }
    }

    fn assert_invariants(&self) {
        let calls = self.manager.calls();
        if let Some(current) = self.manager.current_call() {
            assert!(calls.contains(&current));
            assert!(!current.state().is_terminal());
        }

        let ring_during_early_media = self
            .manager
            .config()
            .sound
            .ring_during_incoming_early_media;
        let ringable = calls
            .iter()
            .any(|c| c.state().is_ringable(ring_during_early_media));
        assert_eq!(self.hardware.is_ringing(), ringable);
    }
}

fn uri(user: &str) -> SipUri {
    SipUri::new(user, "example.com", None)
}

#[test]
fn test_unanswered_call_is_declined() {
    let h = Harness::new();
    let call = h.incoming("alice");
    assert!(h.hardware.is_ringing());

    h.seconds(30);
    assert_eq!(call.state(), CallState::IncomingReceived);

    h.seconds(1);
    assert_eq!(call.state(), CallState::End);
    assert_eq!(call.reason(), Reason::Declined);
    assert!(!h.hardware.is_ringing());
    assert!(h
        .probe
        .commands()
        .contains(&SessionCommand::Decline(ErrorInfo::new(Reason::Declined))));
}

#[test]
fn test_unanswered_call_is_busy_when_in_call() {
    let h = Harness::new();
    let active = h.running_incoming("alice");
    assert_eq!(h.manager.current_call(), Some(active.clone()));

    let call = h.incoming("bob");
    h.seconds(31);

    assert_eq!(call.state(), CallState::End);
    assert_eq!(call.reason(), Reason::Busy);
    assert_eq!(active.state(), CallState::StreamsRunning);
}

#[test]
fn test_incoming_calls_time_out_independently() {
    let h = Harness::new();
    let first = h.incoming("alice");
    h.seconds(10);
    let second = h.incoming("bob");

    h.seconds(21);
    assert_eq!(first.state(), CallState::End);
    assert_eq!(second.state(), CallState::IncomingReceived);
    assert!(h.hardware.is_ringing());

    h.seconds(10);
    assert_eq!(second.state(), CallState::End);
    assert!(!h.hardware.is_ringing());
}

#[test]
fn test_lost_media_terminates_call() {
    let h = Harness::new();
    let call = h.running_incoming("alice");

    h.probe.set_audio_inactivity(Some(Duration::from_secs(10)));
    h.seconds(1);
    assert_eq!(call.state(), CallState::StreamsRunning);

    h.probe.set_audio_inactivity(Some(Duration::from_secs(31)));
    h.seconds(1);
    assert_eq!(call.state(), CallState::End);
    assert_eq!(call.reason(), Reason::IoError);
    assert_eq!(h.hardware.tones(), vec![Tone::CallLost]);
    assert!(h.manager.current_call().is_none());
}

#[test]
fn test_answered_outgoing_call_cancels_other_attempts() {
    let h = Harness::new();
    let first = h.ringing_outgoing("alice");
    let second = h.ringing_outgoing("bob");
    assert_eq!(h.hardware.ringback_calls().len(), 2);

    second
        .on_session_state_changed(CallState::Connected, "Connected")
        .unwrap();
    assert_eq!(first.state(), CallState::End);
    assert!(h.manager.current_call().is_none());
    assert!(h.hardware.ringback_calls().is_empty());

    second
        .on_session_state_changed(CallState::StreamsRunning, "Streams running")
        .unwrap();
    assert_eq!(h.manager.current_call(), Some(second));
    h.assert_invariants();
}

#[test]
fn test_accepting_incoming_cancels_outgoing_attempts() {
    let h = Harness::new();
    let outgoing = h.ringing_outgoing("alice");
    let incoming = h.incoming("bob");

    incoming.accept(None).unwrap();
    assert_eq!(outgoing.state(), CallState::End);
    assert_eq!(incoming.state(), CallState::Connected);
}

#[test]
fn test_blind_transfer_creates_linked_call() {
    let h = Harness::new();
    let a = h.running_incoming("alice");

    a.transfer(TransferTarget::Address(uri("bob"))).unwrap();
    assert_eq!(a.state(), CallState::Pausing);

    let b = a.transfer_target_call().unwrap();
    assert_eq!(b.transferer_call(), Some(a.clone()));
    assert_eq!(b.remote_address(), uri("bob"));
    assert_eq!(a.transfer_state(), CallState::OutgoingInit);

    b.on_session_state_changed(CallState::OutgoingRinging, "Ringing")
        .unwrap();
    assert_eq!(a.transfer_state(), CallState::OutgoingRinging);

    b.terminate(None).unwrap();
    assert_eq!(a.transfer_state(), CallState::End);
    assert!(!a.state().is_terminal());

    h.seconds(1);
    assert_eq!(b.state(), CallState::Released);
    assert_eq!(a.state(), CallState::Pausing);
}

#[test]
fn test_failed_blind_transfer_leaves_call_running() {
    let mut config = Config::default();
    config.calls.max_calls = 1;
    let h = Harness::with_config(config);
    let a = h.running_incoming("alice");

    let result = a.transfer(TransferTarget::Address(uri("bob")));
    assert!(matches!(result, Err(DomainError::ResourceUnavailable(_))));
    assert_eq!(a.state(), CallState::StreamsRunning);
    assert!(a.transfer_target_call().is_none());
    assert_eq!(a.transfer_state(), CallState::Idle);
    assert!(!h.probe.commands().contains(&SessionCommand::Pause));
    assert_eq!(h.manager.current_call(), Some(a.clone()));
    assert_eq!(h.manager.call_count(), 1);
}

#[test]
fn test_outgoing_call_takes_focus_from_current() {
    let h = Harness::new();
    let a = h.running_incoming("alice");
    assert_eq!(h.hardware.focused_call(), Some(a.id()));

    let b = h.manager.invite(&uri("bob"), None).unwrap();
    assert_eq!(a.state(), CallState::Pausing);
    assert!(h.manager.current_call().is_none());
    assert_eq!(h.hardware.focused_call(), Some(b.id()));

    a.on_session_state_changed(CallState::Paused, "Call paused")
        .unwrap();
    b.on_session_state_changed(CallState::Connected, "Connected")
        .unwrap();
    b.on_session_state_changed(CallState::StreamsRunning, "Streams running")
        .unwrap();

    assert_eq!(a.state(), CallState::Paused);
    assert_eq!(h.manager.current_call(), Some(b.clone()));
    assert_eq!(h.hardware.focused_call(), Some(b.id()));
    h.assert_invariants();
}

#[test]
fn test_attended_transfer_sends_refer_with_replaces() {
    let h = Harness::new();
    let a = h.running_incoming("alice");
    let c = h.running_incoming("carol");

    a.transfer(TransferTarget::Call(c.id())).unwrap();
    assert_eq!(a.transfer_target_call(), Some(c.clone()));
    assert_eq!(c.transferer_call(), Some(a.clone()));

    let refer = h.probe.commands().into_iter().find_map(|cmd| match cmd {
        SessionCommand::Refer { target, replaces } => Some((target, replaces)),
        _ => None,
    });
    let (target, replaces) = refer.unwrap();
    assert_eq!(target, uri("carol"));
    assert!(replaces.is_some());

    assert!(a.transfer(TransferTarget::Call(a.id())).is_err());
}

#[test]
fn test_referred_call_reports_progress() {
    let h = Harness::new();
    let a = h.running_incoming("alice");
    let log = Rc::new(EventLog::new());
    a.add_listener(log.clone());

    a.on_refer_received(uri("bob")).unwrap();
    assert_eq!(
        log.states_for(a.id()),
        vec![CallState::Referred, CallState::Pausing]
    );

    let b = a.transfer_target_call().unwrap();
    b.on_session_state_changed(CallState::Connected, "Connected")
        .unwrap();

    let notified: Vec<CallState> = h
        .probe
        .commands()
        .into_iter()
        .filter_map(|cmd| match cmd {
            SessionCommand::NotifyRefer(state) => Some(state),
            _ => None,
        })
        .collect();
    assert_eq!(notified, vec![CallState::OutgoingInit, CallState::Connected]);
}

#[test]
fn test_replacing_call_terminates_replaced_one() {
    let h = Harness::new();
    let old = h.running_incoming("alice");

    let new = h.incoming_replacing("alice", Some(&old));
    assert_eq!(new.replaced_call(), Some(old.clone()));

    new.accept(None).unwrap();
    assert_eq!(old.state(), CallState::End);
    assert_eq!(new.state(), CallState::Connected);
}

#[test]
fn test_terminate_is_idempotent() {
    let h = Harness::new();
    let call = h.running_incoming("alice");

    call.terminate(None).unwrap();
    call.terminate(Some(ErrorInfo::new(Reason::Busy))).unwrap();
    call.decline(Reason::Declined).unwrap();

    let terminations = h
        .probe
        .commands()
        .into_iter()
        .filter(|cmd| matches!(cmd, SessionCommand::Terminate(_)))
        .count();
    assert_eq!(terminations, 1);
    assert_eq!(call.reason(), Reason::None);
}

#[test]
fn test_rejected_commands_leave_state_untouched() {
    let h = Harness::new();
    let call = h.incoming("alice");

    assert!(matches!(
        call.pause(),
        Err(DomainError::InvalidStateTransition(_))
    ));
    assert!(call.resume().unwrap_err().is_invalid_transition());
    assert!(call.accept_update(None).is_err());
    assert!(call.transfer(TransferTarget::Address(uri("bob"))).is_err());
    assert_eq!(call.state(), CallState::IncomingReceived);

    h.probe.fail_accept(true);
    assert!(call.accept(None).is_err());
    assert_eq!(call.state(), CallState::IncomingReceived);
    assert!(h.hardware.is_ringing());
}

#[test]
fn test_redirect_ends_call() {
    let h = Harness::new();
    let call = h.incoming("alice");

    call.redirect(&uri("voicemail")).unwrap();
    assert_eq!(call.state(), CallState::End);
    assert_eq!(call.reason(), Reason::MovedTemporarily);
    assert!(h
        .probe
        .commands()
        .contains(&SessionCommand::Redirect(uri("voicemail"))));
}

#[test]
fn test_decline_carries_warnings() {
    let h = Harness::new();
    let call = h.incoming("alice");

    let error_info = ErrorInfo::new(Reason::DoNotDisturb).with_warnings("Do not disturb active");
    call.decline_with_error_info(error_info.clone()).unwrap();

    assert_eq!(call.state(), CallState::End);
    assert_eq!(
        call.error_info().warnings.as_deref(),
        Some("Do not disturb active")
    );
    assert!(h
        .probe
        .commands()
        .contains(&SessionCommand::Decline(error_info)));
}

#[test]
fn test_background_task_held_until_release() {
    let h = Harness::new();
    let call = h.incoming("alice");
    assert!(call.has_background_task());
    assert_eq!(h.background.active(), 1);

    call.decline(Reason::Declined).unwrap();
    assert_eq!(h.background.active(), 1);

    h.seconds(1);
    assert!(!call.has_background_task());
    assert_eq!(h.background.active(), 0);
    assert_eq!(h.background.double_ends(), 0);
}

#[test]
fn test_call_survives_refused_background_task() {
    let h = Harness::new();
    h.background.refuse(true);

    let call = h.running_incoming("alice");
    assert!(!call.has_background_task());
    assert_eq!(call.state(), CallState::StreamsRunning);
}

/// Checks every delivered state against the accessor
#[derive(Default)]
struct RoundTrip {
    seen: RefCell<Vec<(CallState, CallState)>>,
}

impl CallListener for RoundTrip {
    fn on_state_changed(&self, call: &Call, state: CallState, _message: &str) {
        self.seen.borrow_mut().push((state, call.state()));
    }
}

/// Hangs up as soon as the call is connected
struct HangUpOnConnect;

impl CallListener for HangUpOnConnect {
    fn on_state_changed(&self, call: &Call, state: CallState, _message: &str) {
        if state == CallState::Connected {
            call.terminate(None).unwrap();
        }
    }
}

#[test]
fn test_delivered_states_match_accessor() {
    let h = Harness::new();
    let call = h.incoming("alice");
    let round_trip = Rc::new(RoundTrip::default());
    call.add_listener(Rc::new(HangUpOnConnect));
    call.add_listener(round_trip.clone());

    call.accept(None).unwrap();
    assert_eq!(call.state(), CallState::End);

    let seen = round_trip.seen.borrow();
    assert_eq!(*seen, vec![(CallState::End, CallState::End)]);
}

struct Counter {
    created: RefCell<usize>,
    removed_self: RefCell<bool>,
    me: RefCell<Option<Rc<dyn CoreListener>>>,
    manager: CallManager,
}

impl CoreListener for Counter {
    fn on_call_created(&self, _call: &Call) {
        *self.created.borrow_mut() += 1;
        if let Some(me) = self.me.borrow_mut().take() {
            *self.removed_self.borrow_mut() = self.manager.remove_listener(&me);
        }
    }
}

#[test]
fn test_listener_may_unregister_itself() {
    let h = Harness::new();
    let counter = Rc::new(Counter {
        created: RefCell::new(0),
        removed_self: RefCell::new(false),
        me: RefCell::new(None),
        manager: h.manager.clone(),
    });
    let as_core: Rc<dyn CoreListener> = counter.clone();
    *counter.me.borrow_mut() = Some(as_core.clone());
    h.manager.add_listener(as_core);

    h.incoming("alice");
    h.incoming("bob");

    assert_eq!(*counter.created.borrow(), 1);
    assert!(*counter.removed_self.borrow());
}

#[test]
fn test_early_updates_return_to_early_state() {
    let h = Harness::new();
    let call = h.ringing_outgoing("alice");

    call.on_session_state_changed(CallState::EarlyUpdatedByRemote, "Early update")
        .unwrap();
    assert_eq!(call.state(), CallState::OutgoingRinging);

    call.update(None).unwrap();
    assert_eq!(call.state(), CallState::EarlyUpdating);
    call.on_session_state_changed(CallState::OutgoingRinging, "Update done")
        .unwrap();
    assert_eq!(call.state(), CallState::OutgoingRinging);
}

#[test]
fn test_host_loop_releases_calls_on_shutdown() {
    let h = Harness::new();
    let call = h.incoming("alice");

    tokio_test::block_on(run_host_loop(
        &h.manager,
        Duration::from_millis(5),
        async {
            tokio::time::sleep(Duration::from_millis(30)).await;
        },
    ));

    assert_eq!(call.state(), CallState::Released);
    assert_eq!(h.manager.call_count(), 0);
    assert_eq!(h.background.active(), 0);
    assert!(!h.hardware.is_ringing());
}

#[test]
fn test_host_loop_reports_shutdown_failure() {
    let h = Harness::new();
    let call = h.running_incoming("alice");

    let result = tokio_test::block_on(run_host_loop(
        &h.manager,
        Duration::from_millis(5),
        async { Err::<(), _>(std::io::Error::other("no signal handler")) },
    ));

    assert!(result.is_err());
    assert_eq!(call.state(), CallState::Released);
    assert_eq!(h.manager.call_count(), 0);
    assert_eq!(h.background.active(), 0);
}
