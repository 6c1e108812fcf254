//! Cooperative call timers
//!
//! Calls own no timers. The host loop hands every call a `Tick` and the
//! call advances its clocks and checks its deadlines against it.

use crate::config::CallConfig;
use crate::domain::call::aggregate::Call;
use crate::domain::call::value_object::{CallState, ErrorInfo, Reason, Tone};
use std::time::Duration;
use tracing::{info, warn};

/// One step of the host scheduling loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tick {
    /// Time since the previous tick
    pub elapsed: Duration,
    /// A whole second boundary was crossed since the previous tick
    pub one_second_elapsed: bool,
}

impl Tick {
    pub fn new(elapsed: Duration, one_second_elapsed: bool) -> Self {
        Self {
            elapsed,
            one_second_elapsed,
        }
    }

    /// A tick of exactly one second
    pub fn second() -> Self {
        Self::new(Duration::from_secs(1), true)
    }
}

impl Call {
    /// Advance the clocks of this call and run its time based checks
    pub(crate) fn iterate(&self, tick: Tick, config: &CallConfig) {
        let state = self.state();

        if state.is_incoming_pending() {
            let ring_elapsed = {
                let mut data = self.data_mut();
                data.ring_elapsed += tick.elapsed;
                data.ring_elapsed
            };
            if ring_elapsed > config.incoming_timeout() {
                self.on_incoming_timeout(ring_elapsed);
            }
            return;
        }

        if state.is_connected_like() {
            self.data_mut().duration += tick.elapsed;
        }

        if tick.one_second_elapsed
            && matches!(state, CallState::StreamsRunning | CallState::PausedByRemote)
        {
            if let Some(timeout) = config.nortp_timeout() {
                self.check_media_activity(timeout);
            }
        }
    }

    fn on_incoming_timeout(&self, ring_elapsed: Duration) {
        let busy = self
            .manager()
            .and_then(|m| m.current_call())
            .is_some_and(|current| current != *self);
        let reason = if busy { Reason::Busy } else { Reason::Declined };

        info!(
            "Incoming call {} not answered after {}s, declining with {:?}",
            self.id(),
            ring_elapsed.as_secs(),
            reason
        );
        crate::infrastructure::metrics::record_incoming_timeout();

        if let Err(e) = self.decline(reason) {
            warn!("Could not decline timed out call {}: {}", self.id(), e);
        }
    }

    fn check_media_activity(&self, timeout: Duration) {
        let Some(inactivity) = self.audio_inactivity() else {
            return;
        };
        if inactivity <= timeout {
            return;
        }

        warn!(
            "Call {}: no RTP for {}s, terminating",
            self.id(),
            inactivity.as_secs()
        );
        crate::infrastructure::metrics::record_media_lost();

        let error_info = ErrorInfo::new(Reason::IoError).with_phrase("Media lost");
        if let Err(e) = self.terminate(Some(error_info)) {
            warn!("Could not terminate call {}: {}", self.id(), e);
        }
        if let Some(manager) = self.manager() {
            manager.play_tone(Tone::CallLost);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::domain::call::session::{MockSession, MockSessionFactory};
    use crate::domain::call_manager::CallManager;
    use crate::domain::shared::value_objects::SipUri;
    use crate::infrastructure::background::LocalBackgroundTasks;
    use crate::infrastructure::devices::LocalHardware;

    fn setup(inactivity: Option<Duration>) -> (CallManager, LocalHardware, Call) {
        let hardware = LocalHardware::new();
        let manager = CallManager::new(
            Config::default(),
            SipUri::parse("sip:me@example.com").unwrap(),
            Box::new(hardware.clone()),
            Box::new(LocalBackgroundTasks::new()),
            Box::new(MockSessionFactory::new()),
        );

        let mut session = MockSession::new();
        session.expect_initiate_incoming().return_const(());
        session.expect_accept().returning(|_| Ok(()));
        session.expect_decline().returning(|_| Ok(()));
        session.expect_terminate().returning(|_| Ok(()));
        session
            .expect_audio_inactivity()
            .returning(move || inactivity);

        let call = manager
            .handle_incoming(
                Box::new(session),
                &SipUri::parse("sip:alice@example.com").unwrap(),
                &SipUri::parse("sip:me@example.com").unwrap(),
                None,
            )
            .unwrap();
        (manager, hardware, call)
    }

    #[test]
    fn test_ring_timeout_is_strictly_greater() {
        let (_manager, _hardware, call) = setup(None);
        let config = CallConfig::default();

        for _ in 0..30 {
            call.iterate(Tick::second(), &config);
        }
        assert_eq!(call.state(), CallState::IncomingReceived);

        call.iterate(Tick::second(), &config);
        assert_eq!(call.state(), CallState::End);
        assert_eq!(call.reason(), Reason::Declined);
    }

    #[test]
    fn test_duration_accumulates_while_connected() {
        let (_manager, _hardware, call) = setup(None);
        let config = CallConfig::default();
        call.accept(None).unwrap();

        call.iterate(Tick::new(Duration::from_millis(400), false), &config);
        call.iterate(Tick::new(Duration::from_millis(600), true), &config);
        assert_eq!(call.duration(), Duration::from_secs(1));
        assert_eq!(call.ring_elapsed(), Duration::ZERO);
    }

    #[test]
    fn test_media_watchdog_terminates_call() {
        let (_manager, hardware, call) = setup(Some(Duration::from_secs(31)));
        let config = CallConfig::default();
        call.accept(None).unwrap();
        call.on_session_state_changed(CallState::StreamsRunning, "Streams running")
            .unwrap();

        // Only whole second ticks run the watchdog
        call.iterate(Tick::new(Duration::from_millis(100), false), &config);
        assert_eq!(call.state(), CallState::StreamsRunning);

        call.iterate(Tick::second(), &config);
        assert_eq!(call.state(), CallState::End);
        assert_eq!(call.reason(), Reason::IoError);
        assert_eq!(call.error_info().phrase, "Media lost");
        assert!(hardware.tones().contains(&Tone::CallLost));
    }

    #[test]
    fn test_media_watchdog_disabled() {
        let (_manager, _hardware, call) = setup(Some(Duration::from_secs(600)));
        let config = CallConfig {
            nortp_timeout_secs: 0,
            ..CallConfig::default()
        };
        call.accept(None).unwrap();
        call.on_session_state_changed(CallState::StreamsRunning, "Streams running")
            .unwrap();

        call.iterate(Tick::second(), &config);
        assert_eq!(call.state(), CallState::StreamsRunning);
    }
}
