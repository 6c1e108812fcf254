//! In-process hardware controller
//!
//! Keeps the ring card, media focus and tone requests as plain state. Used by
//! the demo binary and by tests; a real deployment plugs its sound layer in
//! behind `HardwareController` instead.

use crate::domain::call::value_object::Tone;
use crate::domain::platform::HardwareController;
use crate::domain::shared::error::DomainError;
use crate::domain::shared::result::Result;
use crate::domain::shared::value_objects::CallId;
use std::cell::RefCell;
use std::collections::BTreeSet;
use std::rc::Rc;
use tracing::debug;

#[derive(Debug, Default)]
struct HardwareState {
    ringing: bool,
    ring_starts: usize,
    ringback: BTreeSet<CallId>,
    focus: Option<CallId>,
    tones: Vec<Tone>,
    bandwidth_resets: usize,
    refuse_ring: bool,
    refuse_focus: bool,
}

/// Clonable handle; clones share the same device state
#[derive(Debug, Clone, Default)]
pub struct LocalHardware {
    state: Rc<RefCell<HardwareState>>,
}

impl LocalHardware {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `start_ringing` fail, as when the ring card is busy
    pub fn refuse_ring(&self, refuse: bool) {
        self.state.borrow_mut().refuse_ring = refuse;
    }

    pub fn refuse_focus(&self, refuse: bool) {
        self.state.borrow_mut().refuse_focus = refuse;
    }

    /// Times the ring tone was started
    pub fn ring_starts(&self) -> usize {
        self.state.borrow().ring_starts
    }

    pub fn ringback_calls(&self) -> Vec<CallId> {
        self.state.borrow().ringback.iter().copied().collect()
    }

    /// Tones played so far, oldest first
    pub fn tones(&self) -> Vec<Tone> {
        self.state.borrow().tones.clone()
    }

    pub fn bandwidth_resets(&self) -> usize {
        self.state.borrow().bandwidth_resets
    }
}

impl HardwareController for LocalHardware {
    fn start_ringing(&mut self) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if state.refuse_ring {
            return Err(DomainError::ResourceUnavailable(
                "Ring card unavailable".to_string(),
            ));
        }
        debug!("Ring tone started");
        state.ringing = true;
        state.ring_starts += 1;
        Ok(())
    }

    fn stop_ringing(&mut self) {
        debug!("Ring tone stopped");
        self.state.borrow_mut().ringing = false;
    }

    fn is_ringing(&self) -> bool {
        self.state.borrow().ringing
    }

    fn start_ringback(&mut self, call: CallId) -> Result<()> {
        debug!("Ringback tone started for call {}", call);
        self.state.borrow_mut().ringback.insert(call);
        Ok(())
    }

    fn stop_ringback(&mut self, call: CallId) {
        if self.state.borrow_mut().ringback.remove(&call) {
            debug!("Ringback tone stopped for call {}", call);
        }
    }

    fn preempt_focus(&mut self, call: CallId) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if state.refuse_focus {
            return Err(DomainError::ResourceUnavailable(
                "Media focus unavailable".to_string(),
            ));
        }
        state.focus = Some(call);
        Ok(())
    }

    fn release_focus(&mut self, call: CallId) {
        let mut state = self.state.borrow_mut();
        if state.focus == Some(call) {
            state.focus = None;
        }
    }

    fn focused_call(&self) -> Option<CallId> {
        self.state.borrow().focus
    }

    fn play_tone(&mut self, tone: Tone) {
        debug!("Tone {:?} played", tone);
        self.state.borrow_mut().tones.push(tone);
    }

    fn reset_bandwidth(&mut self) {
        self.state.borrow_mut().bandwidth_resets += 1;
    }
}
