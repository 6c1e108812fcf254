//! Call observers
//!
//! Observers are registered per call (`CallListener`) or on the manager for
//! every call (`CoreListener`). Every method has an empty default so an
//! observer only implements the events it cares about.
//!
//! Delivery always works on a snapshot of the listener list taken when the
//! event is dispatched: listeners may add or remove listeners, or issue new
//! commands on the call, from inside a callback.

use crate::domain::call::aggregate::Call;
use crate::domain::call::session::{CallStats, Headers, InfoMessage};
use crate::domain::call::value_object::CallState;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use tracing::error;

/// Per-call observer
pub trait CallListener {
    fn on_state_changed(&self, _call: &Call, _state: CallState, _message: &str) {}

    fn on_dtmf_received(&self, _call: &Call, _dtmf: char) {}

    fn on_encryption_changed(&self, _call: &Call, _activated: bool, _auth_token: Option<&str>) {}

    fn on_stats_updated(&self, _call: &Call, _stats: &CallStats) {}

    fn on_info_message_received(&self, _call: &Call, _message: &InfoMessage) {}

    fn on_ack_processing(&self, _call: &Call, _headers: &Headers, _is_received: bool) {}

    fn on_transfer_state_changed(&self, _call: &Call, _state: CallState) {}

    fn on_next_video_frame_decoded(&self, _call: &Call) {}
}

/// Observer of every call owned by a `CallManager`
pub trait CoreListener {
    fn on_call_created(&self, _call: &Call) {}

    fn on_call_state_changed(&self, _call: &Call, _state: CallState, _message: &str) {}
}

/// Ordered set of shared listeners
pub struct ListenerSet<L: ?Sized> {
    listeners: Vec<Rc<L>>,
}

impl<L: ?Sized> ListenerSet<L> {
    pub fn new() -> Self {
        Self {
            listeners: Vec::new(),
        }
    }

    /// Register a listener; registering the same listener twice is a no-op
    pub fn add(&mut self, listener: Rc<L>) {
        if !self.contains(&listener) {
            self.listeners.push(listener);
        }
    }

    /// Unregister a listener, returns false if it was not registered
    pub fn remove(&mut self, listener: &Rc<L>) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|l| !same_listener(l, listener));
        self.listeners.len() != before
    }

    pub fn contains(&self, listener: &Rc<L>) -> bool {
        self.listeners.iter().any(|l| same_listener(l, listener))
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Copy of the current listeners in registration order
    pub fn snapshot(&self) -> Vec<Rc<L>> {
        self.listeners.clone()
    }
}

impl<L: ?Sized> Default for ListenerSet<L> {
    fn default() -> Self {
        Self::new()
    }
}

fn same_listener<L: ?Sized>(a: &Rc<L>, b: &Rc<L>) -> bool {
    Rc::as_ptr(a).cast::<()>() == Rc::as_ptr(b).cast::<()>()
}

/// Deliver one event to every listener of `snapshot`.
///
/// `still_current` is consulted before each delivery; once it returns false
/// the event is stale and the remaining listeners are skipped. A panicking
/// listener is logged and does not prevent delivery to the others.
pub fn dispatch<L: ?Sized>(
    snapshot: &[Rc<L>],
    event: &str,
    mut still_current: impl FnMut() -> bool,
    mut deliver: impl FnMut(&L),
) {
    for listener in snapshot {
        if !still_current() {
            break;
        }
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| deliver(listener.as_ref())));
        if outcome.is_err() {
            error!("Listener panicked while handling {}, continuing with the next one", event);
        }
    }
}
