//! Call events
//!
//! Serialisable record of everything a call reports to its observers.
//! `EventLog` is a listener that keeps these records, which is handy for
//! audit trails, debugging and tests.

use crate::domain::call::aggregate::Call;
use crate::domain::call::listener::{CallListener, CoreListener};
use crate::domain::call::session::{CallStats, Headers, InfoMessage};
use crate::domain::call::value_object::CallState;
use crate::domain::shared::events::{DomainEvent, EventMetadata};
use crate::domain::shared::value_objects::CallId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;

/// Payload of a call event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CallEventKind {
    Created,
    StateChanged { state: CallState, message: String },
    DtmfReceived { dtmf: char },
    EncryptionChanged { activated: bool, auth_token: Option<String> },
    StatsUpdated { stats: CallStats },
    InfoMessageReceived { message: InfoMessage },
    AckProcessing { headers: Headers, is_received: bool },
    TransferStateChanged { state: CallState },
    NextVideoFrameDecoded,
}

impl CallEventKind {
    pub fn event_type(&self) -> &'static str {
        match self {
            CallEventKind::Created => "call.created",
            CallEventKind::StateChanged { .. } => "call.state_changed",
            CallEventKind::DtmfReceived { .. } => "call.dtmf_received",
            CallEventKind::EncryptionChanged { .. } => "call.encryption_changed",
            CallEventKind::StatsUpdated { .. } => "call.stats_updated",
            CallEventKind::InfoMessageReceived { .. } => "call.info_message_received",
            CallEventKind::AckProcessing { .. } => "call.ack_processing",
            CallEventKind::TransferStateChanged { .. } => "call.transfer_state_changed",
            CallEventKind::NextVideoFrameDecoded => "call.next_video_frame_decoded",
        }
    }
}

/// A call event with its metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallEvent {
    pub metadata: EventMetadata,
    pub call_id: CallId,
    pub kind: CallEventKind,
}

impl CallEvent {
    pub fn new(call_id: CallId, kind: CallEventKind) -> Self {
        Self {
            metadata: EventMetadata::new(kind.event_type()),
            call_id,
            kind,
        }
    }

    /// JSON form used for audit trails
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

impl DomainEvent for CallEvent {
    fn event_type(&self) -> &'static str {
        self.kind.event_type()
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.metadata.occurred_at
    }
}

/// Listener that records every event it sees
#[derive(Default)]
pub struct EventLog {
    events: RefCell<Vec<CallEvent>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, call: &Call, kind: CallEventKind) {
        self.events.borrow_mut().push(CallEvent::new(call.id(), kind));
    }

    /// Copy of the recorded events
    pub fn events(&self) -> Vec<CallEvent> {
        self.events.borrow().clone()
    }

    /// Take all recorded events
    pub fn take_events(&self) -> Vec<CallEvent> {
        std::mem::take(&mut *self.events.borrow_mut())
    }

    /// States reported for one call, in delivery order
    pub fn states_for(&self, call_id: CallId) -> Vec<CallState> {
        self.events
            .borrow()
            .iter()
            .filter(|e| e.call_id == call_id)
            .filter_map(|e| match e.kind {
                CallEventKind::StateChanged { state, .. } => Some(state),
                _ => None,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.borrow().is_empty()
    }
}

impl CallListener for EventLog {
    fn on_state_changed(&self, call: &Call, state: CallState, message: &str) {
        self.record(
            call,
            CallEventKind::StateChanged {
                state,
                message: message.to_string(),
            },
        );
    }

    fn on_dtmf_received(&self, call: &Call, dtmf: char) {
        self.record(call, CallEventKind::DtmfReceived { dtmf });
    }

    fn on_encryption_changed(&self, call: &Call, activated: bool, auth_token: Option<&str>) {
        self.record(
            call,
            CallEventKind::EncryptionChanged {
                activated,
                auth_token: auth_token.map(str::to_string),
            },
        );
    }

    fn on_stats_updated(&self, call: &Call, stats: &CallStats) {
        self.record(
            call,
            CallEventKind::StatsUpdated {
                stats: stats.clone(),
            },
        );
    }

    fn on_info_message_received(&self, call: &Call, message: &InfoMessage) {
        self.record(
            call,
            CallEventKind::InfoMessageReceived {
                message: message.clone(),
            },
        );
    }

    fn on_ack_processing(&self, call: &Call, headers: &Headers, is_received: bool) {
        self.record(
            call,
            CallEventKind::AckProcessing {
                headers: headers.clone(),
                is_received,
            },
        );
    }

    fn on_transfer_state_changed(&self, call: &Call, state: CallState) {
        self.record(call, CallEventKind::TransferStateChanged { state });
    }

    fn on_next_video_frame_decoded(&self, call: &Call) {
        self.record(call, CallEventKind::NextVideoFrameDecoded);
    }
}

impl CoreListener for EventLog {
    fn on_call_created(&self, call: &Call) {
        self.record(call, CallEventKind::Created);
    }

    fn on_call_state_changed(&self, call: &Call, state: CallState, message: &str) {
        CallListener::on_state_changed(self, call, state, message);
    }
}
