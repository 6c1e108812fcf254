//! Call bounded context - state machine, observers and timers of one call

pub mod aggregate;
pub mod event;
pub mod listener;
pub mod session;
pub mod timer;
pub mod value_object;

pub use aggregate::Call;
pub use event::{CallEvent, CallEventKind, EventLog};
pub use listener::{CallListener, CoreListener, ListenerSet};
pub use session::{CallStats, Headers, InfoMessage, Session, SessionFactory};
pub use timer::Tick;
pub use value_object::{
    CallDirection, CallState, ErrorInfo, MediaEncryption, MediaParams, Reason, StreamType, Tone,
    TransferTarget,
};
