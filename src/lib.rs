//! Callplane - call session control for a SIP user agent
//!
//! Owns the state machine of every call, the cross-call policies (current
//! call, ring tone, superseded outgoing attempts) and the fan-out of call
//! events to observers. Signaling and media live behind the `Session` port.

pub mod config;
pub mod domain;
pub mod infrastructure;

// Re-export commonly used types
pub use domain::call::{Call, CallListener, CallState, CoreListener, Tick};
pub use domain::call_manager::CallManager;
pub use domain::shared::error::DomainError;
pub use domain::shared::result::Result;
