//! Domain layer - Core business logic and rules
//!
//! This layer contains:
//! - The call aggregate and its state machine
//! - Cross-call arbitration in the call manager
//! - Ports for the signaling session and the device-wide services
//! - Shared kernel: errors, events and identifiers

pub mod call;
pub mod call_manager;
pub mod platform;
pub mod shared;

// Re-export commonly used types
pub use call_manager::{CallManager, CallStatistics};
pub use shared::{DomainError, Result};
