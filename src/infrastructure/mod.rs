//! Infrastructure layer - Technical implementations
//!
//! This layer contains:
//! - In-process adapters for the platform ports (hardware, background tasks)
//! - A loopback signaling session
//! - The host scheduling loop
//! - Metrics export

pub mod background;
pub mod devices;
pub mod loopback;
pub mod metrics;
pub mod scheduler;

pub use background::LocalBackgroundTasks;
pub use devices::LocalHardware;
pub use loopback::{LoopbackProbe, LoopbackSession, LoopbackSessionFactory, SessionCommand};
pub use scheduler::{run_host_loop, TickClock};
