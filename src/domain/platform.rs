//! Device-wide services shared by every call
//!
//! The ring card, the audio/video focus and the platform keep-alive are
//! singletons. They are injected into the `CallManager`, which is the only
//! component allowed to drive them.

use crate::domain::call::value_object::Tone;
use crate::domain::shared::result::Result;
use crate::domain::shared::value_objects::CallId;
use serde::{Deserialize, Serialize};

/// Shared sound card and media focus
pub trait HardwareController {
    /// Start the incoming ring tone
    fn start_ringing(&mut self) -> Result<()>;

    fn stop_ringing(&mut self);

    fn is_ringing(&self) -> bool;

    /// Local ringback tone for an outgoing call
    fn start_ringback(&mut self, call: CallId) -> Result<()>;

    fn stop_ringback(&mut self, call: CallId);

    /// Give the audio/video hardware to `call`
    fn preempt_focus(&mut self, call: CallId) -> Result<()>;

    fn release_focus(&mut self, call: CallId);

    fn focused_call(&self) -> Option<CallId>;

    fn play_tone(&mut self, tone: Tone);

    /// Reset shared bandwidth state once no call is left
    fn reset_bandwidth(&mut self);
}

/// Opaque platform keep-alive lease
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BackgroundTaskToken(pub u64);

/// Platform background execution service
pub trait BackgroundTaskService {
    /// Begin a background task; `None` when the platform refuses
    fn begin(&self, name: &str) -> Option<BackgroundTaskToken>;

    fn end(&self, token: BackgroundTaskToken);
}
