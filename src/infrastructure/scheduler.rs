//! Host scheduling loop
//!
//! Drives `CallManager::iterate` from a tokio interval. The manager is
//! single-threaded, so the loop runs on the thread that owns it (the main
//! task of a current-thread runtime, or a `LocalSet`).

use crate::domain::call::timer::Tick;
use crate::domain::call_manager::CallManager;
use std::future::Future;
use std::time::Duration;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info};

const ONE_SECOND: Duration = Duration::from_secs(1);

/// Turns wall clock readings into `Tick`s
#[derive(Debug, Clone)]
pub struct TickClock {
    last: Instant,
    second_mark: Instant,
}

impl TickClock {
    pub fn new(now: Instant) -> Self {
        Self {
            last: now,
            second_mark: now,
        }
    }

    pub fn tick(&mut self, now: Instant) -> Tick {
        let elapsed = now.saturating_duration_since(self.last);
        self.last = now;

        let one_second_elapsed = now.saturating_duration_since(self.second_mark) >= ONE_SECOND;
        if one_second_elapsed {
            self.second_mark = now;
        }
        Tick::new(elapsed, one_second_elapsed)
    }
}

/// Iterate `manager` every `period` until `shutdown` resolves, then
/// terminate and release every remaining call.
///
/// Returns the output of `shutdown`, so a failing shutdown signal reaches
/// the caller after the calls are cleaned up.
pub async fn run_host_loop<F, T>(manager: &CallManager, period: Duration, shutdown: F) -> T
where
    F: Future<Output = T>,
{
    let mut interval = time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut clock = TickClock::new(Instant::now());
    tokio::pin!(shutdown);

    info!("Host loop started, period {:?}", period);
    let output = loop {
        tokio::select! {
            output = &mut shutdown => {
                info!("Host loop stopping");
                break output;
            }
            _ = interval.tick() => {
                let tick = clock.tick(Instant::now());
                manager.iterate(tick);
            }
        }
    };

    manager.terminate_all_calls();
    manager.iterate(Tick::new(Duration::ZERO, false));
    debug!("Host loop stopped, {} calls left", manager.call_count());
    output
}
