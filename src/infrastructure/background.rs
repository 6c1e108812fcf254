//! In-process background task service

use crate::domain::platform::{BackgroundTaskService, BackgroundTaskToken};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct Leases {
    next: u64,
    active: BTreeMap<u64, String>,
    double_ends: usize,
    refuse: bool,
}

/// Keeps track of the leases handed out. Clones share the same leases.
#[derive(Debug, Clone, Default)]
pub struct LocalBackgroundTasks {
    leases: Rc<RefCell<Leases>>,
}

impl LocalBackgroundTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse every new lease, as a platform out of background time would
    pub fn refuse(&self, refuse: bool) {
        self.leases.borrow_mut().refuse = refuse;
    }

    pub fn active(&self) -> usize {
        self.leases.borrow().active.len()
    }

    /// Ends received for tokens that were not active
    pub fn double_ends(&self) -> usize {
        self.leases.borrow().double_ends
    }
}

impl BackgroundTaskService for LocalBackgroundTasks {
    fn begin(&self, name: &str) -> Option<BackgroundTaskToken> {
        let mut leases = self.leases.borrow_mut();
        if leases.refuse {
            return None;
        }
        leases.next += 1;
        let id = leases.next;
        leases.active.insert(id, name.to_string());
        debug!("Background task {} started: {}", id, name);
        Some(BackgroundTaskToken(id))
    }

    fn end(&self, token: BackgroundTaskToken) {
        let mut leases = self.leases.borrow_mut();
        match leases.active.remove(&token.0) {
            Some(name) => debug!("Background task {} ended: {}", token.0, name),
            None => {
                warn!("Background task {} ended twice", token.0);
                leases.double_ends += 1;
            }
        }
    }
}
