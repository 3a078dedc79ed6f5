use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tracing::{info, warn};

/// The single unit of pending work.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Action {
    #[default]
    Idle,
    ClassifyRequested,
    PublishRequested { request_id: String, attempt: u32 },
}

impl Action {
    pub fn publish(request_id: impl Into<String>) -> Self {
        Action::PublishRequested {
            request_id: request_id.into(),
            attempt: 0,
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, Action::Idle)
    }
}

/// Process-wide holder of the current [`Action`].
///
/// Exactly two call sites write it: the trigger handler ([`ActionSlot::set`],
/// [`ActionSlot::trigger_publish`]) and the scheduler tick, which holds the
/// lock for the whole read-modify-write so a trigger arriving mid-tick lands
/// after the tick and wins.
#[derive(Debug, Clone, Default)]
pub struct ActionSlot {
    inner: Arc<Mutex<Action>>,
}

impl ActionSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the pending action unconditionally and returns the one it superseded.
    pub fn set(&self, action: Action) -> Action {
        std::mem::replace(&mut *self.inner.lock(), action)
    }

    pub fn current(&self) -> Action {
        self.inner.lock().clone()
    }

    /// Installs `PublishRequested { request_id, attempt: 0 }`, dropping whatever was pending.
    pub fn trigger_publish(&self, request_id: impl Into<String>) {
        let request_id = request_id.into();
        info!(request_id = %request_id, "received capture request");

        match self.set(Action::publish(request_id)) {
            Action::PublishRequested {
                request_id: dropped,
                attempt,
            } => {
                warn!(
                    request_id = %dropped,
                    attempt,
                    "new capture request supersedes pending retries"
                );
            }
            Action::ClassifyRequested => warn!("new capture request supersedes pending classification"),
            Action::Idle => {}
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Action> {
        self.inner.lock()
    }
}

/// What the collaborator call of one tick produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Nothing,
    NoFrame,
    Delivered,
    Rejected,
    Classified(String),
}

impl Outcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, Outcome::NoFrame | Outcome::Rejected)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub previous: Action,
    pub outcome: Outcome,
    pub next: Action,
}

impl TickReport {
    pub fn is_noop(&self) -> bool {
        self.previous.is_idle() && self.next.is_idle()
    }
}
