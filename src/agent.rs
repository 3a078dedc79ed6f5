use tracing::{error, info, warn};

use crate::broker::{capture_topic, Publisher};
use crate::classify::Uploader;
use crate::frame::{FrameError, FrameGuard, FrameSource};
use crate::types::{Action, ActionSlot, Outcome, TickReport};

#[derive(Debug, Clone)]
pub struct PublishPolicy {
    /// Failed attempts after which a publish request is abandoned.
    pub max_attempts: u32,
    pub complete_topic: String,
    pub side: String,
}

pub struct CaptureAgent<S, P, U> {
    slot: ActionSlot,
    source: S,
    publisher: P,
    uploader: U,
    policy: PublishPolicy,
}

impl<S, P, U> CaptureAgent<S, P, U>
where
    S: FrameSource,
    P: Publisher,
    U: Uploader,
{
    pub fn new(slot: ActionSlot, source: S, publisher: P, uploader: U, policy: PublishPolicy) -> Self {
        Self {
            slot,
            source,
            publisher,
            uploader,
            policy,
        }
    }

    pub fn slot(&self) -> &ActionSlot {
        &self.slot
    }

    pub fn publisher_mut(&mut self) -> &mut P {
        &mut self.publisher
    }

    /// Performs the one step the pending action authorizes and installs the
    /// next action. The slot stays locked for the whole step.
    ///
    /// A fatal frame fault leaves the pending action untouched.
    pub fn step(&mut self) -> Result<TickReport, FrameError> {
        let slot = self.slot.clone();
        let mut action = slot.lock();

        let previous = action.clone();
        let outcome = self.perform(&previous)?;
        let next = transition(&previous, &outcome, self.policy.max_attempts);
        log_transition(&previous, &outcome, &next, self.policy.max_attempts);

        *action = next.clone();
        Ok(TickReport {
            previous,
            outcome,
            next,
        })
    }

    fn perform(&mut self, action: &Action) -> Result<Outcome, FrameError> {
        match action {
            Action::Idle => Ok(Outcome::Nothing),
            Action::ClassifyRequested => {
                info!("classify image action triggered");
                let Some(frame) = FrameGuard::acquire(&mut self.source)? else {
                    return Ok(Outcome::NoFrame);
                };
                let response = self.uploader.upload(frame);
                info!(response = %response, "response from classification server");
                Ok(Outcome::Classified(response))
            }
            Action::PublishRequested {
                request_id,
                attempt,
            } => {
                info!(request_id = %request_id, attempt, "publish image action triggered");
                let Some(frame) = FrameGuard::acquire(&mut self.source)? else {
                    return Ok(Outcome::NoFrame);
                };
                let topic = capture_topic(&self.policy.complete_topic, &self.policy.side, request_id);
                if self.publisher.publish(&topic, frame) {
                    Ok(Outcome::Delivered)
                } else {
                    Ok(Outcome::Rejected)
                }
            }
        }
    }
}

/// Next action for a given action and the outcome of its step.
///
/// Frame starvation and a rejected publish spend the same retry budget.
pub fn transition(action: &Action, outcome: &Outcome, max_attempts: u32) -> Action {
    match action {
        Action::Idle => Action::Idle,
        // Single shot: resolved whatever the upload did.
        Action::ClassifyRequested => Action::Idle,
        Action::PublishRequested {
            request_id,
            attempt,
        } => {
            if *outcome == Outcome::Delivered {
                return Action::Idle;
            }
            let failed = attempt.saturating_add(1);
            if failed >= max_attempts {
                Action::Idle
            } else {
                Action::PublishRequested {
                    request_id: request_id.clone(),
                    attempt: failed,
                }
            }
        }
    }
}

fn log_transition(previous: &Action, outcome: &Outcome, next: &Action, max_attempts: u32) {
    match (previous, outcome) {
        (Action::ClassifyRequested, Outcome::NoFrame) => {
            warn!("no frame available; classification dropped");
        }
        (Action::PublishRequested { request_id, .. }, failure) if failure.is_failure() => {
            let cause = match failure {
                Outcome::NoFrame => "failed to obtain snapshot",
                _ => "failed to publish image to broker",
            };
            match next {
                Action::PublishRequested { attempt, .. } => warn!(
                    request_id = %request_id,
                    attempt = *attempt,
                    max_attempts,
                    "{cause}; retrying"
                ),
                _ => error!(
                    request_id = %request_id,
                    max_attempts,
                    "{cause}; max attempts reached"
                ),
            }
        }
        _ => {}
    }
}
