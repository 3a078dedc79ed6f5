use crate::agent::CaptureAgent;
use crate::broker::Publisher;
use crate::classify::Uploader;
use crate::frame::{FrameError, FrameSource};
use crate::types::{ActionSlot, TickReport};
use std::time::{Duration, Instant};
use tracing::{debug, info};

pub struct Scheduler<S, P, U> {
    agent: CaptureAgent<S, P, U>,
    tick_budget: Duration,
    deadline_misses: u64,
    worst_case: Duration,
    total_ticks: u64,
}

impl<S, P, U> Scheduler<S, P, U>
where
    S: FrameSource,
    P: Publisher,
    U: Uploader,
{
    pub fn new(agent: CaptureAgent<S, P, U>, tick_budget: Duration) -> Self {
        Self {
            agent,
            tick_budget,
            deadline_misses: 0,
            worst_case: Duration::ZERO,
            total_ticks: 0,
        }
    }

    pub fn tick(&mut self) -> Result<TickReport, FrameError> {
        let start = Instant::now();

        let report = self.agent.step()?;

        let elapsed = start.elapsed();

        if elapsed > self.tick_budget {
            self.deadline_misses += 1;
            debug!(
                elapsed_ms = elapsed.as_millis() as u64,
                budget_ms = self.tick_budget.as_millis() as u64,
                action = ?report.previous,
                "tick overran its budget"
            );
        }

        if elapsed > self.worst_case {
            self.worst_case = elapsed;
        }

        self.total_ticks += 1;
        Ok(report)
    }

    /// Runs the cooperative loop until a fatal frame fault.
    ///
    /// `pump` handles external events (broker traffic, timers) once per cycle
    /// and may install actions through the slot. The scheduler only ticks in
    /// cycles where `pump` returns `true`.
    pub fn run<F>(&mut self, mut pump: F) -> FrameError
    where
        F: FnMut(&mut P, &ActionSlot) -> bool,
    {
        let slot = self.agent.slot().clone();

        loop {
            let cycle_start = Instant::now();

            if pump(self.agent.publisher_mut(), &slot) {
                if let Err(fault) = self.tick() {
                    return fault;
                }
            }

            let elapsed = cycle_start.elapsed();

            if elapsed < self.tick_budget {
                std::thread::sleep(self.tick_budget - elapsed);
            }
        }
    }

    pub fn deadline_misses(&self) -> u64 {
        self.deadline_misses
    }

    pub fn worst_case(&self) -> Duration {
        self.worst_case
    }

    pub fn total_ticks(&self) -> u64 {
        self.total_ticks
    }

    pub fn log_metrics(&self) {
        info!(
            total_ticks = self.total_ticks,
            deadline_misses = self.deadline_misses,
            worst_case_ms = self.worst_case.as_millis() as u64,
            budget_ms = self.tick_budget.as_millis() as u64,
            "scheduler metrics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::PublishPolicy;
    use crate::broker::Offline;
    use crate::frame::{Frame, FrameGuard};
    use crate::types::Action;

    struct NoCamera;

    impl FrameSource for NoCamera {
        fn acquire(&mut self) -> Result<Option<Frame>, FrameError> {
            Ok(None)
        }

        fn release(&mut self, _frame: Frame) {}
    }

    struct FaultyCamera;

    impl FrameSource for FaultyCamera {
        fn acquire(&mut self) -> Result<Option<Frame>, FrameError> {
            Err(FrameError::fault("sensor not responding"))
        }

        fn release(&mut self, _frame: Frame) {}
    }

    struct SlowCamera;

    impl FrameSource for SlowCamera {
        fn acquire(&mut self) -> Result<Option<Frame>, FrameError> {
            std::thread::sleep(Duration::from_millis(20));
            Ok(None)
        }

        fn release(&mut self, _frame: Frame) {}
    }

    struct SilentBackend;

    impl Uploader for SilentBackend {
        fn upload(&mut self, _frame: FrameGuard<'_>) -> String {
            String::new()
        }
    }

    fn policy() -> PublishPolicy {
        PublishPolicy {
            max_attempts: 5,
            complete_topic: "capture/complete".into(),
            side: "top".into(),
        }
    }

    #[test]
    fn tick_updates_metrics() {
        let agent = CaptureAgent::new(ActionSlot::new(), NoCamera, Offline, SilentBackend, policy());
        let mut scheduler = Scheduler::new(agent, Duration::from_millis(100));

        let report = scheduler.tick().unwrap();

        assert!(report.is_noop());
        assert_eq!(scheduler.total_ticks, 1);
        assert_eq!(scheduler.deadline_misses, 0);
    }

    #[test]
    fn slow_tick_counts_as_deadline_miss() {
        let slot = ActionSlot::new();
        let agent = CaptureAgent::new(slot.clone(), SlowCamera, Offline, SilentBackend, policy());
        let mut scheduler = Scheduler::new(agent, Duration::from_millis(5));

        scheduler.tick().unwrap();
        slot.trigger_publish("req-1");
        scheduler.tick().unwrap();

        assert_eq!(scheduler.total_ticks(), 2);
        assert_eq!(scheduler.deadline_misses(), 1);
        assert!(scheduler.worst_case() >= Duration::from_millis(20));
    }

    #[test]
    fn run_returns_fatal_fault() {
        let slot = ActionSlot::new();
        let agent = CaptureAgent::new(slot.clone(), FaultyCamera, Offline, SilentBackend, policy());
        let mut scheduler = Scheduler::new(agent, Duration::from_millis(1));

        let mut cycles = 0;
        let fault = scheduler.run(|_, slot| {
            cycles += 1;
            if cycles == 3 {
                slot.trigger_publish("req-1");
            }
            true
        });

        assert!(matches!(fault, FrameError::Fault { .. }));
        assert_eq!(cycles, 3);
        assert_eq!(scheduler.total_ticks(), 2);
        // The fault bypasses the state machine.
        assert_eq!(slot.current(), Action::publish("req-1"));
    }

    #[test]
    fn run_skips_ticks_while_pump_holds_back() {
        let slot = ActionSlot::new();
        let agent = CaptureAgent::new(slot.clone(), FaultyCamera, Offline, SilentBackend, policy());
        let mut scheduler = Scheduler::new(agent, Duration::from_millis(1));
        slot.trigger_publish("req-1");

        let mut cycles = 0;
        let fault = scheduler.run(|_, _| {
            cycles += 1;
            cycles > 4
        });

        assert!(matches!(fault, FrameError::Fault { .. }));
        assert_eq!(cycles, 5);
        assert_eq!(scheduler.total_ticks(), 0);
    }
}
