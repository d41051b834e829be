use super::{
    fs::JobLayout,
    poll::{await_predicate, Awaited, Cancellation, Clock, PollBudget, PollError, Probe},
    Slot,
};
use std::time::Duration;
use tracing::{info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierState {
    Waiting,
    /// every expected artifact was present
    Complete,
    /// the wait ceiling elapsed with artifacts still missing
    Degraded,
}

/// Artifacts present and missing at a single point in time
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Survey {
    pub present: Vec<u32>,
    pub missing: Vec<u32>,
}

impl Survey {
    pub fn take(layout: &JobLayout, expected: u32) -> Self {
        let (present, missing): (Vec<u32>, Vec<u32>) =
            (0..expected).partition(|ordinal| layout.result(*ordinal).exists());

        Self { present, missing }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BarrierOutcome {
    pub state: BarrierState,
    pub survey: Survey,
    pub waited: Duration,
}

/// Completion barrier of a job, only ever constructed for the last ordinal of the array
#[derive(Debug)]
pub struct CompletionBarrier<'a> {
    layout: &'a JobLayout,
    expected: u32,
    budget: PollBudget,
    state: BarrierState,
}

impl<'a> CompletionBarrier<'a> {
    /// `None` for every slot but the barrier runner.
    /// `expected` is the number of ordinals that own an item, slots beyond the instance list
    /// never produce an artifact and are not waited for.
    pub fn for_slot(
        slot: &Slot,
        layout: &'a JobLayout,
        expected: u32,
        budget: PollBudget,
    ) -> Option<Self> {
        slot.is_barrier_runner().then(|| Self {
            layout,
            expected: expected.min(slot.array_size),
            budget,
            state: BarrierState::Waiting,
        })
    }

    pub fn state(&self) -> BarrierState {
        self.state
    }

    /// wait for all sibling artifacts, both terminal states proceed to aggregation
    #[instrument(skip_all, fields(expected = self.expected), level = "info")]
    pub fn wait<C: Clock + ?Sized>(
        &mut self,
        clock: &C,
        cancellation: &Cancellation,
    ) -> Result<BarrierOutcome, PollError> {
        let layout = self.layout;
        let expected = self.expected;
        let mut last_missing = usize::MAX;

        let awaited = await_predicate(&self.budget, clock, cancellation, || {
            let survey = Survey::take(layout, expected);

            if survey.missing.len() != last_missing {
                info!(
                    present = survey.present.len(),
                    missing = survey.missing.len(),
                    "Waiting for sibling slots"
                );
                last_missing = survey.missing.len();
            }

            if survey.missing.is_empty() {
                Ok::<_, PollError>(Probe::Ready(survey))
            } else {
                Ok(Probe::Pending(survey))
            }
        })?;

        let outcome = match awaited {
            Awaited::Ready { value, waited, .. } => {
                info!(?waited, "All {expected} slots completed");

                BarrierOutcome {
                    state: BarrierState::Complete,
                    survey: value,
                    waited,
                }
            }
            Awaited::Expired {
                pending, waited, ..
            } => {
                warn!(
                    ?waited,
                    missing = ?pending.missing,
                    "Timed out waiting for {} of {expected} slots, continuing with partial results",
                    pending.missing.len()
                );

                BarrierOutcome {
                    state: BarrierState::Degraded,
                    survey: pending,
                    waited,
                }
            }
        };

        self.state = outcome.state;

        Ok(outcome)
    }
}
