use crate::{
    collector::{AggregateError, AggregateSummary, Collector},
    config::RunnerConfig,
    distributed::{
        barrier::{BarrierOutcome, CompletionBarrier},
        fs::JobLayout,
        poll::{Cancellation, Clock, PollError},
        util::hostname,
        Slot,
    },
    enumerate::{InstanceSource, WorkItem},
    evaluation::{self, EvaluationError, EvaluationReport, EvaluationRequest},
    executors::{
        isolated::{ExecutorError, Invocation, TaskExecutor},
        TaskBundle,
    },
    resolver::{obtain_instance_list, resolve, ResolveError},
};
use chrono::Utc;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{error, info, info_span, warn};

/// Errors that end a slot before its work is done
#[derive(Debug, Error)]
pub enum SlotFailure {
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error("Completion barrier was interrupted")]
    Barrier(#[from] PollError),
    #[error("Slot was stopped while running its instance")]
    Interrupted(#[source] ExecutorError),
    #[error("Aggregation failed")]
    Aggregate(#[from] AggregateError),
    #[error("Evaluation failed")]
    Evaluation(#[from] EvaluationError),
}

/// Per job settings shared by every slot
#[derive(Debug, Clone)]
pub struct SlotRun<'a> {
    pub config: &'a RunnerConfig,
    pub bundle: &'a TaskBundle,
    /// the barrier runner aggregates and evaluates after its own item
    pub end_to_end: bool,
    pub eval_env: &'a str,
}

/// What happened after the barrier, barrier runner only
#[derive(Debug)]
pub struct Finalization {
    pub barrier: BarrierOutcome,
    pub aggregate: AggregateSummary,
    pub evaluation: EvaluationReport,
}

#[derive(Debug)]
pub struct SlotOutcome {
    /// `None` if the slot is beyond the end of the instance list
    pub item: Option<WorkItem>,
    pub artifact: Option<PathBuf>,
    pub failure: Option<ExecutorError>,
    pub finalization: Option<Finalization>,
}

impl SlotOutcome {
    /// a failed item fails the slot even if the barrier runner finished the job afterwards
    pub fn exit_code(&self) -> i32 {
        if self.failure.is_some() {
            1
        } else {
            0
        }
    }
}

/// Run one slot of a job array from instance list to, for the barrier runner, evaluation
pub fn run_slot<S, C>(
    slot: &Slot,
    run: &SlotRun,
    source: &S,
    clock: &C,
    cancellation: &Cancellation,
) -> Result<SlotOutcome, SlotFailure>
where
    S: InstanceSource + ?Sized,
    C: Clock + ?Sized,
{
    let span = info_span!("slot", job = %slot.job, ordinal = slot.ordinal);
    let _entered = span.enter();

    info!(
        host = ?hostname(),
        array_size = slot.array_size,
        "Slot started"
    );

    let config = run.config;
    let layout = JobLayout::new(&config.state_root, &slot.job);
    let list = obtain_instance_list(
        slot,
        &layout,
        source,
        &run.bundle.dataset,
        &run.bundle.split,
        &config.polling.instance_list,
        clock,
        cancellation,
    )?;

    let mut outcome = SlotOutcome {
        item: resolve(&list, slot.ordinal).cloned(),
        artifact: None,
        failure: None,
        finalization: None,
    };

    match &outcome.item {
        Some(item) => {
            let executor =
                TaskExecutor::new(&config.workload, &config.isolation, &config.state_root);
            let invocation = Invocation {
                slot,
                item,
                layout: &layout,
                bundle: run.bundle,
            };

            match executor.invoke(&invocation, cancellation) {
                Ok(artifact) => outcome.artifact = Some(artifact),
                Err(failure @ ExecutorError::Cancelled { .. }) => {
                    return Err(SlotFailure::Interrupted(failure))
                }
                Err(failure) => {
                    error!(error = %failure, "Instance failed");
                    outcome.failure = Some(failure);
                }
            }
        }
        None => info!(
            "No instance for this slot, the list has only {} entries",
            list.len()
        ),
    }

    if !run.end_to_end {
        return Ok(outcome);
    }

    // the list length is bounded by the array size, which is a u32
    let expected = u32::try_from(list.len()).unwrap_or(u32::MAX);
    let Some(mut barrier) = CompletionBarrier::for_slot(
        slot,
        &layout,
        expected,
        config.polling.barrier,
    ) else {
        return Ok(outcome);
    };

    if outcome.failure.is_some() {
        // its artifact will never appear, the barrier can only end degraded
        warn!(
            missing = slot.ordinal,
            ceiling = ?config.polling.barrier.ceiling(),
            "Own instance failed, waiting for the siblings until the ceiling before finishing the job"
        );
    }

    let barrier = barrier.wait(clock, cancellation)?;
    let aggregate = Collector::job(layout.clone()).aggregate()?;

    let run_id = evaluation::run_id(Utc::now());
    let evaluation = evaluation::evaluate(
        &config.harness,
        &layout,
        EvaluationRequest {
            dataset: &run.bundle.dataset,
            split: &run.bundle.split,
            environment: run.eval_env,
            run_id: &run_id,
        },
    )?;

    outcome.finalization = Some(Finalization {
        barrier,
        aggregate,
        evaluation,
    });

    Ok(outcome)
}
