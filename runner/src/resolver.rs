use crate::{
    distributed::{
        fs::JobLayout,
        poll::{await_predicate, Awaited, Cancellation, Clock, PollBudget, PollError, Probe},
        Slot,
    },
    enumerate::{publish_instance_list, EnumerationError, InstanceList, InstanceSource, WorkItem},
};
use std::{
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tracing::{info, instrument};

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("Failed to obtain the instance list")]
    Enumeration(#[from] EnumerationError),
    #[error("Instance list {path:?} did not appear within {waited:?}")]
    ListTimeout { path: PathBuf, waited: Duration },
    #[error(transparent)]
    Poll(#[from] PollError),
}

/// work item owned by `ordinal`, `None` means the slot has nothing to do
pub fn resolve(list: &InstanceList, ordinal: u32) -> Option<&WorkItem> {
    list.get(ordinal)
}

/// Obtain the instance list of the job according to the role of the slot: the setup leader
/// enumerates and publishes it, every other slot waits until it is published.
#[instrument(skip_all, fields(ordinal = slot.ordinal), level = "info")]
#[allow(clippy::too_many_arguments)]
pub fn obtain_instance_list<S, C>(
    slot: &Slot,
    layout: &JobLayout,
    source: &S,
    dataset: &str,
    split: &str,
    budget: &PollBudget,
    clock: &C,
    cancellation: &Cancellation,
) -> Result<InstanceList, ResolveError>
where
    S: InstanceSource + ?Sized,
    C: Clock + ?Sized,
{
    let path = layout.instance_list();

    if slot.is_setup_leader() {
        layout.ensure().map_err(EnumerationError::Io)?;

        return Ok(publish_instance_list(source, &path, dataset, split)?);
    }

    await_instance_list(&path, budget, clock, cancellation)
}

/// wait for a published list, exceeding the ceiling is fatal since the slot cannot know its item
pub fn await_instance_list<C: Clock + ?Sized>(
    path: &Path,
    budget: &PollBudget,
    clock: &C,
    cancellation: &Cancellation,
) -> Result<InstanceList, ResolveError> {
    let awaited = await_predicate(budget, clock, cancellation, || {
        if path.exists() {
            Ok::<_, ResolveError>(Probe::Ready(InstanceList::load(path)?))
        } else {
            Ok(Probe::Pending(()))
        }
    })?;

    match awaited {
        Awaited::Ready { value, waited, .. } => {
            info!(?waited, "Instance list with {} instances is available", value.len());

            Ok(value)
        }
        Awaited::Expired { waited, .. } => Err(ResolveError::ListTimeout {
            path: path.to_path_buf(),
            waited,
        }),
    }
}
