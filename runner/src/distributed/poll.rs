//! Bounded polling for conditions on the shared file system.
//!
//! The shared medium has no notification primitive, so every wait in the array is a loop of
//! probe, sleep, probe with a hard ceiling. The interval may grow exponentially, and the wait is
//! abandoned as soon as the process is asked to terminate.

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::{debug, trace};

/// upper bound for a single sleep, keeps cancellation latency low with long intervals
pub(crate) const CANCELLATION_CHECK: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum PollError {
    #[error("Waiting was cancelled after {0:?}")]
    Cancelled(Duration),
    #[error("Failed to install termination handler")]
    SignalHandler(#[from] nix::Error),
}

/// Interval and ceiling of a bounded wait, in seconds
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PollBudget {
    pub interval: u64,
    pub ceiling: u64,
    /// factor applied to the interval after every probe, 1.0 keeps it fixed
    #[serde(default = "default_backoff")]
    pub backoff: f64,
    /// cap for the grown interval, defaults to the ceiling
    #[serde(default)]
    pub max_interval: Option<u64>,
}

fn default_backoff() -> f64 {
    1.0
}

impl PollBudget {
    pub fn fixed(interval: u64, ceiling: u64) -> Self {
        Self {
            interval,
            ceiling,
            backoff: 1.0,
            max_interval: None,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval)
    }

    pub fn ceiling(&self) -> Duration {
        Duration::from_secs(self.ceiling)
    }

    fn next_interval(&self, current: Duration) -> Duration {
        let cap = Duration::from_secs(self.max_interval.unwrap_or(self.ceiling).max(1));

        if self.backoff <= 1.0 {
            current
        } else {
            current.mul_f64(self.backoff).min(cap)
        }
    }
}

/// Source of time for polling loops, virtual in tests
pub trait Clock {
    /// time since the clock was created
    fn elapsed(&self) -> Duration;
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone)]
pub struct SystemClock {
    start: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        thread::sleep(duration)
    }
}

static PROCESS_CANCELLATION: OnceCell<Arc<AtomicBool>> = OnceCell::new();

extern "C" fn on_terminate(_signal: nix::libc::c_int) {
    if let Some(flag) = PROCESS_CANCELLATION.get() {
        flag.store(true, Ordering::SeqCst);
    }
}

/// Cooperative cancellation flag checked by every polling loop
#[derive(Debug, Clone, Default)]
pub struct Cancellation {
    flag: Arc<AtomicBool>,
}

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flag tied to the lifecycle of this process: the scheduler cancels array tasks with
    /// SIGTERM, interactive runs are stopped with SIGINT.
    pub fn for_process() -> Result<Self, PollError> {
        let flag = PROCESS_CANCELLATION
            .get_or_init(|| Arc::new(AtomicBool::new(false)))
            .clone();
        let action = SigAction::new(
            SigHandler::Handler(on_terminate),
            SaFlags::empty(),
            SigSet::empty(),
        );

        // SAFETY: the handler only performs an atomic store on an already initialized flag
        unsafe {
            sigaction(Signal::SIGTERM, &action)?;
            sigaction(Signal::SIGINT, &action)?;
        }

        Ok(Self { flag })
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Result of a single probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe<T, P> {
    Ready(T),
    /// not there yet, carries what is known so far
    Pending(P),
}

/// Result of a bounded wait
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Awaited<T, P> {
    Ready { value: T, waited: Duration, probes: u32 },
    /// the ceiling elapsed, carries the result of the last probe
    Expired { pending: P, waited: Duration, probes: u32 },
}

/// Probe until `probe` is ready or the ceiling of `budget` has elapsed.
///
/// The first probe happens immediately and the last one exactly at the ceiling, so an expired
/// wait took the full ceiling and a successful one is detected at most one interval late.
pub fn await_predicate<T, P, E, C, F>(
    budget: &PollBudget,
    clock: &C,
    cancellation: &Cancellation,
    mut probe: F,
) -> Result<Awaited<T, P>, E>
where
    C: Clock + ?Sized,
    E: From<PollError>,
    F: FnMut() -> Result<Probe<T, P>, E>,
{
    let start = clock.elapsed();
    let ceiling = budget.ceiling();
    let mut interval = budget.interval().max(Duration::from_millis(1));
    let mut probes = 0;

    loop {
        probes += 1;
        let waited = clock.elapsed().saturating_sub(start);

        match probe()? {
            Probe::Ready(value) => {
                debug!(?waited, probes, "Condition met");

                return Ok(Awaited::Ready {
                    value,
                    waited,
                    probes,
                });
            }
            Probe::Pending(pending) if waited >= ceiling => {
                debug!(?waited, probes, "Wait ceiling elapsed");

                return Ok(Awaited::Expired {
                    pending,
                    waited,
                    probes,
                });
            }
            Probe::Pending(_) => {}
        }

        let step = interval.min(ceiling - waited);
        trace!(?step, ?waited, "Condition not met, sleeping");
        sleep_cancellable(clock, cancellation, step, start)?;

        interval = budget.next_interval(interval);
    }
}

fn sleep_cancellable<C: Clock + ?Sized>(
    clock: &C,
    cancellation: &Cancellation,
    duration: Duration,
    start: Duration,
) -> Result<(), PollError> {
    let mut remaining = duration;

    while !remaining.is_zero() {
        if cancellation.is_cancelled() {
            return Err(PollError::Cancelled(clock.elapsed().saturating_sub(start)));
        }

        let step = remaining.min(CANCELLATION_CHECK);
        clock.sleep(step);
        remaining -= step;
    }

    if cancellation.is_cancelled() {
        Err(PollError::Cancelled(clock.elapsed().saturating_sub(start)))
    } else {
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::Clock;
    use std::{cell::RefCell, time::Duration};

    /// Virtual clock, sleeping advances time and runs the registered hooks
    pub struct ManualClock {
        now: RefCell<Duration>,
        hooks: RefCell<Vec<(Duration, Box<dyn FnOnce()>)>>,
    }

    impl ManualClock {
        pub fn new() -> Self {
            Self {
                now: RefCell::new(Duration::ZERO),
                hooks: RefCell::new(Vec::new()),
            }
        }

        /// run `hook` once virtual time reaches `at`
        pub fn at(&self, at: Duration, hook: impl FnOnce() + 'static) {
            self.hooks.borrow_mut().push((at, Box::new(hook)));
        }

        pub fn now(&self) -> Duration {
            *self.now.borrow()
        }

        fn fire(&self) {
            let now = self.now();
            let due = {
                let mut hooks = self.hooks.borrow_mut();
                let (due, pending): (Vec<_>, Vec<_>) =
                    hooks.drain(..).partition(|(at, _)| *at <= now);
                *hooks = pending;
                due
            };

            for (_, hook) in due {
                hook();
            }
        }
    }

    impl Clock for ManualClock {
        fn elapsed(&self) -> Duration {
            self.fire();
            self.now()
        }

        fn sleep(&self, duration: Duration) {
            *self.now.borrow_mut() += duration;
            self.fire();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{testing::ManualClock, *};
    use std::{cell::Cell, rc::Rc};

    fn wait(
        budget: &PollBudget,
        clock: &ManualClock,
        ready_at: Duration,
    ) -> Result<Awaited<Duration, u32>, PollError> {
        let cancellation = Cancellation::new();
        let mut pending = 0;

        await_predicate(budget, clock, &cancellation, || {
            if clock.now() >= ready_at {
                Ok(Probe::Ready(clock.now()))
            } else {
                pending += 1;
                Ok(Probe::Pending(pending))
            }
        })
    }

    #[test]
    fn ready_immediately() {
        let clock = ManualClock::new();
        let result = wait(&PollBudget::fixed(5, 300), &clock, Duration::ZERO).unwrap();

        assert_eq!(
            result,
            Awaited::Ready {
                value: Duration::ZERO,
                waited: Duration::ZERO,
                probes: 1
            }
        );
    }

    #[test]
    fn detected_on_the_next_probe() {
        let clock = ManualClock::new();
        let result = wait(&PollBudget::fixed(5, 300), &clock, Duration::from_secs(12)).unwrap();

        match result {
            Awaited::Ready { waited, probes, .. } => {
                assert_eq!(waited, Duration::from_secs(15));
                assert_eq!(probes, 4);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn expires_exactly_at_the_ceiling() {
        let clock = ManualClock::new();
        let result = wait(&PollBudget::fixed(10, 60), &clock, Duration::MAX).unwrap();

        assert_eq!(
            result,
            Awaited::Expired {
                pending: 7,
                waited: Duration::from_secs(60),
                probes: 7
            }
        );
    }

    #[test]
    fn last_step_is_clamped_to_the_ceiling() {
        let clock = ManualClock::new();
        let result = wait(&PollBudget::fixed(7, 20), &clock, Duration::MAX).unwrap();

        // probes at 0, 7, 14 and 20
        assert!(matches!(
            result,
            Awaited::Expired { probes: 4, waited, .. } if waited == Duration::from_secs(20)
        ));
    }

    #[test]
    fn backoff_grows_the_interval_up_to_the_cap() {
        let clock = ManualClock::new();
        let budget = PollBudget {
            interval: 1,
            ceiling: 100,
            backoff: 2.0,
            max_interval: Some(8),
        };
        let cancellation = Cancellation::new();
        let mut seen = Vec::new();

        let result: Result<Awaited<(), ()>, PollError> =
            await_predicate(&budget, &clock, &cancellation, || {
                seen.push(clock.now().as_secs());
                Ok(Probe::Pending(()))
            });

        assert!(matches!(result, Ok(Awaited::Expired { .. })));
        assert_eq!(&seen[..7], &[0, 1, 3, 7, 15, 23, 31]);
        assert_eq!(*seen.last().unwrap(), 100);
    }

    #[test]
    fn cancellation_stops_the_wait() {
        let clock = ManualClock::new();
        let cancellation = Cancellation::new();
        let trigger = cancellation.clone();
        clock.at(Duration::from_secs(42), move || trigger.cancel());
        let probes = Rc::new(Cell::new(0));
        let counter = probes.clone();

        let result: Result<Awaited<(), ()>, PollError> = await_predicate(
            &PollBudget::fixed(30, 3600),
            &clock,
            &cancellation,
            || {
                counter.set(counter.get() + 1);
                Ok(Probe::Pending(()))
            },
        );

        match result {
            Err(PollError::Cancelled(after)) => assert_eq!(after, Duration::from_secs(42)),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(probes.get(), 2);
    }

    #[test]
    fn budget_from_yaml_defaults_to_fixed_interval() {
        let budget: PollBudget = serde_yaml::from_str("interval: 30\nceiling: 3600\n").unwrap();

        assert_eq!(budget, PollBudget::fixed(30, 3600));
    }
}
