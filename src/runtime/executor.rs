//! Cooperative thread host.
//!
//! Runs workload closures as controlled operations. Every operation gets
//! its own OS thread, but a single gate guarantees that exactly one
//! operation executes between scheduling points; all others are parked on
//! the gate's condvar. The host feeds the instrumentation and lifecycle
//! callbacks of [`SchedulerCore`] and reaps threads cooperatively when an
//! iteration ends, times out or dies on a fatal error.

use crate::error::{IterationOutcome, SchedulerError};
use crate::operation::OperationId;
use crate::report::{IterationReport, RunReport};
use crate::runtime::{Configuration, SchedulerCore, SchedulingDecision};
use crate::scheduling::SchedulingPointType;
use crate::strategy::{self, SchedulingStrategy, GLOBAL_STRATEGY_REGISTRY};
use anyhow::{anyhow, Result};
use once_cell::sync::Lazy;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

/// Panic payload used to reap an operation thread without reporting a bug.
struct OperationAborted;

/// Silences the default panic output for deliberate abort unwinds. The
/// hook chains to the previous one for every other payload.
static SILENCE_ABORT_UNWINDS: Lazy<()> = Lazy::new(|| {
    let previous = panic::take_hook();
    panic::set_hook(Box::new(move |info| {
        if info.payload().downcast_ref::<OperationAborted>().is_none() {
            previous(info);
        }
    }));
});

struct HostState {
    core: SchedulerCore,
    /// Iteration fence; threads from older epochs must not touch state.
    epoch: u64,
    /// The single operation currently allowed to execute.
    running: Option<OperationId>,
    outcome: Option<IterationOutcome>,
    fatal: Option<SchedulerError>,
    live_threads: usize,
}

struct Shared {
    state: Mutex<HostState>,
    cond: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().expect("host state lock poisoned")
    }
}

fn iteration_over(state: &HostState, epoch: u64) -> bool {
    state.epoch != epoch || state.outcome.is_some() || state.fatal.is_some()
}

fn apply_decision(state: &mut HostState, decision: Result<SchedulingDecision, SchedulerError>) {
    match decision {
        Ok(SchedulingDecision::Resume(next)) => state.running = Some(next),
        Ok(SchedulingDecision::Finished(outcome)) => {
            state.outcome = Some(outcome);
            state.running = None;
        }
        Err(err) => {
            log::error!("fatal scheduler error: {}", err);
            state.fatal = Some(err);
            state.running = None;
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "opaque panic payload".to_string()
    }
}

/// Per-operation handle passed to workload closures. Cloning is cheap;
/// clones keep referring to the same operation.
#[derive(Clone)]
pub struct RuntimeHandle {
    shared: Arc<Shared>,
    op: OperationId,
    epoch: u64,
}

impl RuntimeHandle {
    /// Id of the controlled operation this handle belongs to.
    pub fn id(&self) -> OperationId {
        self.op
    }

    /// Spawn a new controlled operation running `body`. The spawn itself
    /// is a `Create` scheduling point for the calling operation.
    pub fn spawn<F>(&self, call_site: &str, body: F) -> OperationId
    where
        F: FnOnce(RuntimeHandle) + Send + 'static,
    {
        let child = {
            let mut state = self.abort_if_over(self.shared.lock());
            match state.core.create_operation(self.op) {
                Ok(id) => {
                    state.live_threads += 1;
                    id
                }
                Err(err) => {
                    apply_decision(&mut state, Err(err));
                    self.shared.cond.notify_all();
                    drop(state);
                    panic::panic_any(OperationAborted)
                }
            }
        };

        let shared = Arc::clone(&self.shared);
        let epoch = self.epoch;
        thread::spawn(move || operation_main(shared, epoch, child, body));

        self.point(SchedulingPointType::Create, None, call_site);
        child
    }

    /// Record a read of `key` at a scheduling point.
    pub fn read(&self, key: &str, call_site: &str) {
        self.point(SchedulingPointType::Read, Some(key.to_string()), call_site);
    }

    /// Record a write of `key` at a scheduling point.
    pub fn write(&self, key: &str, call_site: &str) {
        self.point(SchedulingPointType::Write, Some(key.to_string()), call_site);
    }

    /// Cooperatively yield to the scheduler.
    pub fn yield_now(&self, call_site: &str) {
        self.point(SchedulingPointType::Yield, None, call_site);
    }

    /// Request explicit interleaving, disabling shared-state reduction for
    /// this step.
    pub fn interleave(&self, call_site: &str) {
        self.point(SchedulingPointType::Interleave, None, call_site);
    }

    /// Hit a scheduling point of an arbitrary kind.
    pub fn schedule_point(&self, point: SchedulingPointType, call_site: &str) {
        self.point(point, None, call_site);
    }

    fn point(&self, point: SchedulingPointType, key: Option<String>, call_site: &str) {
        let mut state = self.abort_if_over(self.shared.lock());
        let decision =
            state
                .core
                .on_scheduling_point(self.op, point, key, None, call_site.to_string(), 0);
        apply_decision(&mut state, decision);
        self.shared.cond.notify_all();
        self.park_until_resumed(state);
    }

    /// Block the current operation until another operation unblocks it.
    fn block(&self, reason: &str) {
        let mut state = self.abort_if_over(self.shared.lock());
        let decision = state.core.on_block(self.op, reason);
        apply_decision(&mut state, decision);
        self.shared.cond.notify_all();
        self.park_until_resumed(state);
    }

    fn unblock_all(&self, waiters: &[OperationId]) {
        let mut state = self.abort_if_over(self.shared.lock());
        for &waiter in waiters {
            if let Err(err) = state.core.on_unblock(waiter) {
                apply_decision(&mut state, Err(err));
                self.shared.cond.notify_all();
                drop(state);
                panic::panic_any(OperationAborted);
            }
        }
    }

    /// Wait on the gate until this operation is the running one. Unwinds
    /// when the iteration ended underneath us.
    fn park_until_resumed(&self, mut state: MutexGuard<'_, HostState>) {
        loop {
            if iteration_over(&state, self.epoch) {
                drop(state);
                panic::panic_any(OperationAborted);
            }
            if state.running == Some(self.op) {
                return;
            }
            state = self
                .shared
                .cond
                .wait(state)
                .expect("host state lock poisoned");
        }
    }

    /// Hand the guard back unless the iteration ended underneath us, in
    /// which case the guard is released before unwinding so the host lock
    /// is never poisoned.
    fn abort_if_over<'a>(&self, state: MutexGuard<'a, HostState>) -> MutexGuard<'a, HostState> {
        if iteration_over(&state, self.epoch) {
            drop(state);
            panic::panic_any(OperationAborted)
        }
        state
    }
}

/// One-shot event usable from workloads. Waiting blocks the calling
/// operation until another operation sets the signal; setting wakes all
/// waiters. Once set, the signal stays set.
#[derive(Clone, Default)]
pub struct Signal {
    inner: Arc<Mutex<SignalState>>,
}

#[derive(Default)]
struct SignalState {
    is_set: bool,
    waiters: Vec<OperationId>,
}

impl Signal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block `handle`'s operation until the signal is set. A set signal
    /// degrades to a plain acquire scheduling point.
    pub fn wait(&self, handle: &RuntimeHandle, call_site: &str) {
        // Exactly one operation executes at a time, so checking and
        // registering cannot race with `set`.
        let is_set = self.inner.lock().expect("signal lock poisoned").is_set;
        if is_set {
            handle.point(SchedulingPointType::Acquire, None, call_site);
            return;
        }
        self.inner
            .lock()
            .expect("signal lock poisoned")
            .waiters
            .push(handle.id());
        handle.block("signal wait");
    }

    /// Set the signal and unblock every waiting operation.
    pub fn set(&self, handle: &RuntimeHandle, call_site: &str) {
        let waiters: Vec<OperationId> = {
            let mut inner = self.inner.lock().expect("signal lock poisoned");
            inner.is_set = true;
            std::mem::take(&mut inner.waiters)
        };
        handle.unblock_all(&waiters);
        handle.point(SchedulingPointType::Release, None, call_site);
    }

    /// True once the signal has been set.
    pub fn is_set(&self) -> bool {
        self.inner.lock().expect("signal lock poisoned").is_set
    }
}

fn operation_main<F>(shared: Arc<Shared>, epoch: u64, op: OperationId, body: F)
where
    F: FnOnce(RuntimeHandle),
{
    // Park until the scheduler hands control to this operation.
    {
        let mut state = shared.lock();
        loop {
            if iteration_over(&state, epoch) {
                if state.epoch == epoch {
                    state.live_threads -= 1;
                }
                shared.cond.notify_all();
                return;
            }
            if state.running == Some(op) {
                break;
            }
            state = shared.cond.wait(state).expect("host state lock poisoned");
        }
    }

    let handle = RuntimeHandle {
        shared: Arc::clone(&shared),
        op,
        epoch,
    };
    let result = panic::catch_unwind(AssertUnwindSafe(move || body(handle)));

    let mut state = shared.lock();
    match result {
        Ok(()) => {
            if !iteration_over(&state, epoch) {
                let decision = state.core.on_complete(op);
                apply_decision(&mut state, decision);
            }
        }
        Err(payload) => {
            if payload.downcast_ref::<OperationAborted>().is_none()
                && !iteration_over(&state, epoch)
            {
                let message = panic_message(payload.as_ref());
                log::warn!("operation {} hit a bug: {}", op, message);
                state.outcome = Some(IterationOutcome::BugFound { message });
                state.running = None;
            }
        }
    }
    if state.epoch == epoch {
        state.live_threads -= 1;
    }
    shared.cond.notify_all();
}

/// Drives a workload through systematically explored iterations.
pub struct TestRunner {
    config: Configuration,
    shared: Arc<Shared>,
}

impl TestRunner {
    /// Build a runner with the strategy named by the configuration.
    /// Rejects invalid configurations before any iteration runs.
    pub fn new(config: Configuration) -> Result<Self> {
        strategy::register_defaults_to_global();
        let strategy = GLOBAL_STRATEGY_REGISTRY
            .create(config.strategy_kind.as_str(), config.seed)
            .ok_or_else(|| {
                anyhow!(
                    "strategy kind {:?} is not registered",
                    config.strategy_kind
                )
            })?;
        Self::with_strategy(config, strategy)
    }

    /// Build a runner around an explicit strategy instance.
    pub fn with_strategy(
        config: Configuration,
        strategy: Box<dyn SchedulingStrategy>,
    ) -> Result<Self> {
        if config.iteration_count == 0 {
            return Err(anyhow!("iteration_count must be at least 1"));
        }
        if config.max_scheduling_steps == 0 {
            return Err(anyhow!("max_scheduling_steps must be at least 1"));
        }
        Lazy::force(&SILENCE_ABORT_UNWINDS);
        let core = SchedulerCore::new(config.clone(), strategy);
        Ok(Self {
            config,
            shared: Arc::new(Shared {
                state: Mutex::new(HostState {
                    core,
                    epoch: 0,
                    running: None,
                    outcome: None,
                    fatal: None,
                    live_threads: 0,
                }),
                cond: Condvar::new(),
            }),
        })
    }

    /// Explore the workload for the configured number of iterations and
    /// return the accumulated report. Scheduler misuse aborts the run.
    pub fn run<F>(&mut self, workload: F) -> Result<RunReport>
    where
        F: Fn(RuntimeHandle) + Send + Sync + 'static,
    {
        let workload = Arc::new(workload);
        let mut iterations = Vec::with_capacity(self.config.iteration_count as usize);

        for _ in 0..self.config.iteration_count {
            let iteration = self.run_iteration(Arc::clone(&workload))?;
            log::info!(
                "iteration {}: {:?} after {} steps",
                iteration.iteration,
                iteration.outcome,
                iteration.steps
            );
            iterations.push(iteration);
        }

        let state = self.shared.lock();
        Ok(RunReport::new(
            &self.config,
            state.core.strategy_description(),
            iterations,
            state.core.graph(),
        ))
    }

    fn run_iteration<F>(&mut self, workload: Arc<F>) -> Result<IterationReport>
    where
        F: Fn(RuntimeHandle) + Send + Sync + 'static,
    {
        let (root, epoch, iteration) = {
            let mut state = self.shared.lock();
            state.epoch += 1;
            state.outcome = None;
            state.fatal = None;
            state.live_threads = 1;
            let iteration = state.core.iteration();
            let root = state.core.start_iteration()?;
            state.running = Some(root);
            (root, state.epoch, iteration)
        };

        let shared = Arc::clone(&self.shared);
        thread::spawn(move || operation_main(shared, epoch, root, move |handle| workload(handle)));

        let deadline = Instant::now() + self.config.timeout;
        let mut state = self.shared.lock();
        loop {
            if state.outcome.is_some() || state.fatal.is_some() {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                log::warn!("iteration {}: deadline exceeded", iteration);
                state.outcome = Some(IterationOutcome::Timeout);
                state.running = None;
                self.shared.cond.notify_all();
                break;
            }
            let (next, _timed_out) = self
                .shared
                .cond
                .wait_timeout(state, deadline - now)
                .expect("host state lock poisoned");
            state = next;
        }

        // Give reaped threads a short grace period to drain; operations
        // stalled inside user code are fenced off by the epoch and left
        // behind.
        let grace = Instant::now() + Duration::from_millis(500);
        while state.live_threads > 0 {
            let now = Instant::now();
            if now >= grace {
                log::warn!(
                    "iteration {}: {} operation threads still live after teardown",
                    iteration,
                    state.live_threads
                );
                break;
            }
            let (next, _timed_out) = self
                .shared
                .cond
                .wait_timeout(state, grace - now)
                .expect("host state lock poisoned");
            state = next;
        }

        // Fence off stragglers stalled inside user code before touching
        // the core; they abort at their next scheduling point.
        state.epoch += 1;

        if let Some(fatal) = state.fatal.take() {
            return Err(fatal.into());
        }
        let outcome = state.outcome.take().unwrap_or(IterationOutcome::Timeout);
        let steps = state.core.step();
        let trace = state.core.finish_iteration();
        Ok(IterationReport::new(iteration, outcome, steps, trace))
    }
}
