//! Cooperative process scheduler.
//!
//! One scheduler runs its processes on the calling thread, one at a time.
//! A dispatched process runs until it blocks, yields, sleeps, exits or
//! traps; there is no preemption. Between dispatches the scheduler wakes
//! processes whose timers have expired and consults its observers.
//!
//! Processes are removed from the process table while they run, so message
//! delivery and spawning during a dispatch never alias the running process.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Deserialize;
use tracing::{debug, trace, warn};

use crate::error::RuntimeError;
use crate::interpreter::{self, Outcome};
use crate::loader::{Loader, Symbol};
use crate::message::Payload;
use crate::module::Prototype;
use crate::process::{ExitReason, Process, ProcessConfig, ProcessState, Wait};
use crate::value::{Pid, SchedulerId, Value};

static NEXT_SCHEDULER_ID: AtomicU64 = AtomicU64::new(0);

/// Scheduler configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Configuration for every spawned process.
    pub process: ProcessConfig,
    /// Longest single sleep while waiting for a timer.
    pub idle_sleep_limit: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            process: ProcessConfig::default(),
            idle_sleep_limit: Duration::from_millis(10),
        }
    }
}

/// Lifecycle hooks. Every method has a no-op default.
pub trait Observer: Send {
    fn on_spawn(&mut self, _pid: Pid) {}

    fn on_exit(&mut self, _pid: Pid, _reason: &ExitReason) {}

    /// An uncaught error terminated `pid`. Called before `on_exit`.
    fn on_throw(&mut self, _pid: Pid, _error: &RuntimeError) {}

    /// Called once per dispatch. Returning `false` pauses the run loop.
    fn on_step(&mut self) -> bool {
        true
    }

    /// `pid` executed a `BRK` at `ip`.
    fn on_break(&mut self, _pid: Pid, _ip: usize) {}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// Result of a single scheduling step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepOutcome {
    /// A process ran until it blocked, yielded or exited.
    Ran(Pid),
    /// An observer asked to pause before dispatching.
    Interrupted,
    /// Nothing is ready.
    NothingReady,
}

/// Why `run` returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every process has exited.
    Idle,
    /// Processes remain but all wait for messages that cannot arrive.
    Stalled,
    /// An observer paused the scheduler.
    Interrupted,
}

pub struct Scheduler {
    id: SchedulerId,
    config: SchedulerConfig,
    loader: Arc<RwLock<Loader>>,
    processes: HashMap<Pid, Process>,
    ready: VecDeque<Pid>,
    blocked: HashSet<Pid>,
    exits: HashMap<Pid, ExitReason>,
    observers: Vec<(ObserverId, Box<dyn Observer>)>,
    next_pid: u64,
    next_observer: u64,
}

impl Scheduler {
    pub fn new(loader: Arc<RwLock<Loader>>) -> Self {
        Self::with_config(loader, SchedulerConfig::default())
    }

    pub fn with_config(loader: Arc<RwLock<Loader>>, config: SchedulerConfig) -> Self {
        Self {
            id: SchedulerId(NEXT_SCHEDULER_ID.fetch_add(1, Ordering::Relaxed)),
            config,
            loader,
            processes: HashMap::new(),
            ready: VecDeque::new(),
            blocked: HashSet::new(),
            exits: HashMap::new(),
            observers: Vec::new(),
            next_pid: 1,
            next_observer: 0,
        }
    }

    pub fn id(&self) -> SchedulerId {
        self.id
    }

    pub fn loader(&self) -> &Arc<RwLock<Loader>> {
        &self.loader
    }

    // ------------------------------------------------------------------
    // Observers
    // ------------------------------------------------------------------

    pub fn attach(&mut self, observer: Box<dyn Observer>) -> ObserverId {
        let id = ObserverId(self.next_observer);
        self.next_observer += 1;
        self.observers.push((id, observer));
        id
    }

    /// Remove an observer. Returns false if `id` is not attached.
    pub fn detach(&mut self, id: ObserverId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|(oid, _)| *oid != id);
        self.observers.len() != before
    }

    // ------------------------------------------------------------------
    // Process management
    // ------------------------------------------------------------------

    /// Spawn a process running `entry` with `args`.
    pub fn spawn(&mut self, entry: Arc<Prototype>, args: &[Payload]) -> Result<Pid, RuntimeError> {
        let callee = Payload::Closure {
            prototype: entry,
            upvalues: Vec::new(),
        };
        self.spawn_callable(&callee, args)
    }

    /// Spawn a process running the function `name` exported by `module`.
    pub fn spawn_export(&mut self, module: &str, name: &str, args: &[Payload]) -> Result<Pid, RuntimeError> {
        let symbol = self.loader.read().resolve(module, name)?;
        match symbol {
            Symbol::Function(prototype) => self.spawn(prototype, args),
            Symbol::Native(_) => Err(RuntimeError::NotCallable("native")),
        }
    }

    /// Spawn a process whose entry is an arbitrary callable payload.
    pub fn spawn_callable(&mut self, callee: &Payload, args: &[Payload]) -> Result<Pid, RuntimeError> {
        let pid = Pid(self.next_pid);
        let mut process = Process::init(pid, self.id, self.config.process.clone());
        process.start(callee, args)?;
        self.next_pid += 1;

        debug!(%pid, "process spawned");
        self.processes.insert(pid, process);
        self.ready.push_back(pid);
        for (_, observer) in &mut self.observers {
            observer.on_spawn(pid);
        }
        Ok(pid)
    }

    /// Deliver a message from outside any process.
    pub fn send(&mut self, to: Pid, payload: &Payload) {
        self.deliver(to, payload);
    }

    /// Terminate a process. It is removed from every wait structure before
    /// its memory is released.
    pub fn kill(&mut self, pid: Pid) -> bool {
        let Some(process) = self.processes.remove(&pid) else {
            return false;
        };
        self.ready.retain(|p| *p != pid);
        self.blocked.remove(&pid);
        self.finish(process, ExitReason::Killed);
        true
    }

    /// State of `pid`; `None` if it never existed here.
    pub fn state(&self, pid: Pid) -> Option<ProcessState> {
        if let Some(process) = self.processes.get(&pid) {
            return Some(process.state());
        }
        self.exits.get(&pid).map(|_| ProcessState::Exited)
    }

    pub fn exit_reason(&self, pid: Pid) -> Option<&ExitReason> {
        self.exits.get(&pid)
    }

    pub fn process(&self, pid: Pid) -> Option<&Process> {
        self.processes.get(&pid)
    }

    /// Number of processes that have not exited.
    pub fn live(&self) -> usize {
        self.processes.len()
    }

    pub fn ready_count(&self) -> usize {
        self.ready.len()
    }

    // ------------------------------------------------------------------
    // Run loop
    // ------------------------------------------------------------------

    /// Run until every process has exited, the remaining ones can make no
    /// progress, or an observer pauses the scheduler.
    pub fn run(&mut self) -> RunOutcome {
        loop {
            match self.step() {
                StepOutcome::Ran(_) => {}
                StepOutcome::Interrupted => return RunOutcome::Interrupted,
                StepOutcome::NothingReady => {
                    if self.processes.is_empty() {
                        return RunOutcome::Idle;
                    }
                    match self.next_deadline() {
                        Some(deadline) => {
                            let wait = deadline.saturating_duration_since(Instant::now());
                            std::thread::sleep(wait.min(self.config.idle_sleep_limit));
                        }
                        None => return RunOutcome::Stalled,
                    }
                }
            }
        }
    }

    /// Wake expired timers, then dispatch the next ready process.
    pub fn step(&mut self) -> StepOutcome {
        self.wake_expired(Instant::now());

        let Some(&pid) = self.ready.front() else {
            return StepOutcome::NothingReady;
        };
        let mut proceed = true;
        for (_, observer) in &mut self.observers {
            proceed &= observer.on_step();
        }
        if !proceed {
            return StepOutcome::Interrupted;
        }
        self.ready.pop_front();

        if let Some(process) = self.processes.remove(&pid) {
            self.dispatch(process);
        }
        StepOutcome::Ran(pid)
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.blocked
            .iter()
            .filter_map(|pid| self.processes.get(pid)?.wait?.deadline())
            .min()
    }

    fn wake_expired(&mut self, now: Instant) {
        let expired: Vec<Pid> = self
            .blocked
            .iter()
            .filter(|pid| {
                self.processes
                    .get(*pid)
                    .and_then(|p| p.wait)
                    .and_then(|w| w.deadline())
                    .is_some_and(|d| d <= now)
            })
            .copied()
            .collect();
        for pid in expired {
            trace!(%pid, "timer expired");
            self.make_ready(pid);
        }
    }

    fn make_ready(&mut self, pid: Pid) {
        if !self.blocked.remove(&pid) {
            return;
        }
        if let Some(process) = self.processes.get_mut(&pid) {
            process.wait = None;
            process.set_state(ProcessState::Ready);
            self.ready.push_back(pid);
        }
    }

    fn deliver(&mut self, to: Pid, payload: &Payload) {
        let Some(process) = self.processes.get_mut(&to) else {
            debug!(%to, "message to dead process dropped");
            return;
        };
        if let Err(err) = process.deliver(payload) {
            warn!(%to, error = %err, "message dropped");
            return;
        }
        if process.awaits_message() {
            self.make_ready(to);
        }
    }

    /// Run `process` until it leaves the running state.
    fn dispatch(&mut self, mut process: Process) {
        let pid = process.pid();
        process.set_state(ProcessState::Running);
        if process.heap.should_collect() {
            process.collect_garbage();
        }

        let loader = Arc::clone(&self.loader);
        let exit = {
            let loader = loader.read();
            loop {
                match interpreter::run(&mut process, &loader) {
                    Outcome::Send { to, payload } => {
                        if to == pid {
                            if let Err(err) = process.deliver(&payload) {
                                warn!(%to, error = %err, "message dropped");
                            }
                        } else {
                            self.deliver(to, &payload);
                        }
                    }
                    Outcome::Spawn {
                        callee,
                        args,
                        protected,
                    } => {
                        let spawned = self
                            .spawn_callable(&callee, &args)
                            .and_then(|child| process.stack.set(-1, Value::Pid(child)));
                        if let Err(err) = spawned {
                            let handled = if protected {
                                process.fail_protected_call(&err)
                            } else {
                                process.unwind(err)
                            };
                            if let Err(err) = handled {
                                break Some(ExitReason::Error(err));
                            }
                        }
                    }
                    Outcome::Break { ip } => {
                        for (_, observer) in &mut self.observers {
                            observer.on_break(pid, ip);
                        }
                    }
                    Outcome::Yield => {
                        process.set_state(ProcessState::Ready);
                        break None;
                    }
                    Outcome::Block { deadline } => {
                        process.wait = Some(Wait::Receive(deadline));
                        process.set_state(ProcessState::Blocked);
                        break None;
                    }
                    Outcome::Sleep(until) => {
                        process.wait = Some(Wait::Sleep(until));
                        process.set_state(ProcessState::Blocked);
                        break None;
                    }
                    Outcome::Exit(value) => {
                        break Some(match Payload::capture(value, &process.heap) {
                            Ok(payload) => ExitReason::Normal(payload),
                            Err(err) => ExitReason::Error(err),
                        });
                    }
                    Outcome::Trap(err) => break Some(ExitReason::Error(err)),
                }
            }
        };

        match exit {
            Some(reason) => {
                self.finish(process, reason);
                let reclaimed = self.loader.write().collect_garbage();
                if reclaimed > 0 {
                    debug!(reclaimed, "garbage modules reclaimed");
                }
            }
            None => {
                match process.state() {
                    ProcessState::Ready => self.ready.push_back(pid),
                    _ => {
                        self.blocked.insert(pid);
                    }
                }
                self.processes.insert(pid, process);
            }
        }
    }

    fn finish(&mut self, mut process: Process, reason: ExitReason) {
        let pid = process.pid();
        match &reason {
            ExitReason::Error(err) => {
                warn!(%pid, error = %err, "process terminated by error");
                for (_, observer) in &mut self.observers {
                    observer.on_throw(pid, err);
                }
            }
            _ => debug!(%pid, ?reason, "process exited"),
        }
        process.cleanup();
        for (_, observer) in &mut self.observers {
            observer.on_exit(pid, &reason);
        }
        self.exits.insert(pid, reason);
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("id", &self.id)
            .field("processes", &self.processes.len())
            .field("ready", &self.ready.len())
            .field("blocked", &self.blocked.len())
            .field("observers", &self.observers.len())
            .finish()
    }
}
