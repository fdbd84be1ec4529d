//! Program lifecycle: one main execution per manager, a cancellable thread
//! group for ad-hoc async work, a worker pool, and the fatal-error funnel.

use std::{
    any::Any,
    io, mem,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::{Condvar, Mutex, RwLock};
use thiserror::Error;
use tracing::{debug, error, trace, warn};

use crate::{
    diagnostics::{CodeError, ErrorKind, QuillError},
    output::OutputSink,
    runtime::{Context, Interpreter, RuntimeConfig},
    value::Value,
};

static NEXT_MANAGER_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProgramState {
    Idle,
    Running,
    Errored,
    Stopped,
}

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("a program is already running on this manager")]
    AlreadyRunning,
    #[error("context is owned by another thread manager")]
    ForeignContext,
    #[error("failed to spawn thread: {0}")]
    Spawn(#[from] io::Error),
    #[error("program thread ended without producing a result")]
    Disconnected,
}

/// A host-level fault (a panic) caught on a program or async thread.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("fatal error on thread `{thread}`: {message}")]
pub struct FatalError {
    pub thread: String,
    pub message: String,
}

/// Anything that can end a thread run by the manager.
#[derive(Debug, Clone)]
pub enum Failure {
    Code(CodeError),
    Fatal(FatalError),
}

/// Receives fatal errors together with the source text of the program.
pub type FatalHandler = Arc<dyn Fn(&FatalError, &str) + Send + Sync>;
pub type StateListener = Arc<dyn Fn(ProgramState) + Send + Sync>;
type ShutdownCallback = Box<dyn FnOnce() + Send>;
type Job = Box<dyn FnOnce() + Send>;

/// Cooperative cancellation flag checked at loop heads, calls and sleeps.
#[derive(Clone, Default)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
}

#[derive(Default)]
struct TokenInner {
    cancelled: AtomicBool,
    lock: Mutex<()>,
    wake: Condvar,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        let _guard = self.inner.lock.lock();
        self.inner.wake.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Sleeps for `duration`, waking early with `Interrupted` on cancellation.
    pub fn sleep(&self, duration: Duration) -> Result<(), CodeError> {
        let deadline = Instant::now() + duration;
        let mut guard = self.inner.lock.lock();
        loop {
            if self.is_cancelled() {
                return Err(CodeError::interrupted());
            }
            if Instant::now() >= deadline {
                return Ok(());
            }
            self.inner.wake.wait_until(&mut guard, deadline);
        }
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Threads belonging to one program run, cancelled together.
#[derive(Debug, Clone)]
pub struct ThreadGroup {
    name: String,
    token: CancellationToken,
    generation: u64,
}

impl ThreadGroup {
    pub fn new(name: impl Into<String>, generation: u64) -> Self {
        Self {
            name: name.into(),
            token: CancellationToken::new(),
            generation,
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn interrupt(&self) {
        self.token.cancel();
    }

    pub fn spawn<F>(&self, label: &str, stack_size: usize, job: F) -> io::Result<JoinHandle<()>>
    where
        F: FnOnce() + Send + 'static,
    {
        thread::Builder::new()
            .name(format!("{}-{}-{label}", self.name, self.generation))
            .stack_size(stack_size)
            .spawn(job)
    }
}

/// Unbounded pool with a direct hand-off queue: a submission either meets an
/// idle worker or starts a new one. Surplus workers retire after sitting idle.
pub struct WorkerPool {
    name: String,
    sender: Mutex<Option<Sender<Job>>>,
    receiver: Receiver<Job>,
    live: Arc<AtomicUsize>,
    core_size: usize,
    idle_timeout: Duration,
    stack_size: usize,
}

impl WorkerPool {
    pub fn new(name: impl Into<String>, config: &RuntimeConfig) -> Self {
        let (sender, receiver) = channel::bounded(0);
        Self {
            name: name.into(),
            sender: Mutex::new(Some(sender)),
            receiver,
            live: Arc::new(AtomicUsize::new(0)),
            core_size: config.pool_core_size,
            idle_timeout: config.pool_idle_timeout,
            stack_size: config.thread_stack_size,
        }
    }

    pub fn live_workers(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn is_shutdown(&self) -> bool {
        self.sender.lock().is_none()
    }

    pub fn submit(&self, job: impl FnOnce() + Send + 'static) -> Result<(), ManagerError> {
        let sender = self
            .sender
            .lock()
            .clone()
            .ok_or(ManagerError::Disconnected)?;
        match sender.try_send(Box::new(job)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(job)) => self.spawn_worker(job),
            Err(TrySendError::Disconnected(_)) => Err(ManagerError::Disconnected),
        }
    }

    /// Closes the queue. Idle workers exit; busy ones finish their job first.
    pub fn shutdown_now(&self) {
        if self.sender.lock().take().is_some() {
            debug!(pool = %self.name, workers = self.live_workers(), "pool shut down");
        }
    }

    fn spawn_worker(&self, first: Job) -> Result<(), ManagerError> {
        let receiver = self.receiver.clone();
        let live = Arc::clone(&self.live);
        let core_size = self.core_size;
        let idle_timeout = self.idle_timeout;
        let pool = self.name.clone();
        let count = live.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(pool = %pool, workers = count, "pool worker started");

        let spawned = thread::Builder::new()
            .name(format!("{pool}-worker"))
            .stack_size(self.stack_size)
            .spawn(move || {
                run_job(first);
                loop {
                    match receiver.recv_timeout(idle_timeout) {
                        Ok(job) => run_job(job),
                        Err(RecvTimeoutError::Timeout) => {
                            let current = live.load(Ordering::SeqCst);
                            if current > core_size
                                && live
                                    .compare_exchange(
                                        current,
                                        current - 1,
                                        Ordering::SeqCst,
                                        Ordering::SeqCst,
                                    )
                                    .is_ok()
                            {
                                debug!(pool = %pool, workers = current - 1, "idle worker retired");
                                break;
                            }
                        }
                        Err(RecvTimeoutError::Disconnected) => {
                            live.fetch_sub(1, Ordering::SeqCst);
                            break;
                        }
                    }
                }
            });
        match spawned {
            Ok(_) => Ok(()),
            Err(err) => {
                self.live.fetch_sub(1, Ordering::SeqCst);
                Err(ManagerError::Spawn(err))
            }
        }
    }
}

fn run_job(job: Job) {
    if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
        warn!("pool job panicked outside the manager funnel");
    }
}

struct Generation {
    group: ThreadGroup,
    pool: Arc<WorkerPool>,
}

impl Generation {
    fn new(config: &RuntimeConfig, id: u64, generation: u64) -> Self {
        let name = format!("quill-{id}");
        Self {
            group: ThreadGroup::new(name.clone(), generation),
            pool: Arc::new(WorkerPool::new(format!("{name}-pool"), config)),
        }
    }
}

pub struct ManagerShared {
    id: u64,
    config: RuntimeConfig,
    state: Mutex<ProgramState>,
    current: Mutex<Generation>,
    source: Mutex<Arc<str>>,
    stopping: AtomicBool,
    shutdown_callbacks: Mutex<Vec<ShutdownCallback>>,
    fatal_handler: RwLock<FatalHandler>,
    listeners: RwLock<Vec<StateListener>>,
}

/// Runs programs on dedicated threads and owns everything they spawn.
#[derive(Clone)]
pub struct ThreadManager {
    shared: Arc<ManagerShared>,
}

impl ThreadManager {
    pub fn new(config: RuntimeConfig) -> Self {
        let id = NEXT_MANAGER_ID.fetch_add(1, Ordering::SeqCst);
        let default_handler: FatalHandler = Arc::new(|err: &FatalError, _source: &str| {
            error!(thread = %err.thread, "{}", err.message);
            eprintln!("{err}");
        });
        Self {
            shared: Arc::new(ManagerShared {
                id,
                current: Mutex::new(Generation::new(&config, id, 0)),
                config,
                state: Mutex::new(ProgramState::Idle),
                source: Mutex::new(Arc::from("")),
                stopping: AtomicBool::new(false),
                shutdown_callbacks: Mutex::new(Vec::new()),
                fatal_handler: RwLock::new(default_handler),
                listeners: RwLock::new(Vec::new()),
            }),
        }
    }

    pub(crate) fn from_shared(shared: Arc<ManagerShared>) -> Self {
        Self { shared }
    }

    pub fn state(&self) -> ProgramState {
        *self.shared.state.lock()
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.shared.config
    }

    pub fn set_fatal_handler(&self, handler: impl Fn(&FatalError, &str) + Send + Sync + 'static) {
        *self.shared.fatal_handler.write() = Arc::new(handler);
    }

    pub fn add_state_listener(&self, listener: impl Fn(ProgramState) + Send + Sync + 'static) {
        self.shared.listeners.write().push(Arc::new(listener));
    }

    /// Registers a callback run once by the next [`ThreadManager::stop`].
    pub fn add_shutdown_callback(&self, callback: impl FnOnce() + Send + 'static) {
        self.shared.shutdown_callbacks.lock().push(Box::new(callback));
    }

    pub fn pending_shutdown_callbacks(&self) -> usize {
        self.shared.shutdown_callbacks.lock().len()
    }

    /// Ties `context` to this manager. A context can only ever be driven by
    /// one live manager.
    pub fn adopt(&self, context: &Context) -> Result<(), ManagerError> {
        context.claim(self.shared.id, Arc::downgrade(&self.shared))
    }

    /// Fire-and-forget: returns a handle to the program thread.
    pub fn start(
        &self,
        context: &Context,
        source_name: &str,
        source: &str,
    ) -> Result<ProgramHandle, ManagerError> {
        let thread = self.launch(context, source_name, source, |_| {})?;
        Ok(ProgramHandle { thread })
    }

    /// Completes the returned future with the program's value, or null when
    /// it failed.
    pub fn start_future(
        &self,
        context: &Context,
        source_name: &str,
        source: &str,
    ) -> Result<ProgramFuture, ManagerError> {
        let (sender, receiver) = channel::bounded(1);
        self.launch(context, source_name, source, move |result| {
            let value = result.unwrap_or_else(|_| Value::null());
            let _ = sender.send(value);
        })?;
        Ok(ProgramFuture {
            receiver,
            value: None,
        })
    }

    /// Blocks the caller until the program ends, re-raising its failure.
    /// A program that was stopped or interrupted yields null.
    pub fn start_blocking(
        &self,
        context: &Context,
        source_name: &str,
        source: &str,
    ) -> Result<Value, QuillError> {
        let (sender, receiver) = channel::bounded(1);
        self.launch(context, source_name, source, move |result| {
            let _ = sender.send(result);
        })?;
        match receiver.recv() {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(Failure::Code(err))) if err.is_silent() => Ok(Value::null()),
            Ok(Err(Failure::Code(err))) => Err(err.into()),
            Ok(Err(Failure::Fatal(fatal))) => Err(fatal.into()),
            Err(_) => Err(ManagerError::Disconnected.into()),
        }
    }

    /// Runs `job` on an ad-hoc thread in the current thread group.
    pub fn spawn_async<F>(
        &self,
        output: Arc<dyn OutputSink>,
        label: &str,
        job: F,
    ) -> Result<(), ManagerError>
    where
        F: FnOnce(&CancellationToken) -> Result<(), CodeError> + Send + 'static,
    {
        let group = self.shared.current.lock().group.clone();
        let task = self.guarded(output, label, group.clone(), job);
        group.spawn(label, self.shared.config.thread_stack_size, task)?;
        Ok(())
    }

    /// Hands `job` to the worker pool.
    pub fn submit<F>(&self, output: Arc<dyn OutputSink>, label: &str, job: F) -> Result<(), ManagerError>
    where
        F: FnOnce(&CancellationToken) -> Result<(), CodeError> + Send + 'static,
    {
        let (group, pool) = {
            let current = self.shared.current.lock();
            (current.group.clone(), Arc::clone(&current.pool))
        };
        let task = self.guarded(output, label, group, job);
        pool.submit(task)
    }

    /// Stops the program: runs and clears shutdown callbacks, interrupts the
    /// thread group, shuts the pool down and returns to `Idle`.
    pub fn stop(&self) {
        if self.shared.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        self.set_state(ProgramState::Stopped);

        let callbacks = mem::take(&mut *self.shared.shutdown_callbacks.lock());
        debug!(callbacks = callbacks.len(), "running shutdown callbacks");
        for callback in callbacks {
            if panic::catch_unwind(AssertUnwindSafe(callback)).is_err() {
                warn!("shutdown callback panicked");
            }
        }

        {
            let mut current = self.shared.current.lock();
            current.group.interrupt();
            current.pool.shutdown_now();
            let next = current.group.generation() + 1;
            *current = Generation::new(&self.shared.config, self.shared.id, next);
            debug!(generation = next, "thread group replaced");
        }

        self.set_state(ProgramState::Idle);
        self.shared.stopping.store(false, Ordering::SeqCst);
    }

    fn launch(
        &self,
        context: &Context,
        source_name: &str,
        source: &str,
        on_done: impl FnOnce(Result<Value, Failure>) + Send + 'static,
    ) -> Result<JoinHandle<()>, ManagerError> {
        self.adopt(context)?;
        {
            let mut state = self.shared.state.lock();
            if *state != ProgramState::Idle {
                return Err(ManagerError::AlreadyRunning);
            }
            *state = ProgramState::Running;
        }
        self.notify(ProgramState::Running);
        *self.shared.source.lock() = Arc::from(source);

        let group = self.shared.current.lock().group.clone();
        let manager = self.clone();
        let context = context.clone();
        let source_name = source_name.to_string();
        let source = source.to_string();
        let token = group.token().clone();
        let generation = group.generation();
        debug!(program = %source_name, generation, "program starting");

        let spawned = group.spawn("main", self.shared.config.thread_stack_size, move || {
            let output = Arc::clone(context.output());
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                let mut interpreter = Interpreter::with_token(context, &source_name, token);
                interpreter.eval_source(&source)
            }));
            let result = match outcome {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(err)) => Err(Failure::Code(err)),
                Err(payload) => Err(Failure::Fatal(FatalError {
                    thread: current_thread_name(),
                    message: panic_message(payload.as_ref()),
                })),
            };
            manager.finish(generation, output.as_ref(), &result);
            on_done(result);
        });

        spawned.map_err(|err| {
            self.set_state(ProgramState::Idle);
            ManagerError::Spawn(err)
        })
    }

    /// Ends a run that was not torn down by `stop`: Running, Stopped, Idle.
    /// The thread group stays live so pending timers still fire.
    fn settle(&self, generation: u64) {
        if !self.is_current(generation) {
            return;
        }
        {
            let mut state = self.shared.state.lock();
            if *state != ProgramState::Running {
                return;
            }
            *state = ProgramState::Stopped;
        }
        self.notify(ProgramState::Stopped);
        self.set_state(ProgramState::Idle);
    }

    fn finish(&self, generation: u64, output: &dyn OutputSink, result: &Result<Value, Failure>) {
        match result {
            Ok(_) => {
                trace!(generation, "program finished");
                self.settle(generation);
            }
            Err(failure) => {
                let visible = !matches!(failure, Failure::Code(err) if err.is_silent());
                if visible && self.is_current(generation) {
                    self.set_state(ProgramState::Errored);
                }
                self.report(failure, output, generation);
                self.settle(generation);
            }
        }
    }

    /// The single funnel for failures from every thread the manager runs.
    fn report(&self, failure: &Failure, output: &dyn OutputSink, generation: u64) {
        match failure {
            Failure::Code(err) if err.kind == ErrorKind::Interrupted => {
                trace!(generation, "thread interrupted");
                return;
            }
            Failure::Code(err) if err.kind == ErrorKind::Stop => {
                debug!(generation, "stop requested by program");
            }
            Failure::Code(err) => {
                debug!(generation, kind = %err.kind, "program error");
                output.write_error(&err.render(output.format()));
            }
            Failure::Fatal(fatal) => {
                error!(thread = %fatal.thread, generation, "fatal error: {}", fatal.message);
                let handler = Arc::clone(&*self.shared.fatal_handler.read());
                let source = Arc::clone(&*self.shared.source.lock());
                handler(fatal, &source);
            }
        }
        if self.is_current(generation) && !self.shared.stopping.load(Ordering::SeqCst) {
            self.stop();
        }
    }

    fn guarded<F>(
        &self,
        output: Arc<dyn OutputSink>,
        label: &str,
        group: ThreadGroup,
        job: F,
    ) -> impl FnOnce() + Send + 'static
    where
        F: FnOnce(&CancellationToken) -> Result<(), CodeError> + Send + 'static,
    {
        let manager = self.clone();
        let label = label.to_string();
        move || {
            trace!(job = %label, "async job started");
            let token = group.token().clone();
            let failure = match panic::catch_unwind(AssertUnwindSafe(|| job(&token))) {
                Ok(Ok(())) => None,
                Ok(Err(err)) => Some(Failure::Code(err)),
                Err(payload) => Some(Failure::Fatal(FatalError {
                    thread: current_thread_name(),
                    message: panic_message(payload.as_ref()),
                })),
            };
            if let Some(failure) = failure {
                manager.report(&failure, output.as_ref(), group.generation());
            }
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.shared.current.lock().group.generation() == generation
    }

    fn set_state(&self, state: ProgramState) {
        *self.shared.state.lock() = state;
        self.notify(state);
    }

    fn notify(&self, state: ProgramState) {
        trace!(?state, "program state changed");
        let listeners = self.shared.listeners.read().clone();
        for listener in listeners {
            listener(state);
        }
    }
}

fn current_thread_name() -> String {
    thread::current().name().unwrap_or("<unnamed>").to_string()
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "thread panicked".to_string()
    }
}

/// Handle to a program started with [`ThreadManager::start`].
pub struct ProgramHandle {
    thread: JoinHandle<()>,
}

impl ProgramHandle {
    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    pub fn join(self) -> Result<(), ManagerError> {
        self.thread.join().map_err(|_| ManagerError::Disconnected)
    }
}

/// Completed exactly once with the program's value.
pub struct ProgramFuture {
    receiver: Receiver<Value>,
    value: Option<Value>,
}

impl ProgramFuture {
    pub fn try_get(&mut self) -> Option<Value> {
        if self.value.is_none() {
            self.value = self.receiver.try_recv().ok();
        }
        self.value.clone()
    }

    pub fn wait_timeout(&mut self, timeout: Duration) -> Option<Value> {
        if self.value.is_none() {
            self.value = self.receiver.recv_timeout(timeout).ok();
        }
        self.value.clone()
    }

    pub fn wait(mut self) -> Result<Value, ManagerError> {
        if let Some(value) = self.value.take() {
            return Ok(value);
        }
        self.receiver.recv().map_err(|_| ManagerError::Disconnected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sleep_wakes_on_cancel() {
        let token = CancellationToken::new();
        let remote = token.clone();
        let sleeper = thread::spawn(move || remote.sleep(Duration::from_secs(30)));
        thread::sleep(Duration::from_millis(20));
        token.cancel();
        let result = sleeper.join().unwrap();
        assert_eq!(result.unwrap_err().kind, ErrorKind::Interrupted);
    }

    #[test]
    fn sleep_completes_when_not_cancelled() {
        let token = CancellationToken::new();
        assert!(token.sleep(Duration::from_millis(5)).is_ok());
        assert!(!token.is_cancelled());
    }

    #[test]
    fn pool_reuses_idle_worker() {
        let pool = WorkerPool::new("test-pool", &RuntimeConfig::default());
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let counter = Arc::clone(&counter);
            pool.submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
            thread::sleep(Duration::from_millis(30));
        }
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(pool.live_workers(), 1);
        pool.shutdown_now();
        assert!(pool.is_shutdown());
        assert!(matches!(
            pool.submit(|| {}),
            Err(ManagerError::Disconnected)
        ));
    }

    #[test]
    fn surplus_workers_retire() {
        let config = RuntimeConfig::default().with_pool_idle_timeout(Duration::from_millis(20));
        let pool = WorkerPool::new("retire-pool", &config);
        let (release, gate) = channel::bounded::<()>(0);
        for _ in 0..3 {
            let gate = gate.clone();
            pool.submit(move || {
                let _ = gate.recv();
            })
            .unwrap();
        }
        assert_eq!(pool.live_workers(), 3);
        drop(release);
        thread::sleep(Duration::from_millis(300));
        assert_eq!(pool.live_workers(), 1);
        pool.shutdown_now();
    }

    #[test]
    fn panic_messages_are_extracted() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
    }
}
