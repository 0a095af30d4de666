//! The host contains and drives one accessor model.
//!
//! It behaves like a composite without ports plus a lifecycle state
//! machine: set up, iterate or run, pause, exit. Execution happens on one
//! worker at a time, either the caller's thread (`iterate`,
//! `run_on_current_thread`) or a spawned worker (`run`) whose handle is
//! always joined before the host finishes. State is published lock-free so
//! `state()` never touches the worker; listeners subscribe by weak
//! reference for state changes and execution errors.

use crate::accessor::{erase_hook, CompositeAccessor, ConnectionDecl, IntoAccessorSpec};
use crate::config::HostConfig;
use crate::director::{CallbackAction, HOST_PRIORITY, UPDATE_MODEL_PRIORITY};
use crate::error::{Result, RuntimeError};
use crate::reaction::{Engine, ReactionContext};
use crate::utils::time::posix_utc_millis;
use crate::utils::{CancelToken, StateCell};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

/// Lifecycle of a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostState {
    NeedsSetup,
    SettingUp,
    ReadyToRun,
    Running,
    Paused,
    Exiting,
    Finished,
    Corrupted,
}

impl HostState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HostState::NeedsSetup => "NeedsSetup",
            HostState::SettingUp => "SettingUp",
            HostState::ReadyToRun => "ReadyToRun",
            HostState::Running => "Running",
            HostState::Paused => "Paused",
            HostState::Exiting => "Exiting",
            HostState::Finished => "Finished",
            HostState::Corrupted => "Corrupted",
        }
    }
}

/// Subscriber notified of host state changes and execution errors.
///
/// A listener returning an error is unregistered; expired weak references
/// are reaped on the next notification. Listeners must not block.
pub trait EventListener: Send + Sync {
    fn on_state_change(&self, old: HostState, new: HostState) -> anyhow::Result<()>;
    fn on_execution_error(&self, error: &RuntimeError) -> anyhow::Result<()>;
}

pub type ListenerId = u64;

#[derive(Default)]
struct ListenerSet {
    next_id: ListenerId,
    entries: BTreeMap<ListenerId, Weak<dyn EventListener>>,
}

impl ListenerSet {
    fn add(&mut self, listener: Weak<dyn EventListener>) -> ListenerId {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert(id, listener);
        id
    }

    fn notify_state_change(&mut self, old: HostState, new: HostState) {
        self.entries.retain(|_, listener| match listener.upgrade() {
            Some(listener) => listener.on_state_change(old, new).is_ok(),
            None => false,
        });
    }

    fn notify_error(&mut self, error: &RuntimeError) {
        self.entries.retain(|_, listener| match listener.upgrade() {
            Some(listener) => listener.on_execution_error(error).is_ok(),
            None => false,
        });
    }
}

/// Root of an accessor model: owns the composition tree and the director,
/// and drives both through the lifecycle state machine. Hosts have no
/// ports of their own.
pub struct Host {
    name: String,
    engine: Arc<Mutex<Engine>>,
    state: Arc<StateCell<HostState>>,
    listeners: Arc<Mutex<ListenerSet>>,
    cancel: Arc<Mutex<Option<CancelToken>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    sleep_chunk: Duration,
}

impl Host {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        Self::with_config(HostConfig::new(name))
    }

    /// A host carrying user state for its own hooks, e.g. a model that
    /// grows children at runtime.
    pub fn with_state<S: Send + 'static>(name: impl Into<String>, state: S) -> Result<Self> {
        Self::build(HostConfig::new(name), Box::new(state))
    }

    pub fn with_config(config: HostConfig) -> Result<Self> {
        Self::build(config, Box::new(()))
    }

    fn build(config: HostConfig, state: crate::accessor::ErasedState) -> Result<Self> {
        let name = config.name.clone();
        let mut root = CompositeAccessor::new(name.clone())?;
        root.state = Some(state);
        let mut engine = Engine::new(root.into_spec())?;
        let root_id = engine.root;
        engine.graph.accessor_mut(root_id).priority = HOST_PRIORITY;
        Ok(Self {
            name,
            engine: Arc::new(Mutex::new(engine)),
            state: Arc::new(StateCell::new(HostState::NeedsSetup)),
            listeners: Arc::new(Mutex::new(ListenerSet::default())),
            cancel: Arc::new(Mutex::new(None)),
            worker: Mutex::new(None),
            sleep_chunk: Duration::from_millis(config.sleep_chunk_ms.unwrap_or(3_600_000)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> HostState {
        *self.state.load()
    }

    // ---- listeners ----------------------------------------------------

    pub fn add_event_listener(&self, listener: Weak<dyn EventListener>) -> ListenerId {
        lock(&self.listeners).add(listener)
    }

    pub fn remove_event_listener(&self, id: ListenerId) {
        lock(&self.listeners).entries.remove(&id);
    }

    pub fn event_listener_is_registered(&self, id: ListenerId) -> bool {
        lock(&self.listeners).entries.contains_key(&id)
    }

    // ---- model building -----------------------------------------------

    pub fn add_child<C: IntoAccessorSpec>(&self, child: C) -> Result<()> {
        let mut engine = self.lock_engine();
        let root = engine.root;
        engine.graph.instantiate(Some(root), child.into_spec())?;
        Ok(())
    }

    pub fn remove_child(&self, name: &str) -> Result<()> {
        let mut engine = self.lock_engine();
        let root = engine.root;
        let Engine {
            graph, director, ..
        } = &mut *engine;
        graph.remove_child(director, root, name)
    }

    pub fn connect_children(
        &self,
        source_child: &str,
        source_port: &str,
        destination_child: &str,
        destination_port: &str,
    ) -> Result<()> {
        let connection = ConnectionDecl::Children {
            source_child: source_child.to_string(),
            source_port: source_port.to_string(),
            destination_child: destination_child.to_string(),
            destination_port: destination_port.to_string(),
        };
        let mut engine = self.lock_engine();
        let root = engine.root;
        engine.graph.apply_connection(root, &connection)
    }

    /// Call after children or connections were added or removed at runtime.
    pub fn children_changed(&self) {
        let mut engine = self.lock_engine();
        engine
            .director
            .schedule(CallbackAction::UpdateModel, 0, false, UPDATE_MODEL_PRIORITY);
    }

    /// Hook run once during setup, after all children initialized. `S` must
    /// match the state the host was built with.
    pub fn on_initialize<S, F>(&self, f: F)
    where
        S: Send + 'static,
        F: FnMut(&mut S, &mut ReactionContext<'_>) -> anyhow::Result<()> + Send + 'static,
    {
        let mut engine = self.lock_engine();
        let root = engine.root;
        engine.graph.accessor_mut(root).init_fn = Some(erase_hook(f));
    }

    /// Hook run at the start of setup, before priorities are computed; the
    /// place to wire children together.
    pub fn on_additional_setup<S, F>(&self, f: F)
    where
        S: Send + 'static,
        F: FnMut(&mut S, &mut ReactionContext<'_>) -> anyhow::Result<()> + Send + 'static,
    {
        self.lock_engine().additional_setup = Some(erase_hook(f));
    }

    // ---- lifecycle ----------------------------------------------------

    pub fn setup(&self) -> Result<()> {
        let current = self.state();
        if current != HostState::NeedsSetup {
            return Err(RuntimeError::Lifecycle {
                operation: "setup",
                state: current.as_str(),
            });
        }
        self.set_state(HostState::SettingUp);
        self.lock_engine().setup()?;
        self.set_state(HostState::ReadyToRun);
        Ok(())
    }

    /// Execute at most `rounds` wake-and-drain cycles on the calling
    /// thread, then pause. A handler failure corrupts the host, notifies
    /// listeners, and still leaves it paused.
    pub fn iterate(&self, rounds: u32) -> Result<()> {
        self.validate_can_run("iterate")?;
        let token = self.new_execution_token();
        self.set_state(HostState::Running);
        let outcome = drive(&self.engine, &token, Some(rounds), self.sleep_chunk);
        conclude(&self.name, &self.state, &self.listeners, outcome);
        Ok(())
    }

    /// Detach a worker that executes until paused or exited.
    pub fn run(&self) -> Result<()> {
        self.validate_can_run("run")?;
        self.join_worker();
        let token = self.new_execution_token();
        let engine = Arc::clone(&self.engine);
        let state = Arc::clone(&self.state);
        let listeners = Arc::clone(&self.listeners);
        let name = self.name.clone();
        let sleep_chunk = self.sleep_chunk;
        self.set_state(HostState::Running);
        let handle = std::thread::spawn(move || {
            let outcome = drive(&engine, &token, None, sleep_chunk);
            conclude(&name, &state, &listeners, outcome);
        });
        *lock(&self.worker) = Some(handle);
        Ok(())
    }

    /// Execute on the calling thread until paused or exited.
    pub fn run_on_current_thread(&self) -> Result<()> {
        self.validate_can_run("run")?;
        let token = self.new_execution_token();
        self.set_state(HostState::Running);
        let outcome = drive(&self.engine, &token, None, self.sleep_chunk);
        conclude(&self.name, &self.state, &self.listeners, outcome);
        Ok(())
    }

    pub fn pause(&self) -> Result<()> {
        let current = self.state();
        if current != HostState::Running {
            return Err(RuntimeError::Lifecycle {
                operation: "pause",
                state: current.as_str(),
            });
        }
        if let Some(token) = lock(&self.cancel).take() {
            token.cancel();
        }
        self.set_state(HostState::Paused);
        Ok(())
    }

    /// Terminal from any state. Cancels a running execution and joins the
    /// worker before announcing `Finished`.
    pub fn exit(&self) {
        self.set_state(HostState::Exiting);
        if let Some(token) = lock(&self.cancel).take() {
            token.cancel();
        }
        self.join_worker();
        self.set_state(HostState::Finished);
    }

    fn validate_can_run(&self, operation: &'static str) -> Result<()> {
        match self.state() {
            HostState::ReadyToRun | HostState::Paused => Ok(()),
            other => Err(RuntimeError::Lifecycle {
                operation,
                state: other.as_str(),
            }),
        }
    }

    fn new_execution_token(&self) -> CancelToken {
        let token = CancelToken::new();
        *lock(&self.cancel) = Some(token.clone());
        token
    }

    fn set_state(&self, new: HostState) {
        set_state(&self.state, &self.listeners, new);
    }

    fn lock_engine(&self) -> MutexGuard<'_, Engine> {
        self.engine.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn join_worker(&self) {
        let handle = lock(&self.worker).take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

impl Drop for Host {
    fn drop(&mut self) {
        if let Some(token) = lock(&self.cancel).take() {
            token.cancel();
        }
        self.join_worker();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn set_state(state: &StateCell<HostState>, listeners: &Mutex<ListenerSet>, new: HostState) {
    let old = *state.swap(new);
    if old != new {
        tracing::info!(from = old.as_str(), to = new.as_str(), "host state changed");
        lock(listeners).notify_state_change(old, new);
    }
}

/// The execution loop: sleep until the next scheduled instant, drain every
/// due callback, repeat. The engine lock is only held while draining, so
/// pause and exit stay responsive through the cancel token.
fn drive(
    engine: &Arc<Mutex<Engine>>,
    cancel: &CancelToken,
    rounds: Option<u32>,
    sleep_chunk: Duration,
) -> Result<()> {
    let mut completed: u32 = 0;
    loop {
        if let Some(rounds) = rounds {
            if completed >= rounds {
                break;
            }
        }
        if cancel.is_cancelled() {
            break;
        }
        let next = lock(engine).next_queued_time_ms();
        let Some(next) = next else {
            // nothing scheduled: a bounded run is done, a detached run
            // waits for new work or cancellation
            if rounds.is_some() {
                break;
            }
            if !cancel.sleep_for_chunked(sleep_chunk, sleep_chunk) {
                break;
            }
            continue;
        };
        let now = posix_utc_millis()?;
        let delay = next - now;
        if delay > 0
            && !cancel.sleep_for_chunked(Duration::from_millis(delay as u64), sleep_chunk)
        {
            break;
        }
        lock(engine).run_due_instants()?;
        completed += 1;
    }
    Ok(())
}

/// Post-execution accounting shared by `iterate`, `run`, and
/// `run_on_current_thread`: a failure corrupts the host and notifies
/// listeners, and every execution ends paused.
fn conclude(
    name: &str,
    state: &StateCell<HostState>,
    listeners: &Mutex<ListenerSet>,
    outcome: Result<()>,
) {
    if let Err(error) = outcome {
        tracing::error!(host = name, %error, "execution failed");
        let _ = state.swap(HostState::Corrupted);
        lock(listeners).notify_error(&error);
    }
    set_state(state, listeners, HostState::Paused);
}
