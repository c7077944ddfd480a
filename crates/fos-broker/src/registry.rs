//! Executor registry.
//!
//! Maps thread ids to the executor serving that thread plus a liveness
//! handle for it. All maps (executors, pending registrations, tab ids) sit
//! behind one mutex. Hooks, handle opening and executor release all run
//! outside of it. Keep-alive hooks are serialized by a second mutex taken
//! before the map lock is released, so they fire in transition order.

use crate::config::BrokerConfig;
use crate::error::{BrokerError, Result};
use crate::ids::{Namespace, TabId, ThreadId, WindowHandle};
use crate::keepalive::{KeepAlive, NoKeepAlive};
use crate::liveness::{LivenessHandle, LivenessSource};
use crate::registration::{CreationTicket, ExecutorFactory, Lookup, RegistrationWait};
use crate::tab_map::TabMaps;
use crate::watcher::{self, WatchEvent, WatcherHandle, WatcherStatus};
use crossbeam_channel::{bounded, never, Receiver, Sender};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Outcome of [`ExecutorRegistry::register_by_caller`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// A new entry was created
    Inserted,
    /// An entry already existed; the call was a no-op
    AlreadyPresent,
}

struct Entry<E: ?Sized> {
    executor: Arc<E>,
    liveness: LivenessHandle,
}

/// In-flight registration. Dropping it disconnects `signal`, which wakes
/// every waiter holding a clone of `gate` at once.
struct Pending {
    generation: u64,
    _signal: Sender<()>,
    gate: Receiver<()>,
}

struct State<E: ?Sized> {
    executors: HashMap<ThreadId, Entry<E>>,
    pending: HashMap<ThreadId, Pending>,
    tabs: TabMaps,
    next_generation: u64,
    /// Set by terminate; no entry may be added afterwards.
    closed: bool,
}

impl<E: ?Sized> State<E> {
    fn pending_matches(&self, thread_id: ThreadId, generation: Option<u64>) -> bool {
        self.pending
            .get(&thread_id)
            .is_some_and(|p| generation.is_none_or(|g| g == p.generation))
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(BrokerError::InvalidArgument(
                "registry already terminated".to_string(),
            ));
        }
        Ok(())
    }

    fn take_pending(&mut self, thread_id: ThreadId, generation: Option<u64>) -> Option<Pending> {
        if self.pending_matches(thread_id, generation) {
            self.pending.remove(&thread_id)
        } else {
            None
        }
    }
}

/// State shared between the registry, its watcher and outstanding completers.
pub(crate) struct Shared<E: ?Sized> {
    state: Mutex<State<E>>,
    liveness: Arc<dyn LivenessSource>,
    keep_alive: Arc<dyn KeepAlive>,
    /// Lock order: `state`, then `hook_order`.
    hook_order: Mutex<()>,
    update_tx: Sender<()>,
    update_rx: Receiver<()>,
    status: Mutex<WatcherStatus>,
    pub(crate) config: BrokerConfig,
}

impl<E: ?Sized + Send + Sync + 'static> Shared<E> {
    fn lock(&self) -> MutexGuard<'_, State<E>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reserve the next keep-alive hook slot. Must be called with `state`
    /// held and kept until the hook has fired.
    fn order_hooks(&self) -> MutexGuard<'_, ()> {
        self.hook_order.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn update_receiver(&self) -> Receiver<()> {
        self.update_rx.clone()
    }

    pub(crate) fn watcher_status(&self) -> WatcherStatus {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set_watcher_status(&self, status: WatcherStatus) {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner) = status;
    }

    /// Ask the watcher to re-snapshot. Coalesces with an unconsumed request.
    fn notify_watcher(&self) {
        let _ = self.update_tx.try_send(());
    }

    pub(crate) fn lookup(&self, thread_id: ThreadId) -> Option<Arc<E>> {
        self.lock()
            .executors
            .get(&thread_id)
            .map(|entry| entry.executor.clone())
    }

    fn register_by_caller(&self, thread_id: ThreadId, executor: Arc<E>) -> Result<Registration> {
        {
            let state = self.lock();
            state.ensure_open()?;
            if state.executors.contains_key(&thread_id) {
                return Ok(Registration::AlreadyPresent);
            }
        }

        let liveness = self.liveness.open(thread_id)?;

        let hook = {
            let mut state = self.lock();
            state.ensure_open()?;
            if state.executors.contains_key(&thread_id) {
                return Ok(Registration::AlreadyPresent);
            }
            let was_empty = state.executors.is_empty();
            state.executors.insert(thread_id, Entry { executor, liveness });
            was_empty.then(|| self.order_hooks())
        };

        if hook.is_some() {
            self.keep_alive.on_became_nonempty();
        }
        drop(hook);
        self.notify_watcher();

        debug!(thread_id = %thread_id, "Executor registered by caller");
        Ok(Registration::Inserted)
    }

    pub(crate) fn lookup_or_begin_registration(self: &Arc<Self>, thread_id: ThreadId) -> Lookup<E> {
        let mut state = self.lock();
        if let Some(entry) = state.executors.get(&thread_id) {
            return Lookup::Found(entry.executor.clone());
        }

        if let Some(pending) = state.pending.get(&thread_id) {
            return Lookup::Pending(RegistrationWait::new(
                thread_id,
                pending.generation,
                pending.gate.clone(),
            ));
        }

        let generation = state.next_generation;
        state.next_generation += 1;
        let (signal, gate) = bounded(0);
        state.pending.insert(
            thread_id,
            Pending {
                generation,
                _signal: signal,
                gate: gate.clone(),
            },
        );
        drop(state);

        debug!(thread_id = %thread_id, generation, "Registration started");
        Lookup::MustCreate(CreationTicket::new(
            RegistrationWait::new(thread_id, generation, gate),
            self.clone(),
        ))
    }

    /// Finish a pending registration, successfully or not.
    ///
    /// `generation` pins the call to one specific pending registration;
    /// `None` accepts whichever is in flight. `executor == None` abandons.
    /// Whenever a matching pending registration exists it is removed and its
    /// waiters are woken, in the same critical section that inserts the entry.
    pub(crate) fn finish_registration(
        &self,
        thread_id: ThreadId,
        generation: Option<u64>,
        executor: Option<Arc<E>>,
    ) -> Result<()> {
        if !self.lock().pending_matches(thread_id, generation) {
            warn!(thread_id = %thread_id, "No pending registration to complete");
            return Err(BrokerError::InvalidArgument(format!(
                "no pending registration for {thread_id}"
            )));
        }

        let abandoned = executor.is_none();
        let opened = match executor {
            Some(executor) => self
                .liveness
                .open(thread_id)
                .map(|liveness| Some(Entry { executor, liveness })),
            None => Ok(None),
        };

        let mut inserted = false;
        let mut hook = None;
        let mut rejected = None;
        let result = {
            let mut state = self.lock();
            let result = match opened {
                Ok(Some(entry)) if state.closed => {
                    rejected = Some(entry);
                    state.ensure_open()
                }
                Ok(Some(entry)) if state.executors.contains_key(&thread_id) => {
                    rejected = Some(entry);
                    Err(BrokerError::InvalidArgument(format!(
                        "{thread_id} already has an executor"
                    )))
                }
                Ok(Some(entry)) => {
                    if state.executors.is_empty() {
                        hook = Some(self.order_hooks());
                    }
                    state.executors.insert(thread_id, entry);
                    inserted = true;
                    Ok(())
                }
                Ok(None) => Ok(()),
                Err(e) => Err(e),
            };
            // Wake the waiters only once the entry is visible.
            drop(state.take_pending(thread_id, generation));
            result
        };
        drop(rejected);

        if hook.is_some() {
            self.keep_alive.on_became_nonempty();
        }
        drop(hook);
        if inserted {
            self.notify_watcher();
            debug!(thread_id = %thread_id, "Executor registration completed");
        } else if abandoned {
            debug!(thread_id = %thread_id, "Executor registration abandoned");
        } else if let Err(e) = &result {
            warn!(thread_id = %thread_id, error = %e, "Executor registration failed");
        }
        result
    }

    /// Drop the pending registration of `generation`, if still there.
    pub(crate) fn cancel_pending(&self, thread_id: ThreadId, generation: u64) {
        let pending = self.lock().take_pending(thread_id, Some(generation));
        drop(pending);
    }

    pub(crate) fn remove(&self, thread_id: ThreadId) -> Option<Arc<E>> {
        self.remove_where(thread_id, |_| true)
    }

    /// Remove `thread_id` only if its entry is still the one `handle` watches.
    pub(crate) fn remove_watched(&self, thread_id: ThreadId, handle: &LivenessHandle) -> bool {
        self.remove_where(thread_id, |entry| {
            entry.liveness.receiver().same_channel(handle.receiver())
        })
        .is_some()
    }

    fn remove_where(
        &self,
        thread_id: ThreadId,
        pred: impl FnOnce(&Entry<E>) -> bool,
    ) -> Option<Arc<E>> {
        let (entry, hook) = {
            let mut state = self.lock();
            if !state.executors.get(&thread_id).is_some_and(pred) {
                return None;
            }
            let entry = state.executors.remove(&thread_id)?;
            let hook = state.executors.is_empty().then(|| self.order_hooks());
            (entry, hook)
        };

        if hook.is_some() {
            self.keep_alive.on_became_empty();
        }
        drop(hook);
        debug!(thread_id = %thread_id, "Executor removed");
        Some(entry.executor)
    }

    pub(crate) fn snapshot_live_threads(&self, max: usize) -> Vec<(ThreadId, LivenessHandle)> {
        self.lock()
            .executors
            .iter()
            .take(max)
            .map(|(thread_id, entry)| (*thread_id, entry.liveness.duplicate()))
            .collect()
    }

    /// Close the registry and empty every map. Returns the number of executor
    /// entries that were left.
    fn drain(&self) -> usize {
        let (executors, pending, hook) = {
            let mut state = self.lock();
            state.closed = true;
            let executors = std::mem::take(&mut state.executors);
            let pending = std::mem::take(&mut state.pending);
            let hook = (!executors.is_empty()).then(|| self.order_hooks());
            (executors, pending, hook)
        };
        let left = executors.len();
        if hook.is_some() {
            self.keep_alive.on_became_empty();
        }
        drop(hook);
        drop(pending);
        drop(executors);
        left
    }
}

/// Collaborators injected into a registry.
pub struct Collaborators<E: ?Sized + Send + Sync + 'static> {
    /// Opens liveness handles for thread ids
    pub liveness: Arc<dyn LivenessSource>,
    /// Fired on 0 <-> 1 transitions of the entry count
    pub keep_alive: Arc<dyn KeepAlive>,
    /// Creates executors on demand for [`ExecutorRegistry::get_executor`]
    pub factory: Option<Arc<dyn ExecutorFactory<E>>>,
}

impl<E: ?Sized + Send + Sync + 'static> Collaborators<E> {
    pub fn new(liveness: Arc<dyn LivenessSource>) -> Self {
        Self {
            liveness,
            keep_alive: Arc::new(NoKeepAlive),
            factory: None,
        }
    }

    pub fn with_keep_alive(mut self, keep_alive: Arc<dyn KeepAlive>) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn with_factory(mut self, factory: Arc<dyn ExecutorFactory<E>>) -> Self {
        self.factory = Some(factory);
        self
    }
}

#[derive(Default)]
struct Control {
    watcher: Option<WatcherHandle>,
    terminated: bool,
}

/// Process-wide directory of per-thread executors.
///
/// Entries are removed explicitly with [`remove`](Self::remove), or by the
/// watcher thread once the owning thread exits.
pub struct ExecutorRegistry<E: ?Sized + Send + Sync + 'static> {
    pub(crate) shared: Arc<Shared<E>>,
    pub(crate) factory: Option<Arc<dyn ExecutorFactory<E>>>,
    control: Mutex<Control>,
}

impl<E: ?Sized + Send + Sync + 'static> ExecutorRegistry<E> {
    /// Build a registry, starting the watcher unless the config disables it.
    pub fn new(config: BrokerConfig, collaborators: Collaborators<E>) -> Result<Self> {
        config
            .validate()
            .map_err(|e| BrokerError::InvalidArgument(e.to_string()))?;

        let (update_tx, update_rx) = bounded(1);
        let spawn = config.spawn_watcher;
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                executors: HashMap::new(),
                pending: HashMap::new(),
                tabs: TabMaps::new(),
                next_generation: 1,
                closed: false,
            }),
            liveness: collaborators.liveness,
            keep_alive: collaborators.keep_alive,
            hook_order: Mutex::new(()),
            update_tx,
            update_rx,
            status: Mutex::new(WatcherStatus::Disabled),
            config,
        });

        let registry = Self {
            shared,
            factory: collaborators.factory,
            control: Mutex::new(Control::default()),
        };
        if spawn {
            registry.start_watcher()?;
        }

        info!(watcher = spawn, "Executor registry initialized");
        Ok(registry)
    }

    fn control(&self) -> MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.shared.config
    }

    /// Register an executor the caller already holds for `thread_id`.
    ///
    /// Idempotent: a second registration for the same id is a no-op that
    /// keeps the first executor. Refused once the registry is terminated.
    pub fn register_by_caller(&self, thread_id: ThreadId, executor: Arc<E>) -> Result<Registration> {
        self.shared.register_by_caller(thread_id, executor)
    }

    /// Look up `thread_id`, or join / start its registration.
    ///
    /// Exactly one caller per registration receives `MustCreate`.
    pub fn lookup_or_begin_registration(&self, thread_id: ThreadId) -> Lookup<E> {
        self.shared.lookup_or_begin_registration(thread_id)
    }

    /// Complete the in-flight registration of `thread_id` with `executor`.
    ///
    /// Called on the creating thread's behalf. Waiters are woken whether or
    /// not the entry could be recorded.
    pub fn complete_registration(&self, thread_id: ThreadId, executor: Arc<E>) -> Result<()> {
        self.shared.finish_registration(thread_id, None, Some(executor))
    }

    /// Give up the in-flight registration of `thread_id`, waking its waiters.
    pub fn abandon_registration(&self, thread_id: ThreadId) -> Result<()> {
        self.shared.finish_registration(thread_id, None, None)
    }

    pub fn lookup(&self, thread_id: ThreadId) -> Option<Arc<E>> {
        self.shared.lookup(thread_id)
    }

    /// Remove `thread_id`, handing the executor back to the caller so it is
    /// released outside the registry lock.
    pub fn remove(&self, thread_id: ThreadId) -> Result<Arc<E>> {
        self.shared.remove(thread_id).ok_or(BrokerError::NotFound)
    }

    /// Up to `max` registered threads with duplicated liveness handles.
    pub fn snapshot_live_threads(&self, max: usize) -> Vec<(ThreadId, LivenessHandle)> {
        self.shared.snapshot_live_threads(max)
    }

    pub fn contains(&self, thread_id: ThreadId) -> bool {
        self.shared.lock().executors.contains_key(&thread_id)
    }

    pub fn len(&self) -> usize {
        self.shared.lock().executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of registrations currently in flight.
    pub fn pending_count(&self) -> usize {
        self.shared.lock().pending.len()
    }

    pub fn watcher_status(&self) -> WatcherStatus {
        self.shared.watcher_status()
    }

    /// Start the watcher, or restart it after a fault.
    ///
    /// No-op while a watcher is running. Refused once terminated.
    pub fn start_watcher(&self) -> Result<()> {
        let mut control = self.control();
        if control.terminated {
            return Err(BrokerError::InvalidArgument(
                "registry already terminated".to_string(),
            ));
        }
        if control.watcher.is_some() && self.shared.watcher_status() == WatcherStatus::Running {
            return Ok(());
        }
        if let Some(old) = control.watcher.take() {
            old.join();
        }

        let handle = watcher::spawn_watcher(self.shared.clone())
            .map_err(|e| BrokerError::WatcherFault(e.to_string()))?;
        control.watcher = Some(handle);
        Ok(())
    }

    /// Run one watcher cycle on the calling thread.
    ///
    /// Pending update requests are consumed first, so the cycle reports
    /// either a thread exit or `TimedOut`. Only available while no watcher
    /// thread is running.
    pub fn reap_once(&self, timeout: Duration) -> Result<WatchEvent> {
        if self.shared.watcher_status() == WatcherStatus::Running {
            return Err(BrokerError::InvalidArgument(
                "watcher thread is running".to_string(),
            ));
        }
        let update_rx = self.shared.update_receiver();
        while update_rx.try_recv().is_ok() {}
        Ok(watcher::watch_cycle(
            &self.shared,
            &update_rx,
            &never(),
            Some(timeout),
        ))
    }

    /// Stop the watcher and drop every entry.
    ///
    /// Later registrations are refused with `InvalidArgument`. Idempotent. A clean shutdown leaves nothing to drop; leftovers are
    /// logged. Fails with `Timeout` if the watcher did not exit in time, in
    /// which case cleanup still runs.
    pub fn terminate(&self) -> Result<()> {
        let watcher = {
            let mut control = self.control();
            if control.terminated {
                return Ok(());
            }
            control.terminated = true;
            control.watcher.take()
        };

        let mut result = Ok(());
        if let Some(watcher) = watcher {
            if let Err(e) = watcher.stop(self.shared.config.terminate_timeout()) {
                error!(error = %e, "Watcher did not stop in time");
                result = Err(e);
            }
        }
        if self.shared.watcher_status() != WatcherStatus::Faulted {
            self.shared.set_watcher_status(WatcherStatus::Stopped);
        }

        let left = self.shared.drain();
        if left > 0 {
            error!(left, "Executors still registered at terminate");
        }
        info!("Executor registry terminated");
        result
    }

    /// Bind a content tab id to its window handle.
    pub fn bind_tab(&self, tab_id: TabId, handle: WindowHandle) -> Result<()> {
        self.bind(tab_id, handle, Namespace::Content)
    }

    /// Bind a tool band id to its tab's window handle.
    pub fn bind_tool_band(&self, tool_band_id: TabId, handle: WindowHandle) -> Result<()> {
        self.bind(tool_band_id, handle, Namespace::ToolBand)
    }

    pub fn bind(&self, id: TabId, handle: WindowHandle, namespace: Namespace) -> Result<()> {
        self.shared.lock().tabs.bind(id, handle, namespace)
    }

    /// Remove `handle` from whichever namespaces hold it.
    pub fn unbind_handle(&self, handle: WindowHandle) -> Result<Vec<Namespace>> {
        self.shared.lock().tabs.unbind(handle)
    }

    pub fn resolve(&self, id: TabId, namespace: Namespace) -> Option<WindowHandle> {
        self.shared.lock().tabs.resolve(id, namespace)
    }

    pub fn resolve_handle(&self, handle: WindowHandle, namespace: Namespace) -> Option<TabId> {
        self.shared.lock().tabs.resolve_handle(handle, namespace)
    }

    pub fn tab_handle(&self, tab_id: TabId) -> Option<WindowHandle> {
        self.resolve(tab_id, Namespace::Content)
    }

    pub fn tab_id_for_handle(&self, handle: WindowHandle) -> Option<TabId> {
        self.resolve_handle(handle, Namespace::Content)
    }

    pub fn tool_band_handle(&self, tool_band_id: TabId) -> Option<WindowHandle> {
        self.resolve(tool_band_id, Namespace::ToolBand)
    }

    pub fn tool_band_id_for_handle(&self, handle: WindowHandle) -> Option<TabId> {
        self.resolve_handle(handle, Namespace::ToolBand)
    }
}

impl<E: ?Sized + Send + Sync + 'static> Drop for ExecutorRegistry<E> {
    fn drop(&mut self) {
        let _ = self.terminate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keepalive::ModuleLock;
    use crate::liveness::ThreadTable;
    use crate::registration::WaitOutcome;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::thread;

    #[derive(Debug, PartialEq)]
    struct Exec(&'static str);

    fn lock_step(table: &Arc<ThreadTable>) -> ExecutorRegistry<Exec> {
        ExecutorRegistry::new(BrokerConfig::lock_step(), Collaborators::new(table.clone())).unwrap()
    }

    /// Records keep-alive transitions in order.
    #[derive(Default)]
    struct Transitions(StdMutex<Vec<&'static str>>);

    impl KeepAlive for Transitions {
        fn on_became_nonempty(&self) {
            self.0.lock().unwrap().push("nonempty");
        }
        fn on_became_empty(&self) {
            self.0.lock().unwrap().push("empty");
        }
    }

    #[test]
    fn test_register_then_lookup() {
        let table = Arc::new(ThreadTable::new());
        let registry = lock_step(&table);
        let guard = table.attach();
        let exec = Arc::new(Exec("a"));

        let outcome = registry.register_by_caller(guard.thread_id(), exec.clone()).unwrap();
        assert_eq!(outcome, Registration::Inserted);

        let found = registry.lookup(guard.thread_id()).unwrap();
        assert!(Arc::ptr_eq(&found, &exec));
    }

    #[test]
    fn test_double_registration_keeps_first() {
        let table = Arc::new(ThreadTable::new());
        let registry = lock_step(&table);
        let guard = table.attach();
        let id = guard.thread_id();

        registry.register_by_caller(id, Arc::new(Exec("first"))).unwrap();
        let second = registry.register_by_caller(id, Arc::new(Exec("second"))).unwrap();

        assert_eq!(second, Registration::AlreadyPresent);
        assert_eq!(registry.len(), 1);
        assert_eq!(*registry.lookup(id).unwrap(), Exec("first"));
    }

    #[test]
    fn test_register_dead_thread_is_invalid() {
        let table = Arc::new(ThreadTable::new());
        let registry = lock_step(&table);
        let guard = table.attach();
        let id = guard.thread_id();
        drop(guard);

        assert_eq!(
            registry.register_by_caller(id, Arc::new(Exec("late"))),
            Err(BrokerError::InvalidThread(id))
        );
        assert!(registry.is_empty());
    }

    #[test]
    fn test_remove_missing_is_noop() {
        let table = Arc::new(ThreadTable::new());
        let keep_alive = Arc::new(Transitions::default());
        let registry = ExecutorRegistry::<Exec>::new(
            BrokerConfig::lock_step(),
            Collaborators::new(table.clone()).with_keep_alive(keep_alive.clone()),
        )
        .unwrap();

        assert_eq!(registry.remove(ThreadId::new(12)).unwrap_err(), BrokerError::NotFound);
        assert!(keep_alive.0.lock().unwrap().is_empty());
    }

    #[test]
    fn test_remove_hands_back_executor() {
        let table = Arc::new(ThreadTable::new());
        let registry = lock_step(&table);
        let guard = table.attach();
        registry.register_by_caller(guard.thread_id(), Arc::new(Exec("x"))).unwrap();

        let exec = registry.remove(guard.thread_id()).unwrap();
        assert_eq!(*exec, Exec("x"));
        assert!(registry.lookup(guard.thread_id()).is_none());
    }

    #[test]
    fn test_keep_alive_transitions_in_order() {
        let table = Arc::new(ThreadTable::new());
        let keep_alive = Arc::new(Transitions::default());
        let registry = ExecutorRegistry::<Exec>::new(
            BrokerConfig::lock_step(),
            Collaborators::new(table.clone()).with_keep_alive(keep_alive.clone()),
        )
        .unwrap();
        let a = table.attach();
        let b = table.attach();

        registry.register_by_caller(a.thread_id(), Arc::new(Exec("a"))).unwrap();
        registry.register_by_caller(b.thread_id(), Arc::new(Exec("b"))).unwrap();
        registry.remove(a.thread_id()).unwrap();
        registry.remove(b.thread_id()).unwrap();

        assert_eq!(*keep_alive.0.lock().unwrap(), vec!["nonempty", "empty"]);

        registry.register_by_caller(a.thread_id(), Arc::new(Exec("a"))).unwrap();
        registry.remove(a.thread_id()).unwrap();
        assert_eq!(
            *keep_alive.0.lock().unwrap(),
            vec!["nonempty", "empty", "nonempty", "empty"]
        );
    }

    #[test]
    fn test_module_lock_released_on_terminate() {
        let table = Arc::new(ThreadTable::new());
        let module = Arc::new(ModuleLock::new());
        let registry = ExecutorRegistry::<Exec>::new(
            BrokerConfig::lock_step(),
            Collaborators::new(table.clone()).with_keep_alive(module.clone()),
        )
        .unwrap();
        let guard = table.attach();

        registry.register_by_caller(guard.thread_id(), Arc::new(Exec("a"))).unwrap();
        assert!(module.is_locked());

        registry.terminate().unwrap();
        assert!(!module.is_locked());
        assert!(registry.is_empty());

        // A second terminate is a no-op.
        registry.terminate().unwrap();
        assert_eq!(module.count(), 0);
    }

    #[test]
    fn test_snapshot_is_bounded_and_duplicated() {
        let table = Arc::new(ThreadTable::new());
        let registry = lock_step(&table);
        let guards: Vec<_> = (0..5).map(|_| table.attach()).collect();
        for guard in &guards {
            registry.register_by_caller(guard.thread_id(), Arc::new(Exec("t"))).unwrap();
        }

        let snapshot = registry.snapshot_live_threads(3);
        assert_eq!(snapshot.len(), 3);

        // Removing an entry must not signal the snapshot's copy.
        let (id, handle) = &snapshot[0];
        registry.remove(*id).unwrap();
        assert!(!handle.is_signaled());
    }

    #[test]
    fn test_complete_without_pending_is_rejected() {
        let table = Arc::new(ThreadTable::new());
        let registry = lock_step(&table);
        let guard = table.attach();

        assert!(matches!(
            registry.complete_registration(guard.thread_id(), Arc::new(Exec("x"))),
            Err(BrokerError::InvalidArgument(_))
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_begin_registration_deduplicates() {
        let table = Arc::new(ThreadTable::new());
        let registry = lock_step(&table);
        let guard = table.attach();
        let id = guard.thread_id();

        let first = registry.lookup_or_begin_registration(id);
        let second = registry.lookup_or_begin_registration(id);
        assert!(matches!(first, Lookup::MustCreate(_)));
        assert!(matches!(second, Lookup::Pending(_)));
        assert_eq!(registry.pending_count(), 1);

        let Lookup::MustCreate(ticket) = first else {
            unreachable!()
        };
        let (_wait, completer) = ticket.into_parts();
        completer.complete(Arc::new(Exec("made"))).unwrap();

        assert_eq!(registry.pending_count(), 0);
        assert!(matches!(registry.lookup_or_begin_registration(id), Lookup::Found(_)));
    }

    #[test]
    fn test_tab_bindings_through_registry() {
        let table = Arc::new(ThreadTable::new());
        let registry = lock_step(&table);

        registry.bind_tab(TabId::new(1), WindowHandle::new(0x100)).unwrap();
        registry.bind_tool_band(TabId::new(2), WindowHandle::new(0x200)).unwrap();

        assert_eq!(
            registry.bind_tool_band(TabId::new(1), WindowHandle::new(0x300)),
            Err(BrokerError::AlreadyPresent)
        );
        assert_eq!(registry.tab_handle(TabId::new(1)), Some(WindowHandle::new(0x100)));
        assert_eq!(registry.tab_id_for_handle(WindowHandle::new(0x100)), Some(TabId::new(1)));
        assert_eq!(registry.tool_band_handle(TabId::new(2)), Some(WindowHandle::new(0x200)));

        assert_eq!(
            registry.unbind_handle(WindowHandle::new(0x200)),
            Ok(vec![Namespace::ToolBand])
        );
        assert_eq!(registry.tool_band_id_for_handle(WindowHandle::new(0x200)), None);
        assert_eq!(registry.tab_handle(TabId::new(1)), Some(WindowHandle::new(0x100)));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let table = Arc::new(ThreadTable::new());
        let config = BrokerConfig {
            wait_bound: 1,
            ..BrokerConfig::lock_step()
        };
        let result = ExecutorRegistry::<Exec>::new(config, Collaborators::new(table));
        assert!(matches!(result, Err(BrokerError::InvalidArgument(_))));
    }

    /// Module lock whose first `on_became_nonempty` blocks until released.
    struct StalledLock {
        module: ModuleLock,
        entered: Sender<()>,
        release: Receiver<()>,
        stalled: AtomicBool,
    }

    impl KeepAlive for StalledLock {
        fn on_became_nonempty(&self) {
            if !self.stalled.swap(true, Ordering::SeqCst) {
                let _ = self.entered.send(());
                let _ = self.release.recv();
            }
            self.module.on_became_nonempty();
        }
        fn on_became_empty(&self) {
            self.module.on_became_empty();
        }
    }

    #[test]
    fn test_slow_lock_hook_cannot_outlive_removal() {
        let table = Arc::new(ThreadTable::new());
        let (entered_tx, entered_rx) = bounded(1);
        let (release_tx, release_rx) = bounded(1);
        let keep_alive = Arc::new(StalledLock {
            module: ModuleLock::new(),
            entered: entered_tx,
            release: release_rx,
            stalled: AtomicBool::new(false),
        });
        let registry = Arc::new(
            ExecutorRegistry::<Exec>::new(
                BrokerConfig::lock_step(),
                Collaborators::new(table.clone()).with_keep_alive(keep_alive.clone()),
            )
            .unwrap(),
        );
        let guard = table.attach();
        let id = guard.thread_id();

        let adder = {
            let registry = registry.clone();
            thread::spawn(move || registry.register_by_caller(id, Arc::new(Exec("a"))))
        };
        entered_rx.recv().unwrap();

        // The entry is visible while the lock hook is still running.
        let remover = {
            let registry = registry.clone();
            thread::spawn(move || registry.remove(id).map(|_| ()))
        };
        thread::sleep(Duration::from_millis(20));
        release_tx.send(()).unwrap();

        assert_eq!(adder.join().unwrap(), Ok(Registration::Inserted));
        assert_eq!(remover.join().unwrap(), Ok(()));
        assert!(registry.is_empty());
        assert_eq!(keep_alive.module.count(), 0);
    }

    #[test]
    fn test_registration_refused_after_terminate() {
        let table = Arc::new(ThreadTable::new());
        let module = Arc::new(ModuleLock::new());
        let registry = ExecutorRegistry::<Exec>::new(
            BrokerConfig::lock_step(),
            Collaborators::new(table.clone()).with_keep_alive(module.clone()),
        )
        .unwrap();
        registry.terminate().unwrap();

        let guard = table.attach();
        let id = guard.thread_id();
        assert!(matches!(
            registry.register_by_caller(id, Arc::new(Exec("late"))),
            Err(BrokerError::InvalidArgument(_))
        ));

        let Lookup::MustCreate(ticket) = registry.lookup_or_begin_registration(id) else {
            panic!("expected to become the creator");
        };
        let (wait, completer) = ticket.into_parts();
        assert!(matches!(
            completer.complete(Arc::new(Exec("late"))),
            Err(BrokerError::InvalidArgument(_))
        ));
        assert_eq!(wait.wait(Duration::from_millis(10)), WaitOutcome::Signaled);

        assert!(registry.is_empty());
        drop(registry);
        assert_eq!(module.count(), 0);
    }
}
