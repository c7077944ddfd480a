//! Tab worker threads that host executors.
//!
//! Each tab runs on its own named thread. The factory routes creation
//! requests to the target thread, which builds the executor and completes
//! the registration itself.

use anyhow::{anyhow, Result};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use fos_broker::{
    CreationRequest, ExecutorFactory, ExecutorRegistry, LivenessGuard, TabId, ThreadId,
    ThreadTable, WindowHandle,
};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Messages sent to a tab worker.
pub enum HostMessage {
    /// Build an executor on this thread and complete its registration
    CreateExecutor(CreationRequest<TabExecutor>),
    /// Run a script, replying with its result
    Execute { script: String, reply: Sender<String> },
    /// Graceful shutdown request
    Shutdown,
}

/// Proxy that runs work on one tab worker thread.
#[derive(Debug)]
pub struct TabExecutor {
    thread_id: ThreadId,
    tab_id: TabId,
    tx: Sender<HostMessage>,
    executed: AtomicUsize,
}

impl TabExecutor {
    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    pub fn tab_id(&self) -> TabId {
        self.tab_id
    }

    /// Number of scripts sent through this executor.
    pub fn executed(&self) -> usize {
        self.executed.load(Ordering::Relaxed)
    }

    /// Run `script` on the tab's thread and wait for the result.
    pub fn execute(&self, script: &str, timeout: Duration) -> Result<String> {
        let (reply, rx) = bounded(1);
        self.tx
            .send(HostMessage::Execute {
                script: script.to_string(),
                reply,
            })
            .map_err(|_| anyhow!("{} has shut down", self.thread_id))?;
        self.executed.fetch_add(1, Ordering::Relaxed);
        Ok(rx.recv_timeout(timeout)?)
    }
}

type Senders = Arc<Mutex<HashMap<ThreadId, Sender<HostMessage>>>>;

/// Routes creation requests to the worker thread they target.
pub struct HostFactory {
    senders: Senders,
}

impl ExecutorFactory<TabExecutor> for HostFactory {
    fn create_executor(&self, request: CreationRequest<TabExecutor>) -> Result<()> {
        let thread_id = request.thread_id;
        let sender = self
            .senders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&thread_id)
            .cloned()
            .ok_or_else(|| anyhow!("no tab worker for {thread_id}"))?;

        debug!(thread_id = %thread_id, window = %request.window, "Routing executor creation");
        sender
            .send(HostMessage::CreateExecutor(request))
            .map_err(|_| anyhow!("tab worker {thread_id} is gone"))
    }

    fn teardown(&self, thread_id: ThreadId) -> Result<()> {
        debug!(thread_id = %thread_id, "Executor creation observed");
        Ok(())
    }
}

/// A running tab worker.
struct Worker {
    tab_id: TabId,
    window: WindowHandle,
    handle: JoinHandle<()>,
}

/// Pool of tab worker threads.
pub struct TabHost {
    threads: Arc<ThreadTable>,
    senders: Senders,
    workers: HashMap<ThreadId, Worker>,
}

impl TabHost {
    pub fn new(threads: Arc<ThreadTable>) -> Self {
        Self {
            threads,
            senders: Arc::new(Mutex::new(HashMap::new())),
            workers: HashMap::new(),
        }
    }

    /// Factory to install in the registry.
    pub fn factory(&self) -> HostFactory {
        HostFactory {
            senders: self.senders.clone(),
        }
    }

    /// Spawn a worker for `tab_id` and bind the tab to `window`.
    ///
    /// With `self_register` the worker registers its own executor as soon as
    /// it starts instead of waiting to be asked.
    pub fn open_tab(
        &mut self,
        tab_id: TabId,
        window: WindowHandle,
        registry: &Arc<ExecutorRegistry<TabExecutor>>,
        self_register: bool,
    ) -> Result<ThreadId> {
        registry.bind_tab(tab_id, window)?;

        let guard = self.threads.attach();
        let thread_id = guard.thread_id();
        let (tx, rx) = unbounded();

        let eager = self_register.then(|| registry.clone());
        let handle = match spawn_worker(guard, tab_id, tx.clone(), rx, eager) {
            Ok(handle) => handle,
            Err(e) => {
                let _ = registry.unbind_handle(window);
                return Err(e);
            }
        };
        self.senders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(thread_id, tx);
        self.workers.insert(
            thread_id,
            Worker {
                tab_id,
                window,
                handle,
            },
        );

        info!(tab_id = %tab_id, thread_id = %thread_id, "Opened tab");
        Ok(thread_id)
    }

    /// Stop a tab's worker and unbind its window.
    ///
    /// The executor entry is left for the registry's watcher to reclaim.
    pub fn close_tab(
        &mut self,
        thread_id: ThreadId,
        registry: &ExecutorRegistry<TabExecutor>,
    ) -> bool {
        let Some(worker) = self.workers.remove(&thread_id) else {
            return false;
        };

        if let Some(tx) = self
            .senders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&thread_id)
        {
            let _ = tx.send(HostMessage::Shutdown);
        }
        if worker.handle.join().is_err() {
            error!(thread_id = %thread_id, "Tab worker panicked on shutdown");
        }
        if let Err(e) = registry.unbind_handle(worker.window) {
            warn!(tab_id = %worker.tab_id, error = %e, "Tab window was not bound");
        }

        info!(tab_id = %worker.tab_id, thread_id = %thread_id, "Closed tab");
        true
    }

    pub fn thread_ids(&self) -> Vec<ThreadId> {
        self.workers.keys().copied().collect()
    }

    pub fn window(&self, thread_id: ThreadId) -> Option<WindowHandle> {
        self.workers.get(&thread_id).map(|w| w.window)
    }

    pub fn tab_count(&self) -> usize {
        self.workers.len()
    }

    /// Close every tab.
    pub fn shutdown(&mut self, registry: &ExecutorRegistry<TabExecutor>) {
        for thread_id in self.thread_ids() {
            self.close_tab(thread_id, registry);
        }
    }
}

fn spawn_worker(
    guard: LivenessGuard,
    tab_id: TabId,
    tx: Sender<HostMessage>,
    rx: Receiver<HostMessage>,
    registry: Option<Arc<ExecutorRegistry<TabExecutor>>>,
) -> Result<JoinHandle<()>> {
    let thread_id = guard.thread_id();
    let handle = thread::Builder::new()
        .name(format!("tab-worker-{}", tab_id.0))
        .spawn(move || {
            // Dropped when the thread ends, which signals the registry's watcher.
            let _guard = guard;
            info!(thread_id = %thread_id, "Tab worker started");

            if let Some(registry) = registry {
                let executor = Arc::new(TabExecutor {
                    thread_id,
                    tab_id,
                    tx: tx.clone(),
                    executed: AtomicUsize::new(0),
                });
                if let Err(e) = registry.register_by_caller(thread_id, executor) {
                    warn!(thread_id = %thread_id, error = %e, "Self-registration failed");
                }
            }

            run_worker_loop(thread_id, tab_id, &tx, rx);
            info!(thread_id = %thread_id, "Tab worker stopped");
        })?;
    Ok(handle)
}

/// Main worker loop with panic isolation.
fn run_worker_loop(
    thread_id: ThreadId,
    tab_id: TabId,
    tx: &Sender<HostMessage>,
    rx: Receiver<HostMessage>,
) {
    loop {
        let msg = match rx.recv() {
            Ok(msg) => msg,
            Err(_) => {
                debug!(thread_id = %thread_id, "Channel closed, shutting down");
                break;
            }
        };

        match msg {
            HostMessage::Shutdown => {
                debug!(thread_id = %thread_id, "Received shutdown");
                break;
            }
            HostMessage::CreateExecutor(request) => {
                let target = request.completer.thread_id();
                if target != thread_id {
                    // Dropping the completer abandons the registration.
                    warn!(thread_id = %thread_id, target = %target, "Misrouted executor creation");
                    continue;
                }
                let executor = Arc::new(TabExecutor {
                    thread_id,
                    tab_id,
                    tx: tx.clone(),
                    executed: AtomicUsize::new(0),
                });
                if let Err(e) = request.completer.complete(executor) {
                    warn!(thread_id = %thread_id, error = %e, "Could not complete registration");
                }
            }
            HostMessage::Execute { script, reply } => {
                let result = panic::catch_unwind(AssertUnwindSafe(|| run_script(tab_id, &script)));
                let output = match result {
                    Ok(output) => output,
                    Err(panic_info) => {
                        let error_msg = if let Some(s) = panic_info.downcast_ref::<&str>() {
                            s.to_string()
                        } else if let Some(s) = panic_info.downcast_ref::<String>() {
                            s.clone()
                        } else {
                            "Unknown panic".to_string()
                        };
                        error!(thread_id = %thread_id, "Script panicked: {}", error_msg);
                        format!("error: {error_msg}")
                    }
                };
                let _ = reply.send(output);
            }
        }
    }
}

fn run_script(tab_id: TabId, script: &str) -> String {
    match script {
        "document.title" => format!("Page {}", tab_id.0),
        "throw" => panic!("script threw"),
        other => format!("{tab_id}: {other}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fos_broker::{BrokerConfig, BrokerError, Collaborators, Lookup, WaitOutcome};
    use std::time::Instant;

    fn setup() -> (Arc<ThreadTable>, TabHost, Arc<ExecutorRegistry<TabExecutor>>) {
        let threads = Arc::new(ThreadTable::new());
        let host = TabHost::new(threads.clone());
        let config = BrokerConfig {
            spawn_watcher: true,
            registration_timeout_ms: 2_000,
            ..BrokerConfig::lock_step()
        };
        let registry = ExecutorRegistry::new(
            config,
            Collaborators::new(threads.clone()).with_factory(Arc::new(host.factory())),
        )
        .unwrap();
        (threads, host, Arc::new(registry))
    }

    #[test]
    fn test_executor_created_on_worker_thread() {
        let (_threads, mut host, registry) = setup();
        let window = WindowHandle::new(0x1000);
        let thread_id = host.open_tab(TabId::new(1), window, &registry, false).unwrap();

        let executor = registry.get_executor(thread_id, window).unwrap();
        assert_eq!(executor.thread_id(), thread_id);
        assert_eq!(
            executor.execute("document.title", Duration::from_secs(1)).unwrap(),
            "Page 1"
        );

        host.shutdown(&registry);
    }

    #[test]
    fn test_self_registered_worker() {
        let (_threads, mut host, registry) = setup();
        let window = WindowHandle::new(0x2000);
        let thread_id = host.open_tab(TabId::new(2), window, &registry, true).unwrap();

        let start = Instant::now();
        while !registry.contains(thread_id) && start.elapsed() < Duration::from_secs(2) {
            thread::sleep(Duration::from_millis(5));
        }
        let executor = registry.get_executor(thread_id, window).unwrap();
        assert_eq!(executor.tab_id(), TabId::new(2));

        host.shutdown(&registry);
    }

    #[test]
    fn test_script_panic_is_isolated() {
        let (_threads, mut host, registry) = setup();
        let window = WindowHandle::new(0x3000);
        let thread_id = host.open_tab(TabId::new(3), window, &registry, false).unwrap();
        let executor = registry.get_executor(thread_id, window).unwrap();

        let output = executor.execute("throw", Duration::from_secs(1)).unwrap();
        assert!(output.starts_with("error:"));

        // The worker keeps serving.
        assert_eq!(
            executor.execute("document.title", Duration::from_secs(1)).unwrap(),
            "Page 3"
        );
        assert_eq!(executor.executed(), 2);

        host.shutdown(&registry);
    }

    #[test]
    fn test_closed_tab_is_reclaimed_and_unbound() {
        let (_threads, mut host, registry) = setup();
        let window = WindowHandle::new(0x4000);
        let thread_id = host.open_tab(TabId::new(4), window, &registry, false).unwrap();
        registry.get_executor(thread_id, window).unwrap();

        assert!(host.close_tab(thread_id, &registry));
        assert_eq!(registry.tab_handle(TabId::new(4)), None);

        let start = Instant::now();
        while registry.contains(thread_id) && start.elapsed() < Duration::from_secs(2) {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(!registry.contains(thread_id));
    }

    #[test]
    fn test_unknown_thread_fails_creation() {
        let (_threads, _host, registry) = setup();

        let err = registry
            .get_executor(ThreadId::new(404), WindowHandle::new(0x5000))
            .unwrap_err();
        assert!(matches!(err, BrokerError::CreationFailed(_)));
    }

    #[test]
    fn test_misrouted_creation_is_abandoned() {
        let (threads, mut host, registry) = setup();
        let window = WindowHandle::new(0x6000);
        let worker_id = host.open_tab(TabId::new(6), window, &registry, false).unwrap();
        let other = threads.attach();

        let Lookup::MustCreate(ticket) = registry.lookup_or_begin_registration(other.thread_id())
        else {
            panic!("expected to become the creator");
        };
        let (wait, completer) = ticket.into_parts();
        host.factory()
            .create_executor(CreationRequest {
                thread_id: worker_id,
                window,
                completer,
            })
            .unwrap();

        assert_eq!(wait.wait(Duration::from_secs(1)), WaitOutcome::Signaled);
        assert!(!registry.contains(other.thread_id()));
        assert!(!registry.contains(worker_id));
        assert_eq!(registry.pending_count(), 0);

        host.shutdown(&registry);
    }
}
