//! Watcher thread that reclaims the entries of exited threads.
//!
//! Each cycle snapshots up to `wait_bound - 2` liveness handles and blocks on
//! all of them plus the terminate and update signals. Registries holding
//! more threads than that watch only the first ones per cycle; the rest are
//! picked up as watched threads exit.

use crate::error::BrokerError;
use crate::ids::ThreadId;
use crate::registry::Shared;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Select, Sender};
use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, trace};

/// Lifecycle of the watcher thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherStatus {
    /// Never started
    Disabled,
    /// Reclaiming dead threads
    Running,
    /// Exited on an unexpected failure; entries of dead threads go stale
    Faulted,
    /// Exited on request
    Stopped,
}

/// What ended one watcher cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// Termination was requested
    Terminated,
    /// The set of registered threads changed
    Updated,
    /// A watched thread exited and its entry was reclaimed
    ThreadExited(ThreadId),
    /// Nothing fired within the cycle's timeout
    TimedOut,
}

impl fmt::Display for WatchEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Terminated => write!(f, "terminated"),
            Self::Updated => write!(f, "updated"),
            Self::ThreadExited(id) => write!(f, "{id} exited"),
            Self::TimedOut => write!(f, "timed out"),
        }
    }
}

/// Running watcher thread.
pub(crate) struct WatcherHandle {
    terminate: Option<Sender<()>>,
    done: Receiver<()>,
    thread: JoinHandle<()>,
}

impl WatcherHandle {
    /// Signal termination and wait up to `timeout` for the thread to exit.
    pub(crate) fn stop(mut self, timeout: Duration) -> Result<(), BrokerError> {
        drop(self.terminate.take());
        match self.done.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => Err(BrokerError::Timeout),
            _ => {
                self.join();
                Ok(())
            }
        }
    }

    pub(crate) fn join(self) {
        if self.thread.join().is_err() {
            error!("Watcher thread panicked");
        }
    }
}

/// Spawn the watcher thread for `shared`.
pub(crate) fn spawn_watcher<E>(shared: Arc<Shared<E>>) -> io::Result<WatcherHandle>
where
    E: ?Sized + Send + Sync + 'static,
{
    // Dropping the sender is the terminate signal; it stays raised for good.
    let (terminate_tx, terminate_rx) = bounded::<()>(0);
    // Disconnects when the thread finishes, however it finishes.
    let (done_tx, done_rx) = bounded::<()>(0);
    let update_rx = shared.update_receiver();

    let previous = shared.watcher_status();
    shared.set_watcher_status(WatcherStatus::Running);

    let spawned = thread::Builder::new()
        .name("executor-watcher".to_string())
        .spawn({
            let shared = shared.clone();
            move || {
                let _done = done_tx;
                debug!("Watcher started");
                run_watcher_loop(&shared, &update_rx, &terminate_rx);
                debug!("Watcher stopped");
            }
        });

    match spawned {
        Ok(thread) => Ok(WatcherHandle {
            terminate: Some(terminate_tx),
            done: done_rx,
            thread,
        }),
        Err(e) => {
            shared.set_watcher_status(previous);
            Err(e)
        }
    }
}

fn run_watcher_loop<E>(shared: &Shared<E>, update_rx: &Receiver<()>, terminate_rx: &Receiver<()>)
where
    E: ?Sized + Send + Sync + 'static,
{
    loop {
        // A panicking hook must not take the process down with it.
        let event = panic::catch_unwind(AssertUnwindSafe(|| {
            watch_cycle(shared, update_rx, terminate_rx, None)
        }));

        match event {
            Ok(WatchEvent::Terminated) => {
                shared.set_watcher_status(WatcherStatus::Stopped);
                break;
            }
            Ok(WatchEvent::Updated) => trace!("Watch list update requested"),
            Ok(WatchEvent::ThreadExited(thread_id)) => {
                debug!(thread_id = %thread_id, "Reclaimed executor of exited thread");
            }
            Ok(WatchEvent::TimedOut) => {}
            Err(panic_info) => {
                let reason = if let Some(s) = panic_info.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic_info.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "Unknown panic".to_string()
                };
                error!(%reason, "Watcher panicked");
                shared.set_watcher_status(WatcherStatus::Faulted);
                break;
            }
        }
    }
}

/// One snapshot-and-wait cycle. `timeout == None` blocks indefinitely.
pub(crate) fn watch_cycle<E>(
    shared: &Shared<E>,
    update_rx: &Receiver<()>,
    terminate_rx: &Receiver<()>,
    timeout: Option<Duration>,
) -> WatchEvent
where
    E: ?Sized + Send + Sync + 'static,
{
    let snapshot = shared.snapshot_live_threads(shared.config.watch_capacity());

    let mut select = Select::new();
    for (_, handle) in &snapshot {
        select.recv(handle.receiver());
    }
    let terminate_index = select.recv(terminate_rx);
    let update_index = select.recv(update_rx);

    let oper = match timeout {
        None => select.select(),
        Some(timeout) => match select.select_timeout(timeout) {
            Ok(oper) => oper,
            Err(_) => return WatchEvent::TimedOut,
        },
    };

    let index = oper.index();
    if index == terminate_index {
        let _ = oper.recv(terminate_rx);
        WatchEvent::Terminated
    } else if index == update_index {
        // `Shared` owns the sender, so this never reports a disconnect.
        let _ = oper.recv(update_rx);
        WatchEvent::Updated
    } else {
        let (thread_id, handle) = &snapshot[index];
        let _ = oper.recv(handle.receiver());
        // An explicit removal may have won the race; then there is nothing to do.
        shared.remove_watched(*thread_id, handle);
        WatchEvent::ThreadExited(*thread_id)
    }
}
