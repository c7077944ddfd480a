//! Thread liveness handles.
//!
//! A liveness handle becomes signaled exactly when its thread terminates.
//! Handles are backed by a channel nobody ever sends on: the thread owns the
//! only sender (inside its [`LivenessGuard`]) and dropping it disconnects
//! every receiver at once. Duplicating a handle clones the receiver, so one
//! holder closing its copy never disturbs another holder's wait.

use crate::error::{BrokerError, Result};
use crate::ids::ThreadId;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tracing::debug;

/// Source of liveness handles for thread ids.
pub trait LivenessSource: Send + Sync {
    /// Open a handle for `thread_id`.
    ///
    /// Fails with [`BrokerError::InvalidThread`] when the thread no longer
    /// exists.
    fn open(&self, thread_id: ThreadId) -> Result<LivenessHandle>;
}

/// Waitable that fires when its thread exits.
#[derive(Debug)]
pub struct LivenessHandle {
    thread_id: ThreadId,
    rx: Receiver<()>,
}

impl LivenessHandle {
    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    /// Independent copy of this handle.
    pub fn duplicate(&self) -> Self {
        Self {
            thread_id: self.thread_id,
            rx: self.rx.clone(),
        }
    }

    /// True once the thread has exited.
    pub fn is_signaled(&self) -> bool {
        matches!(self.rx.try_recv(), Err(TryRecvError::Disconnected) | Ok(()))
    }

    /// Block until the thread exits or `timeout` passes. Returns true if the
    /// thread exited.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        !matches!(self.rx.recv_timeout(timeout), Err(RecvTimeoutError::Timeout))
    }

    pub(crate) fn receiver(&self) -> &Receiver<()> {
        &self.rx
    }
}

type Threads = Mutex<HashMap<ThreadId, Receiver<()>>>;

fn lock_threads(threads: &Threads) -> MutexGuard<'_, HashMap<ThreadId, Receiver<()>>> {
    threads.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Held by a live thread. Dropping it signals every handle for the thread
/// and forgets the thread in its table.
#[derive(Debug)]
pub struct LivenessGuard {
    thread_id: ThreadId,
    table: Weak<Threads>,
    rx: Receiver<()>,
    _alive: Sender<()>,
}

impl LivenessGuard {
    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }
}

impl Drop for LivenessGuard {
    fn drop(&mut self) {
        if let Some(threads) = self.table.upgrade() {
            let mut threads = lock_threads(&threads);
            // The id may already belong to a newer attachment.
            if threads
                .get(&self.thread_id)
                .is_some_and(|rx| rx.same_channel(&self.rx))
            {
                threads.remove(&self.thread_id);
            }
        }
        debug!(thread_id = %self.thread_id, "Thread detached");
    }
}

/// In-process table of attached threads.
///
/// A thread calls [`ThreadTable::attach`] when it starts and keeps the
/// returned guard for as long as it runs.
pub struct ThreadTable {
    next_id: AtomicU64,
    threads: Arc<Threads>,
}

impl ThreadTable {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            threads: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Attach a thread under a freshly allocated id.
    pub fn attach(&self) -> LivenessGuard {
        let thread_id = ThreadId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = bounded(0);
        self.lock().insert(thread_id, rx.clone());
        debug!(thread_id = %thread_id, "Thread attached");
        self.guard(thread_id, rx, tx)
    }

    /// Attach a thread under a caller-chosen id.
    ///
    /// An id whose previous owner has exited may be reused.
    pub fn attach_as(&self, thread_id: ThreadId) -> Result<LivenessGuard> {
        let mut threads = self.lock();
        if threads.get(&thread_id).is_some_and(is_alive) {
            return Err(BrokerError::AlreadyPresent);
        }
        let (tx, rx) = bounded(0);
        threads.insert(thread_id, rx.clone());
        drop(threads);

        debug!(thread_id = %thread_id, "Thread attached");
        Ok(self.guard(thread_id, rx, tx))
    }

    fn guard(&self, thread_id: ThreadId, rx: Receiver<()>, tx: Sender<()>) -> LivenessGuard {
        LivenessGuard {
            thread_id,
            table: Arc::downgrade(&self.threads),
            rx,
            _alive: tx,
        }
    }

    pub fn is_alive(&self, thread_id: ThreadId) -> bool {
        self.lock().get(&thread_id).is_some_and(is_alive)
    }

    /// Number of attached threads.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ThreadId, Receiver<()>>> {
        lock_threads(&self.threads)
    }
}

impl Default for ThreadTable {
    fn default() -> Self {
        Self::new()
    }
}

impl LivenessSource for ThreadTable {
    fn open(&self, thread_id: ThreadId) -> Result<LivenessHandle> {
        let mut threads = self.lock();
        match threads.get(&thread_id) {
            Some(rx) if is_alive(rx) => Ok(LivenessHandle {
                thread_id,
                rx: rx.clone(),
            }),
            Some(_) => {
                threads.remove(&thread_id);
                Err(BrokerError::InvalidThread(thread_id))
            }
            None => Err(BrokerError::InvalidThread(thread_id)),
        }
    }
}

fn is_alive(rx: &Receiver<()>) -> bool {
    matches!(rx.try_recv(), Err(TryRecvError::Empty))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_handle_fires_on_guard_drop() {
        let table = ThreadTable::new();
        let guard = table.attach();
        let handle = table.open(guard.thread_id()).unwrap();

        assert!(!handle.is_signaled());
        drop(guard);
        assert!(handle.is_signaled());
        assert!(handle.wait_timeout(Duration::from_millis(1)));
    }

    #[test]
    fn test_open_dead_thread_is_invalid() {
        let table = ThreadTable::new();
        let guard = table.attach();
        let id = guard.thread_id();
        drop(guard);

        assert_eq!(table.open(id).unwrap_err(), BrokerError::InvalidThread(id));
        assert_eq!(
            table.open(ThreadId::new(999)).unwrap_err(),
            BrokerError::InvalidThread(ThreadId::new(999))
        );
    }

    #[test]
    fn test_duplicate_survives_original_drop() {
        let table = ThreadTable::new();
        let guard = table.attach();
        let handle = table.open(guard.thread_id()).unwrap();
        let copy = handle.duplicate();
        drop(handle);

        assert!(!copy.wait_timeout(Duration::from_millis(10)));
        drop(guard);
        assert!(copy.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn test_attach_as_rejects_live_id() {
        let table = ThreadTable::new();
        let id = ThreadId::new(7);
        let guard = table.attach_as(id).unwrap();

        assert_eq!(table.attach_as(id).unwrap_err(), BrokerError::AlreadyPresent);

        drop(guard);
        let again = table.attach_as(id).unwrap();
        assert!(table.is_alive(again.thread_id()));
    }

    #[test]
    fn test_real_thread_exit() {
        let table = std::sync::Arc::new(ThreadTable::new());
        let (id_tx, id_rx) = crossbeam_channel::bounded(1);
        let (go_tx, go_rx) = crossbeam_channel::bounded::<()>(1);

        let worker = {
            let table = table.clone();
            thread::spawn(move || {
                let guard = table.attach();
                id_tx.send(guard.thread_id()).unwrap();
                let _ = go_rx.recv();
            })
        };

        let id = id_rx.recv().unwrap();
        let handle = table.open(id).unwrap();
        assert!(!handle.is_signaled());

        go_tx.send(()).unwrap();
        worker.join().unwrap();
        assert!(handle.wait_timeout(Duration::from_secs(1)));
    }

    #[test]
    fn test_exited_threads_are_forgotten() {
        let table = std::sync::Arc::new(ThreadTable::new());
        let keep = table.attach();

        let workers: Vec<_> = (0..16)
            .map(|_| {
                let table = table.clone();
                thread::spawn(move || {
                    let _guard = table.attach();
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(table.len(), 1);
        assert!(table.is_alive(keep.thread_id()));
        drop(keep);
        assert!(table.is_empty());
    }

    #[test]
    fn test_guard_outliving_table() {
        let table = ThreadTable::new();
        let guard = table.attach();
        drop(table);
        drop(guard);
    }
}
