//! Registration handshake.
//!
//! One thread asks for the executor of another thread. If none exists the
//! first caller becomes the creator: it hands a [`CreationRequest`] to the
//! executor factory and waits, together with any later callers, on the
//! pending registration's completion signal. The signal is broadcast: it
//! fires by disconnecting, so every waiter wakes at once.

use crate::error::{BrokerError, Result};
use crate::ids::{ThreadId, WindowHandle};
use crate::registry::{ExecutorRegistry, Shared};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Creates executors for threads on demand.
///
/// `create_executor` starts creation and may return before the executor
/// exists. Whoever ends up holding the request's [`Completer`] finishes the
/// registration, typically from the target thread itself.
pub trait ExecutorFactory<E: ?Sized + Send + Sync + 'static>: Send + Sync {
    fn create_executor(&self, request: CreationRequest<E>) -> anyhow::Result<()>;

    /// Called once the creator has observed the end of the handshake, on
    /// success and on timeout alike.
    fn teardown(&self, _thread_id: ThreadId) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Result of [`ExecutorRegistry::lookup_or_begin_registration`].
pub enum Lookup<E: ?Sized + Send + Sync + 'static> {
    /// The executor is registered
    Found(Arc<E>),
    /// Another caller is creating it; wait on the token
    Pending(RegistrationWait),
    /// Nobody is creating it; the holder of the ticket must
    MustCreate(CreationTicket<E>),
}

impl<E: ?Sized + Send + Sync + 'static> fmt::Debug for Lookup<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Found(_) => write!(f, "Found"),
            Self::Pending(wait) => write!(f, "Pending({})", wait.thread_id),
            Self::MustCreate(ticket) => write!(f, "MustCreate({})", ticket.wait.thread_id),
        }
    }
}

/// How a registration wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The pending registration completed or was abandoned
    Signaled,
    /// The bound passed first
    TimedOut,
}

/// Duplicate of a pending registration's completion signal.
#[derive(Debug, Clone)]
pub struct RegistrationWait {
    thread_id: ThreadId,
    generation: u64,
    gate: Receiver<()>,
}

impl RegistrationWait {
    pub(crate) fn new(thread_id: ThreadId, generation: u64, gate: Receiver<()>) -> Self {
        Self {
            thread_id,
            generation,
            gate,
        }
    }

    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub fn wait(&self, timeout: Duration) -> WaitOutcome {
        match self.gate.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => WaitOutcome::TimedOut,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => WaitOutcome::Signaled,
        }
    }
}

/// Authority to create the executor for one pending registration.
pub struct CreationTicket<E: ?Sized + Send + Sync + 'static> {
    wait: RegistrationWait,
    completer: Completer<E>,
}

impl<E: ?Sized + Send + Sync + 'static> CreationTicket<E> {
    pub(crate) fn new(wait: RegistrationWait, shared: Arc<Shared<E>>) -> Self {
        let completer = Completer {
            shared,
            thread_id: wait.thread_id,
            generation: wait.generation,
            done: false,
        };
        Self { wait, completer }
    }

    pub fn into_parts(self) -> (RegistrationWait, Completer<E>) {
        (self.wait, self.completer)
    }
}

/// One-shot completion of a pending registration.
///
/// Dropping it without calling [`complete`](Self::complete) abandons the
/// registration, so waiters never block past their bound on a creator that
/// gave up.
pub struct Completer<E: ?Sized + Send + Sync + 'static> {
    shared: Arc<Shared<E>>,
    thread_id: ThreadId,
    generation: u64,
    done: bool,
}

impl<E: ?Sized + Send + Sync + 'static> Completer<E> {
    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    /// Record `executor` for the thread and wake every waiter.
    pub fn complete(mut self, executor: Arc<E>) -> Result<()> {
        self.done = true;
        self.shared
            .finish_registration(self.thread_id, Some(self.generation), Some(executor))
    }

    /// Wake every waiter without recording anything.
    pub fn abandon(mut self) {
        self.done = true;
        let _ = self
            .shared
            .finish_registration(self.thread_id, Some(self.generation), None);
    }
}

impl<E: ?Sized + Send + Sync + 'static> Drop for Completer<E> {
    fn drop(&mut self) {
        if !self.done {
            debug!(thread_id = %self.thread_id, "Completer dropped unused");
            let _ = self
                .shared
                .finish_registration(self.thread_id, Some(self.generation), None);
        }
    }
}

/// Handed to [`ExecutorFactory::create_executor`].
pub struct CreationRequest<E: ?Sized + Send + Sync + 'static> {
    /// Thread the executor must serve
    pub thread_id: ThreadId,
    /// Window the request originated from
    pub window: WindowHandle,
    /// Finishes the registration once the executor exists
    pub completer: Completer<E>,
}

impl<E: ?Sized + Send + Sync + 'static> ExecutorRegistry<E> {
    /// Executor for `thread_id`, creating it through the factory if needed.
    ///
    /// Concurrent callers for the same thread share one creation. Every wait
    /// is bounded by the configured registration timeout; after it the
    /// registry is checked once more before `Timeout` is reported.
    pub fn get_executor(&self, thread_id: ThreadId, window: WindowHandle) -> Result<Arc<E>> {
        let (wait, creator) = match self.lookup_or_begin_registration(thread_id) {
            Lookup::Found(executor) => return Ok(executor),
            Lookup::Pending(wait) => (wait, None),
            Lookup::MustCreate(ticket) => {
                let (wait, completer) = ticket.into_parts();
                let Some(factory) = self.factory.clone() else {
                    completer.abandon();
                    return Err(BrokerError::InvalidArgument(
                        "no executor factory configured".to_string(),
                    ));
                };

                let request = CreationRequest {
                    thread_id,
                    window,
                    completer,
                };
                if let Err(e) = factory.create_executor(request) {
                    // Most likely the target thread died before it could be reached.
                    warn!(thread_id = %thread_id, error = %e, "Executor creation failed");
                    self.shared.cancel_pending(thread_id, wait.generation());
                    return Err(BrokerError::CreationFailed(e.to_string()));
                }
                (wait, Some(factory))
            }
        };

        let outcome = wait.wait(self.shared.config.registration_timeout());
        if outcome == WaitOutcome::TimedOut {
            info!(thread_id = %thread_id, "Registration wait timed out");
        }

        if let Some(factory) = creator {
            if let Err(e) = factory.teardown(thread_id) {
                warn!(thread_id = %thread_id, error = %e, "Executor factory teardown failed");
            }
        }

        self.shared.cancel_pending(thread_id, wait.generation());
        match (self.shared.lookup(thread_id), outcome) {
            (Some(executor), _) => Ok(executor),
            (None, WaitOutcome::TimedOut) => Err(BrokerError::Timeout),
            (None, WaitOutcome::Signaled) => Err(BrokerError::CreationFailed(format!(
                "registration of {thread_id} did not complete"
            ))),
        }
    }
}
