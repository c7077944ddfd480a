//! fOS Executor Broker
//!
//! Cross-thread executor registry for the browser process:
//! - Maps thread ids to the executor serving each thread
//! - Creates executors on demand with a de-duplicated, bounded handshake
//! - Reclaims entries from a watcher thread when their thread exits
//! - Keeps the tab id <-> window handle maps for content tabs and tool bands
//!
//! # Usage
//!
//! ```rust,ignore
//! let threads = Arc::new(ThreadTable::new());
//! let registry = ExecutorRegistry::new(
//!     BrokerConfig::default(),
//!     Collaborators::new(threads.clone()).with_factory(factory),
//! )?;
//!
//! // On the tab's own thread
//! let guard = threads.attach();
//! registry.register_by_caller(guard.thread_id(), executor)?;
//!
//! // From any other thread
//! let executor = registry.get_executor(thread_id, window)?;
//! ```

mod config;
mod error;
mod ids;
mod keepalive;
mod liveness;
mod registration;
mod registry;
mod tab_map;
mod watcher;

pub use config::{BrokerConfig, ConfigError, CONTROL_SLOTS, DEFAULT_WAIT_BOUND};
pub use error::{BrokerError, Result};
pub use ids::{Namespace, TabId, ThreadId, WindowHandle};
pub use keepalive::{KeepAlive, ModuleLock, NoKeepAlive};
pub use liveness::{LivenessGuard, LivenessHandle, LivenessSource, ThreadTable};
pub use registration::{
    Completer, CreationRequest, CreationTicket, ExecutorFactory, Lookup, RegistrationWait,
    WaitOutcome,
};
pub use registry::{Collaborators, ExecutorRegistry, Registration};
pub use tab_map::TabMaps;
pub use watcher::{WatchEvent, WatcherStatus};
