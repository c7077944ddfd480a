//! fOS Broker host
//!
//! Runs a handful of tab worker threads against the executor registry:
//! on-demand executor creation, self-registration, tab id lookups and
//! reclamation of closed tabs by the watcher.

mod host;

use anyhow::Result;
use fos_broker::{
    BrokerConfig, Collaborators, ExecutorRegistry, ModuleLock, TabId, ThreadTable, WindowHandle,
};
use host::TabHost;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

// Use mimalloc as the global allocator for reduced memory fragmentation
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

const TAB_COUNT: i32 = 3;
const SCRIPT_TIMEOUT: Duration = Duration::from_secs(2);

fn load_config() -> Result<BrokerConfig> {
    let path = std::env::args_os()
        .nth(1)
        .or_else(|| std::env::var_os("FOS_BROKER_CONFIG"))
        .map(PathBuf::from);

    match path {
        Some(path) => {
            info!(path = %path.display(), "Loading broker config");
            Ok(BrokerConfig::from_file(&path)?)
        }
        None => Ok(BrokerConfig::default()),
    }
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .compact()
        .init();

    info!("fOS broker starting...");
    let config = load_config()?;

    let threads = Arc::new(ThreadTable::new());
    let module = Arc::new(ModuleLock::new());
    let mut host = TabHost::new(threads.clone());
    let registry = Arc::new(ExecutorRegistry::new(
        config,
        Collaborators::new(threads.clone())
            .with_keep_alive(module.clone())
            .with_factory(Arc::new(host.factory())),
    )?);

    // The first tab registers its own executor; the others wait to be asked.
    let mut tabs = Vec::new();
    for n in 1..=TAB_COUNT {
        let tab_id = TabId::new(n);
        let window = WindowHandle::new(0x1000 * n as usize);
        let thread_id = host.open_tab(tab_id, window, &registry, n == 1)?;
        tabs.push((tab_id, window, thread_id));
    }

    for (tab_id, window, thread_id) in &tabs {
        let executor = match registry.get_executor(*thread_id, *window) {
            Ok(executor) => executor,
            Err(e) if e.is_retriable() => {
                warn!(thread_id = %thread_id, error = %e, "Executor not ready, retrying once");
                registry.get_executor(*thread_id, *window)?
            }
            Err(e) => return Err(e.into()),
        };
        let title = executor.execute("document.title", SCRIPT_TIMEOUT)?;
        info!(tab_id = %tab_id, thread_id = %thread_id, %title, "Executor answered");
    }
    info!(
        executors = registry.len(),
        module_locked = module.is_locked(),
        "All tabs reachable"
    );

    // Closing a tab without removing its executor leaves it to the watcher.
    let (closed_tab, closed_window, closed_thread) = tabs[1];
    host.close_tab(closed_thread, &registry);
    let start = Instant::now();
    while registry.contains(closed_thread) && start.elapsed() < SCRIPT_TIMEOUT {
        thread::sleep(Duration::from_millis(10));
    }
    if registry.contains(closed_thread) {
        warn!(thread_id = %closed_thread, "Closed tab was not reclaimed");
    } else {
        info!(tab_id = %closed_tab, window = %closed_window, "Closed tab reclaimed by watcher");
    }

    // Explicit removal for the remaining tabs, then shutdown.
    for thread_id in host.thread_ids() {
        if let Some(window) = host.window(thread_id) {
            if let Some(tab_id) = registry.tab_id_for_handle(window) {
                info!(tab_id = %tab_id, "Releasing executor");
            }
        }
        match registry.remove(thread_id) {
            Ok(executor) => {
                info!(thread_id = %thread_id, executed = executor.executed(), "Executor removed")
            }
            Err(e) if e.is_benign() => debug!(thread_id = %thread_id, "Executor already gone"),
            Err(e) => warn!(thread_id = %thread_id, error = %e, "Executor removal failed"),
        }
    }
    host.shutdown(&registry);
    registry.terminate()?;

    info!(
        tabs = host.tab_count(),
        module_locked = module.is_locked(),
        "fOS broker shutting down"
    );
    Ok(())
}
