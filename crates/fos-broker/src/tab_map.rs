//! Tab id <-> window handle maps.
//!
//! Two bidirectional namespaces, content tabs and tool bands. An id or a
//! handle is bound in at most one of them. The registry keeps these maps
//! under its own lock; on their own they are plain data.

use crate::error::{BrokerError, Result};
use crate::ids::{Namespace, TabId, WindowHandle};
use std::collections::HashMap;
use tracing::warn;

#[derive(Debug, Default)]
struct Bimap {
    by_id: HashMap<TabId, WindowHandle>,
    by_handle: HashMap<WindowHandle, TabId>,
}

impl Bimap {
    fn insert(&mut self, id: TabId, handle: WindowHandle) {
        self.by_id.insert(id, handle);
        self.by_handle.insert(handle, id);
    }

    fn remove_handle(&mut self, handle: WindowHandle) -> Option<TabId> {
        let id = self.by_handle.remove(&handle)?;
        // Only drop the forward direction if it still points back at us.
        if self.by_id.get(&id) == Some(&handle) {
            self.by_id.remove(&id);
        }
        Some(id)
    }

    fn len(&self) -> usize {
        self.by_id.len()
    }
}

/// Both tab namespaces.
#[derive(Debug, Default)]
pub struct TabMaps {
    content: Bimap,
    tool_band: Bimap,
}

impl TabMaps {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self, namespace: Namespace) -> &Bimap {
        match namespace {
            Namespace::Content => &self.content,
            Namespace::ToolBand => &self.tool_band,
        }
    }

    fn map_mut(&mut self, namespace: Namespace) -> &mut Bimap {
        match namespace {
            Namespace::Content => &mut self.content,
            Namespace::ToolBand => &mut self.tool_band,
        }
    }

    /// Bind `id <-> handle` in `namespace`.
    ///
    /// Rejects sentinel values, and ids or handles already bound in either
    /// namespace. Nothing is inserted on failure.
    pub fn bind(&mut self, id: TabId, handle: WindowHandle, namespace: Namespace) -> Result<()> {
        if !id.is_valid() || !handle.is_valid() {
            warn!(tab_id = %id, handle = %handle, %namespace, "Refusing to bind sentinel value");
            return Err(BrokerError::InvalidArgument(format!(
                "cannot bind {id} to {handle}"
            )));
        }

        let taken = [&self.content, &self.tool_band]
            .iter()
            .any(|m| m.by_id.contains_key(&id) || m.by_handle.contains_key(&handle));
        if taken {
            warn!(tab_id = %id, handle = %handle, %namespace, "Tab id or handle already bound");
            return Err(BrokerError::AlreadyPresent);
        }

        self.map_mut(namespace).insert(id, handle);
        Ok(())
    }

    /// Remove every binding of `handle`, whichever namespace holds it.
    ///
    /// Returns the namespaces that held it, or `NotFound` if none did.
    pub fn unbind(&mut self, handle: WindowHandle) -> Result<Vec<Namespace>> {
        let mut removed = Vec::new();
        for namespace in [Namespace::Content, Namespace::ToolBand] {
            if self.map_mut(namespace).remove_handle(handle).is_some() {
                removed.push(namespace);
            }
        }

        if removed.is_empty() {
            warn!(handle = %handle, "Unbinding unknown handle");
            return Err(BrokerError::NotFound);
        }
        Ok(removed)
    }

    /// Window handle bound to `id` in `namespace`.
    pub fn resolve(&self, id: TabId, namespace: Namespace) -> Option<WindowHandle> {
        self.map(namespace).by_id.get(&id).copied()
    }

    /// Tab id bound to `handle` in `namespace`.
    pub fn resolve_handle(&self, handle: WindowHandle, namespace: Namespace) -> Option<TabId> {
        self.map(namespace).by_handle.get(&handle).copied()
    }

    /// Number of bindings in `namespace`.
    pub fn len(&self, namespace: Namespace) -> usize {
        self.map(namespace).len()
    }

    pub fn is_empty(&self) -> bool {
        self.content.len() == 0 && self.tool_band.len() == 0
    }
}
