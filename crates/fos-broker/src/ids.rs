//! Identifier types shared by the registry, the id maps and the watcher.

use std::fmt;

/// Logical identifier of a thread that can host an executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(pub u64);

impl ThreadId {
    /// Create a new thread ID.
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Thread({})", self.0)
    }
}

/// Logical tab identifier, as handed out by the browser session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TabId(pub i32);

impl TabId {
    /// Sentinel that never names a real tab.
    pub const INVALID: TabId = TabId(-1);

    /// Create a new tab ID.
    pub fn new(id: i32) -> Self {
        Self(id)
    }

    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }
}

impl fmt::Display for TabId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tab({})", self.0)
    }
}

/// Native window handle of a tab.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WindowHandle(pub usize);

impl WindowHandle {
    /// Sentinel that never names a real window.
    pub const INVALID: WindowHandle = WindowHandle(usize::MAX);

    pub fn new(raw: usize) -> Self {
        Self(raw)
    }

    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }
}

impl fmt::Display for WindowHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Window({:#x})", self.0)
    }
}

/// Which id namespace a tab binding lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    /// Ids of content tabs
    Content,
    /// Ids handed out to tool bands
    ToolBand,
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Content => write!(f, "content"),
            Self::ToolBand => write!(f, "tool-band"),
        }
    }
}
