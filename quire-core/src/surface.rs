//! Interfaces the editing surface exposes to the sync and review layers.
//!
//! The surface itself (rendering, input, selection) lives outside this
//! workspace. It is reached only through these traits:
//!
//! - [`EditingSurface`]: read plain text, listen for document changes,
//!   mark a text span.
//! - [`PluginHost`]: register/unregister CRDT-driven rendering plugins.
//!
//! Whether a surface accepts plugins at runtime is decided once, when the
//! binder is built, through [`RenderBinding`].

use std::sync::Arc;

/// Errors reported by the editing surface.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SurfaceError {
    #[error("surface does not support {0}")]
    Unsupported(&'static str),
    #[error("surface rejected request: {0}")]
    Rejected(String),
}

/// Half-open span `[start, end)` in plain-text character offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextSpan {
    pub start: usize,
    pub end: usize,
}

impl TextSpan {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

/// Transient visual decoration applied to a span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Marker {
    Underline,
    Highlight,
}

/// Callback invoked after every document-changing transaction.
pub type ChangeListener = Box<dyn Fn() + Send + Sync>;

/// Opaque registration returned by [`EditingSurface::on_change`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerHandle(pub u64);

/// The editor as seen by the review cycle.
pub trait EditingSurface: Send + Sync {
    /// Current plain-text content.
    fn plain_text(&self) -> String;

    /// Register a listener for document changes (not selection-only changes).
    fn on_change(&self, listener: ChangeListener) -> ListenerHandle;

    /// Drop a listener. Unknown handles are ignored.
    fn off_change(&self, handle: ListenerHandle);

    /// Select `span` and decorate it with `marker`.
    fn mark_span(&self, span: TextSpan, marker: Marker) -> Result<(), SurfaceError>;

    /// Remove every decoration of kind `marker`.
    fn clear_markers(&self, marker: Marker);
}

/// Rendering plugins a sync binder can attach.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginKind {
    /// Renders the shared fragment and forwards local transactions.
    Sync { fragment: String },
    /// Renders remote cursors from presence state.
    Cursor { local_client_id: u64 },
    /// Scoped undo over local changes only.
    Undo,
}

/// Opaque registration returned by [`PluginHost::register_plugin`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PluginHandle(pub u64);

/// A surface that accepts plugin registration at runtime.
pub trait PluginHost: Send + Sync {
    fn register_plugin(&self, kind: &PluginKind) -> Result<PluginHandle, SurfaceError>;
    fn unregister_plugin(&self, handle: PluginHandle) -> Result<(), SurfaceError>;
}

/// How CRDT rendering is wired into the surface.
#[derive(Clone)]
pub enum RenderBinding {
    /// Plugins are attached and detached through the host at runtime.
    Dynamic(Arc<dyn PluginHost>),
    /// The surface binds the fragment itself when it is constructed;
    /// attach/detach are no-ops.
    Static,
}

impl std::fmt::Debug for RenderBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RenderBinding::Dynamic(_) => f.write_str("RenderBinding::Dynamic"),
            RenderBinding::Static => f.write_str("RenderBinding::Static"),
        }
    }
}

/// Tracks the plugins one binder attached so they can all be detached.
#[derive(Debug)]
pub struct AttachedPlugins {
    binding: RenderBinding,
    handles: Vec<PluginHandle>,
    attached: bool,
}

impl AttachedPlugins {
    pub fn new(binding: RenderBinding) -> Self {
        Self { binding, handles: Vec::new(), attached: false }
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    /// Number of plugin registrations currently held.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Attach `kinds`. Repeated calls while attached are no-ops.
    ///
    /// A plugin the host refuses is logged and skipped; the rest stay
    /// registered. Returns the number of newly registered plugins.
    pub fn attach(&mut self, kinds: &[PluginKind]) -> usize {
        if self.attached {
            return 0;
        }
        self.attached = true;

        let RenderBinding::Dynamic(host) = &self.binding else {
            return 0;
        };
        for kind in kinds {
            match host.register_plugin(kind) {
                Ok(handle) => self.handles.push(handle),
                Err(e) => log::warn!("Plugin {kind:?} not registered: {e}"),
            }
        }
        self.handles.len()
    }

    /// Unregister everything attached. Safe to call when not attached.
    pub fn detach(&mut self) {
        if let RenderBinding::Dynamic(host) = &self.binding {
            for handle in self.handles.drain(..) {
                if let Err(e) = host.unregister_plugin(handle) {
                    log::warn!("Plugin {handle:?} not unregistered: {e}");
                }
            }
        }
        self.handles.clear();
        self.attached = false;
    }
}
