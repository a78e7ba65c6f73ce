//! # quire-core — shared document model for Quire
//!
//! - [`document`]: CRDT replica of the rich-text document (yrs `XmlFragment`)
//! - [`surface`]: what the editing surface must offer the sync and review layers

pub mod document;
pub mod surface;

pub use document::{Block, DocumentError, Edit, Mark, SharedDocument, Span, FRAGMENT_NAME, PARAGRAPH_TAG};
pub use surface::{
    AttachedPlugins, ChangeListener, EditingSurface, ListenerHandle, Marker, PluginHandle,
    PluginHost, PluginKind, RenderBinding, SurfaceError, TextSpan,
};
