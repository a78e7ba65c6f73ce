//! Shared rich-text document backed by a yrs `XmlFragment`.
//!
//! Layout (editor compatible):
//! ```text
//! XmlFragment "prosemirror"
//!   ├── <paragraph> ── XmlText (formatted runs)
//!   ├── <paragraph> ── XmlText
//!   └── …
//! ```
//!
//! Every local edit runs in exactly one yrs transaction and yields the v1
//! update of that transaction. Remote updates carry their own causal
//! metadata, so they may arrive late, twice, or out of order and replicas
//! still converge.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use yrs::types::text::YChange;
use yrs::types::Attrs;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
    Any, Doc, GetString, OffsetKind, Options, Out, ReadTxn, StateVector, Text, Transact,
    TransactionMut, Update, XmlElementPrelim, XmlElementRef, XmlFragment, XmlFragmentRef, XmlOut,
    XmlTextPrelim, XmlTextRef,
};

/// Root fragment name shared with the editor's sync plugin.
pub const FRAGMENT_NAME: &str = "prosemirror";

/// Element tag used for block-level paragraphs.
pub const PARAGRAPH_TAG: &str = "paragraph";

/// Errors raised by [`SharedDocument`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DocumentError {
    /// The bytes are not a valid v1 update or state vector.
    #[error("malformed update: {0}")]
    MalformedUpdate(String),
    /// A decoded update could not be integrated.
    #[error("merge failed: {0}")]
    Merge(String),
    /// A local edit addressed content that does not exist.
    #[error("invalid edit: {0}")]
    InvalidEdit(String),
}

/// Inline formatting mark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mark {
    Bold,
    Italic,
    Underline,
    Strike,
    Code,
}

impl Mark {
    pub const ALL: [Mark; 5] = [Mark::Bold, Mark::Italic, Mark::Underline, Mark::Strike, Mark::Code];

    /// Attribute key used inside the yrs text.
    pub fn as_str(&self) -> &'static str {
        match self {
            Mark::Bold => "bold",
            Mark::Italic => "italic",
            Mark::Underline => "underline",
            Mark::Strike => "strike",
            Mark::Code => "code",
        }
    }

    pub fn from_attr(key: &str) -> Option<Self> {
        Mark::ALL.into_iter().find(|m| m.as_str() == key)
    }
}

/// A local mutation. Offsets are UTF-16 code units within one paragraph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Edit {
    InsertParagraph {
        at: u32,
    },
    RemoveParagraph {
        at: u32,
    },
    Insert {
        paragraph: u32,
        offset: u32,
        text: String,
        #[serde(default)]
        marks: Vec<Mark>,
    },
    Delete {
        paragraph: u32,
        offset: u32,
        len: u32,
    },
    Format {
        paragraph: u32,
        offset: u32,
        len: u32,
        mark: Mark,
        enabled: bool,
    },
}

/// A run of text sharing one set of marks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub text: String,
    pub marks: Vec<Mark>,
}

/// One block-level node of the fragment, as seen by a renderer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub tag: String,
    pub spans: Vec<Span>,
}

impl Block {
    pub fn plain_text(&self) -> String {
        self.spans.iter().map(|s| s.text.as_str()).collect()
    }
}

/// A CRDT replica of the shared document.
pub struct SharedDocument {
    doc: Doc,
    fragment: XmlFragmentRef,
}

impl SharedDocument {
    /// Create an empty replica with a random client id.
    pub fn new() -> Self {
        Self::from_options(Self::options(Options::default()))
    }

    /// Create an empty replica with a fixed client id (tests, deterministic replays).
    pub fn with_client_id(client_id: u64) -> Self {
        Self::from_options(Self::options(Options::with_client_id(client_id)))
    }

    /// Build a replica from a full-state snapshot.
    pub fn from_snapshot(snapshot: &[u8]) -> Result<Self, DocumentError> {
        let mut doc = Self::new();
        doc.apply_remote(snapshot)?;
        Ok(doc)
    }

    fn options(mut options: Options) -> Options {
        options.offset_kind = OffsetKind::Utf16;
        options
    }

    fn from_options(options: Options) -> Self {
        let doc = Doc::with_options(options);
        let fragment = doc.get_or_insert_xml_fragment(FRAGMENT_NAME);
        Self { doc, fragment }
    }

    pub fn client_id(&self) -> u64 {
        self.doc.client_id()
    }

    /// Raw fragment handle for editor sync plugins.
    pub fn xml_fragment(&self) -> XmlFragmentRef {
        self.fragment.clone()
    }

    /// Apply a local edit and return the delta to broadcast.
    ///
    /// The edit is validated before the transaction mutates anything, so a
    /// rejected edit leaves the replica untouched.
    pub fn apply_local(&mut self, edit: &Edit) -> Result<Vec<u8>, DocumentError> {
        let mut txn = self.doc.transact_mut();
        let paragraphs = self.fragment.len(&txn);

        match edit {
            Edit::InsertParagraph { at } => {
                if *at > paragraphs {
                    return Err(DocumentError::InvalidEdit(format!(
                        "paragraph index {at} out of range (len {paragraphs})"
                    )));
                }
                let element = self
                    .fragment
                    .insert(&mut txn, *at, XmlElementPrelim::empty(PARAGRAPH_TAG));
                element.insert(&mut txn, 0, XmlTextPrelim::new(""));
            }
            Edit::RemoveParagraph { at } => {
                if *at >= paragraphs {
                    return Err(DocumentError::InvalidEdit(format!(
                        "paragraph index {at} out of range (len {paragraphs})"
                    )));
                }
                self.fragment.remove_range(&mut txn, *at, 1);
            }
            Edit::Insert { paragraph, offset, text, marks } => {
                let target = Self::paragraph(&self.fragment, &txn, *paragraph)?;
                target.check_range(&txn, *offset, 0)?;
                if !text.is_empty() {
                    let target = target.into_text(&mut txn);
                    target.insert_with_attributes(&mut txn, *offset, text, mark_attrs(marks));
                }
            }
            Edit::Delete { paragraph, offset, len } => {
                let target = Self::paragraph(&self.fragment, &txn, *paragraph)?;
                target.check_range(&txn, *offset, *len)?;
                if *len > 0 {
                    target.into_text(&mut txn).remove_range(&mut txn, *offset, *len);
                }
            }
            Edit::Format { paragraph, offset, len, mark, enabled } => {
                let target = Self::paragraph(&self.fragment, &txn, *paragraph)?;
                target.check_range(&txn, *offset, *len)?;
                if *len > 0 {
                    let value = if *enabled { Any::Bool(true) } else { Any::Null };
                    let attrs = Attrs::from([(Arc::<str>::from(mark.as_str()), value)]);
                    target.into_text(&mut txn).format(&mut txn, *offset, *len, attrs);
                }
            }
        }

        Ok(txn.encode_update_v1())
    }

    /// Merge an update produced by another replica.
    ///
    /// Already-integrated updates are no-ops; updates whose dependencies
    /// have not arrived yet are held as pending until they do.
    pub fn apply_remote(&mut self, update: &[u8]) -> Result<(), DocumentError> {
        let update = Update::decode_v1(update)
            .map_err(|e| DocumentError::MalformedUpdate(e.to_string()))?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| DocumentError::Merge(e.to_string()))
    }

    /// Encode the entire document state as one update.
    pub fn snapshot(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Encoded state vector of this replica.
    pub fn state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Encode everything this replica has that `state_vector` has not seen.
    pub fn diff_since(&self, state_vector: &[u8]) -> Result<Vec<u8>, DocumentError> {
        let remote = StateVector::decode_v1(state_vector)
            .map_err(|e| DocumentError::MalformedUpdate(e.to_string()))?;
        let txn = self.doc.transact();
        Ok(txn.encode_diff_v1(&remote))
    }

    /// Number of top-level blocks.
    pub fn paragraph_count(&self) -> u32 {
        let txn = self.doc.transact();
        self.fragment.len(&txn)
    }

    /// Plain text, one line per block.
    pub fn text(&self) -> String {
        self.blocks()
            .iter()
            .map(Block::plain_text)
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Serialized XML form of the fragment. Equal strings mean equal content.
    pub fn xml(&self) -> String {
        let txn = self.doc.transact();
        self.fragment.get_string(&txn)
    }

    /// Structured tree of blocks and marked spans.
    pub fn blocks(&self) -> Vec<Block> {
        let txn = self.doc.transact();
        let mut blocks = Vec::new();
        for index in 0..self.fragment.len(&txn) {
            match self.fragment.get(&txn, index) {
                Some(XmlOut::Element(element)) => {
                    let mut spans = Vec::new();
                    for child in 0..element.len(&txn) {
                        if let Some(XmlOut::Text(text)) = element.get(&txn, child) {
                            spans.extend(text_spans(&text, &txn));
                        }
                    }
                    blocks.push(Block { tag: element.tag().to_string(), spans });
                }
                Some(XmlOut::Text(text)) => blocks.push(Block {
                    tag: "text".to_string(),
                    spans: text_spans(&text, &txn),
                }),
                _ => {}
            }
        }
        blocks
    }

    /// Resolve paragraph `index` without mutating the document.
    fn paragraph<T: ReadTxn>(
        fragment: &XmlFragmentRef,
        txn: &T,
        index: u32,
    ) -> Result<ParagraphTarget, DocumentError> {
        match fragment.get(txn, index) {
            Some(XmlOut::Element(element)) => match element.get(txn, 0) {
                Some(XmlOut::Text(text)) => Ok(ParagraphTarget::Text(text)),
                Some(_) => Err(DocumentError::InvalidEdit(format!(
                    "paragraph {index} does not start with text"
                ))),
                None => Ok(ParagraphTarget::Empty(element)),
            },
            Some(XmlOut::Text(text)) => Ok(ParagraphTarget::Text(text)),
            _ => Err(DocumentError::InvalidEdit(format!(
                "paragraph index {index} out of range"
            ))),
        }
    }
}

/// Text content of one paragraph. Peers may send a paragraph with no
/// `XmlText` child; its text node is created only by an edit that succeeds.
enum ParagraphTarget {
    Text(XmlTextRef),
    Empty(XmlElementRef),
}

impl ParagraphTarget {
    fn len<T: ReadTxn>(&self, txn: &T) -> u32 {
        match self {
            ParagraphTarget::Text(text) => text.len(txn),
            ParagraphTarget::Empty(_) => 0,
        }
    }

    fn check_range<T: ReadTxn>(&self, txn: &T, offset: u32, len: u32) -> Result<(), DocumentError> {
        let available = self.len(txn);
        if offset.checked_add(len).map_or(true, |end| end > available) {
            return Err(DocumentError::InvalidEdit(format!(
                "range {offset}+{len} exceeds paragraph length {available}"
            )));
        }
        Ok(())
    }

    fn into_text(self, txn: &mut TransactionMut) -> XmlTextRef {
        match self {
            ParagraphTarget::Text(text) => text,
            ParagraphTarget::Empty(element) => element.insert(txn, 0, XmlTextPrelim::new("")),
        }
    }
}

impl Default for SharedDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SharedDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedDocument")
            .field("client_id", &self.client_id())
            .field("paragraphs", &self.paragraph_count())
            .finish()
    }
}

/// Every known mark is set explicitly so inserted text never inherits
/// formatting from its left neighbour.
fn mark_attrs(marks: &[Mark]) -> Attrs {
    let mut attrs: Attrs = HashMap::new();
    for mark in Mark::ALL {
        let value = if marks.contains(&mark) { Any::Bool(true) } else { Any::Null };
        attrs.insert(Arc::from(mark.as_str()), value);
    }
    attrs
}

fn text_spans<T: ReadTxn>(text: &XmlTextRef, txn: &T) -> Vec<Span> {
    text.diff(txn, YChange::identity)
        .into_iter()
        .filter_map(|diff| {
            let Out::Any(Any::String(chunk)) = diff.insert else {
                return None;
            };
            let mut marks: Vec<Mark> = diff
                .attributes
                .map(|attrs| {
                    attrs
                        .iter()
                        .filter(|(_, v)| !matches!(v, Any::Null | Any::Bool(false)))
                        .filter_map(|(k, _)| Mark::from_attr(k))
                        .collect()
                })
                .unwrap_or_default();
            marks.sort();
            Some(Span { text: chunk.to_string(), marks })
        })
        .collect()
}
