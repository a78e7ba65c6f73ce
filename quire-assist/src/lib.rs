//! # quire-assist — AI writing aids for the Quire editor
//!
//! - [`ai`]: the text-transform collaborator and its chat-completions client
//! - [`grammar`]: grammar/spelling check and reply parsing
//! - [`review`]: debounced background review of the editing surface
//! - [`rewrite`]: rewrite a selection or generate text from an instruction
//!
//! ```text
//! EditingSurface ──change──► ReviewCycle ──► GrammarChecker ──► TextTransform
//!       ▲                        │                                  (HTTPS)
//!       └──── underline spans ◄──┘
//! ```

pub mod ai;
pub mod grammar;
pub mod review;
pub mod rewrite;

pub use ai::{AiConfig, AssistError, ChatCompletionClient, TextTransform};
pub use grammar::{parse_issues, GrammarChecker, GrammarIssue, IssueKind, IssuePosition, Severity};
pub use review::{ReviewConfig, ReviewCycle, ReviewPhase};
pub use rewrite::{RewriteAssistant, RewriteState};
