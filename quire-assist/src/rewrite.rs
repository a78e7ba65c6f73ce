//! Selection rewrite and free-form generation.

use std::sync::Arc;

use tokio::sync::watch;

use crate::ai::TextTransform;

/// Observable state of the last rewrite request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RewriteState {
    pub is_loading: bool,
    pub error: Option<String>,
    pub result: Option<String>,
}

/// Rewrites text through the transform collaborator.
///
/// Failures never propagate: they land in [`RewriteState::error`] and the
/// call returns `None`.
pub struct RewriteAssistant {
    transform: Arc<dyn TextTransform>,
    state: watch::Sender<RewriteState>,
}

impl RewriteAssistant {
    pub fn new(transform: Arc<dyn TextTransform>) -> Self {
        Self { transform, state: watch::Sender::new(RewriteState::default()) }
    }

    /// Rewrite `selected` according to `instruction`.
    pub async fn optimize_selected_text(&self, selected: &str, instruction: &str) -> Option<String> {
        let prompt = format!(
            "Rewrite the text below as instructed.\n\
             Instruction: {instruction}\n\
             Text: {selected}\n\
             Reply with the rewritten text only, without any explanation."
        );
        self.run(&prompt).await
    }

    /// Produce new text from `instruction` alone.
    pub async fn generate_text(&self, instruction: &str) -> Option<String> {
        let prompt = format!(
            "Write text as instructed.\n\
             Instruction: {instruction}\n\
             Reply with the text only, without any explanation."
        );
        self.run(&prompt).await
    }

    pub fn state(&self) -> RewriteState {
        self.state.borrow().clone()
    }

    pub fn is_loading(&self) -> bool {
        self.state.borrow().is_loading
    }

    pub fn subscribe(&self) -> watch::Receiver<RewriteState> {
        self.state.subscribe()
    }

    async fn run(&self, prompt: &str) -> Option<String> {
        self.state.send_replace(RewriteState { is_loading: true, error: None, result: None });

        match self.transform.transform(prompt).await {
            Ok(text) => {
                self.state.send_replace(RewriteState {
                    is_loading: false,
                    error: None,
                    result: Some(text.clone()),
                });
                Some(text)
            }
            Err(e) => {
                log::warn!("Rewrite failed: {e}");
                self.state.send_replace(RewriteState {
                    is_loading: false,
                    error: Some(e.to_string()),
                    result: None,
                });
                None
            }
        }
    }
}
