//! Keyboard-Interactive Authentication Support
//!
//! The server sends zero or more rounds of prompts. Each prompt is answered
//! one at a time, in order, either by an inline callback or by a delegate
//! registered on the session. The session only keeps a weak reference to the
//! delegate; a delegate that has been dropped counts as "not registered".

use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// A single prompt from the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KbiPrompt {
    /// The prompt text to display
    pub prompt: String,
    /// true = show input (echo), false = mask input (password-style)
    pub echo: bool,
}

/// One step of the keyboard-interactive exchange as seen by the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KbiStep {
    Success,
    Failure,
    /// InfoRequest from the server
    Prompts {
        name: String,
        instructions: String,
        prompts: Vec<KbiPrompt>,
    },
}

/// Inline prompt handler: request text in, response out
pub type PromptCallback = Box<dyn FnMut(&str) -> String + Send + 'static>;

/// Observer answering keyboard-interactive prompts on behalf of a session
pub trait KeyboardInteractiveDelegate: Send + Sync {
    /// Return the response for one server prompt
    fn answer_prompt(&self, prompt: &KbiPrompt) -> String;

    /// Called with the server's banner message, if it sends one
    fn banner(&self, _message: &str) {}
}

/// Non-owning slot holding the registered delegate
#[derive(Default, Clone)]
pub struct DelegateSlot {
    inner: Arc<RwLock<Option<Weak<dyn KeyboardInteractiveDelegate>>>>,
}

impl DelegateSlot {
    pub fn set(&self, delegate: &Arc<dyn KeyboardInteractiveDelegate>) {
        *self.inner.write() = Some(Arc::downgrade(delegate));
    }

    pub fn clear(&self) {
        *self.inner.write() = None;
    }

    /// Upgrade the stored reference; `None` if unset or already dropped
    pub fn get(&self) -> Option<Arc<dyn KeyboardInteractiveDelegate>> {
        self.inner.read().as_ref().and_then(Weak::upgrade)
    }
}

impl std::fmt::Debug for DelegateSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelegateSlot")
            .field("registered", &self.get().is_some())
            .finish()
    }
}
