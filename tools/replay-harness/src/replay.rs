//! Strict in-order replay of a loaded trajectory.
//!
//! The engine answers "what response should this request get" by comparing
//! the request against the matcher at the current cursor position only.
//! Any call-order drift in the consumer fails immediately instead of being
//! silently reordered.

use crate::errors::HarnessError;
use crate::trajectory::{render_excerpt, RequestMatcher, StepResponse, Trajectory};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

// ── Wire types ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// The subset of a chat-completions request the matcher looks at.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompletionRequest {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
}

impl CompletionRequest {
    pub fn last_user_message(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.content.as_str())
    }

    /// Compact rendering for mismatch diagnostics.
    pub fn describe(&self) -> String {
        let user = self.last_user_message().unwrap_or("<no user message>");
        format!(
            "model={:?} last_user_message={:?}",
            self.model,
            render_excerpt(user)
        )
    }
}

fn matcher_satisfied(matcher: &RequestMatcher, request: &CompletionRequest) -> bool {
    if let Some(expected) = &matcher.user_message {
        if request.last_user_message() != Some(expected.as_str()) {
            return false;
        }
    }
    if let Some(fragment) = &matcher.user_message_contains {
        let satisfied = request
            .last_user_message()
            .is_some_and(|m| m.contains(fragment.as_str()));
        if !satisfied {
            return false;
        }
    }
    if let Some(model) = &matcher.model {
        if &request.model != model {
            return false;
        }
    }
    true
}

// ── ReplayEngine ──────────────────────────────────────────────────────────────

/// Owns the replay cursor for one trajectory, for the lifetime of one test.
pub struct ReplayEngine {
    trajectory: Trajectory,
    next_index: Mutex<usize>,
}

impl ReplayEngine {
    pub fn new(trajectory: Trajectory) -> Self {
        Self {
            trajectory,
            next_index: Mutex::new(0),
        }
    }

    pub fn step_count(&self) -> usize {
        self.trajectory.len()
    }

    /// Current cursor position: steps served so far.
    pub fn position(&self) -> usize {
        *self.next_index.lock().expect("cursor lock")
    }

    pub fn is_exhausted(&self) -> bool {
        self.position() == self.trajectory.len()
    }

    /// Serve the response for `request`, enforcing strict in-order replay.
    ///
    /// The cursor advances by exactly one on a match and never otherwise.
    pub fn handle(&self, request: &CompletionRequest) -> Result<StepResponse, HarnessError> {
        let mut index = self.next_index.lock().expect("cursor lock");
        let step = self.trajectory.steps.get(*index).ok_or(
            HarnessError::TrajectoryExhausted {
                step_count: self.trajectory.len(),
            },
        )?;
        if !matcher_satisfied(&step.matcher, request) {
            return Err(HarnessError::UnexpectedRequest {
                index: *index,
                expected: step.matcher.describe(),
                actual: request.describe(),
            });
        }
        let response = step.response.clone();
        *index += 1;
        Ok(response)
    }
}
