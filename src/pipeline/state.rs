//! Explicit state machine for one run. The retry budget lives here so the
//! "at most one retry, at most two renders" rule holds regardless of how the
//! orchestrator's control flow is arranged.

use serde::{Deserialize, Serialize};

/// Render calls allowed for a single request: the initial one plus one retry.
pub const MAX_RENDER_CALLS: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineState {
    Init,
    Resolving,
    Prompting,
    Rendering,
    Assessing,
    RetryPrompting,
    RetryRendering,
    RetryAssessing,
    Done,
}

impl PipelineState {
    fn allows(self, next: PipelineState) -> bool {
        use PipelineState::*;
        matches!(
            (self, next),
            (Init, Resolving)
                | (Resolving, Prompting)
                | (Prompting, Rendering)
                | (Rendering, Assessing)
                | (Assessing, RetryPrompting)
                | (RetryPrompting, RetryRendering)
                | (RetryRendering, RetryAssessing)
        ) || (next == Done && self != Done)
    }

    pub fn is_rendering(self) -> bool {
        matches!(self, PipelineState::Rendering | PipelineState::RetryRendering)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StateError {
    #[error("invalid pipeline transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: PipelineState,
        to: PipelineState,
    },
    #[error("retry budget exhausted")]
    RetryBudgetExhausted,
    #[error("render limit of {0} calls reached")]
    RenderLimit(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudget {
    remaining: u8,
}

impl RetryBudget {
    pub const fn new(retries: u8) -> Self {
        RetryBudget { remaining: retries }
    }

    pub fn remaining(&self) -> u8 {
        self.remaining
    }

    /// Takes one retry if any are left.
    pub fn try_consume(&mut self) -> bool {
        if self.remaining == 0 {
            return false;
        }
        self.remaining -= 1;
        true
    }
}

impl Default for RetryBudget {
    fn default() -> Self {
        RetryBudget::new(1)
    }
}

#[derive(Debug, Clone)]
pub struct RetryMachine {
    state: PipelineState,
    budget: RetryBudget,
    render_calls: u32,
    history: Vec<PipelineState>,
}

impl Default for RetryMachine {
    fn default() -> Self {
        RetryMachine::new()
    }
}

impl RetryMachine {
    pub fn new() -> Self {
        RetryMachine {
            state: PipelineState::Init,
            budget: RetryBudget::default(),
            render_calls: 0,
            history: vec![PipelineState::Init],
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn render_calls(&self) -> u32 {
        self.render_calls
    }

    pub fn retried(&self) -> bool {
        self.history.contains(&PipelineState::RetryPrompting)
    }

    pub fn history(&self) -> &[PipelineState] {
        &self.history
    }

    pub fn advance(&mut self, next: PipelineState) -> Result<(), StateError> {
        if next == PipelineState::RetryPrompting {
            return Err(StateError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.transition(next)
    }

    fn transition(&mut self, next: PipelineState) -> Result<(), StateError> {
        if !self.state.allows(next) {
            return Err(StateError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.history.push(next);
        Ok(())
    }

    /// Enters the retry branch, spending the budget. Only valid after the
    /// first assessment.
    pub fn begin_retry(&mut self) -> Result<(), StateError> {
        if self.state != PipelineState::Assessing {
            return Err(StateError::InvalidTransition {
                from: self.state,
                to: PipelineState::RetryPrompting,
            });
        }
        if !self.budget.try_consume() {
            return Err(StateError::RetryBudgetExhausted);
        }
        self.transition(PipelineState::RetryPrompting)
    }

    /// Counts a render call; must be made while in a rendering state.
    pub fn record_render(&mut self) -> Result<u32, StateError> {
        if !self.state.is_rendering() {
            return Err(StateError::InvalidTransition {
                from: self.state,
                to: PipelineState::Rendering,
            });
        }
        if self.render_calls >= MAX_RENDER_CALLS {
            return Err(StateError::RenderLimit(MAX_RENDER_CALLS));
        }
        self.render_calls += 1;
        Ok(self.render_calls)
    }
}
