//! Application state shared across handlers.

use std::sync::Arc;

use crate::orchestrator::Orchestrator;
use crate::pool::SessionPool;
use crate::prompt::PromptBuilder;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Request-level state machine over the session pool.
    pub orchestrator: Arc<Orchestrator>,
    /// The pool itself, for the health endpoints.
    pub pool: SessionPool,
    /// Alert-to-prompt assembly.
    pub prompt_builder: Arc<PromptBuilder>,
}

impl AppState {
    pub fn new(
        orchestrator: Orchestrator,
        pool: SessionPool,
        prompt_builder: PromptBuilder,
    ) -> Self {
        Self {
            orchestrator: Arc::new(orchestrator),
            pool,
            prompt_builder: Arc::new(prompt_builder),
        }
    }
}
