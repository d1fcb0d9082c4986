use std::sync::Arc;

use crate::routes::auth::TokenVerifier;
use crate::services::orchestrator::Orchestrator;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub auth: Arc<TokenVerifier>,
    pub engine_name: Arc<str>,
}

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>, auth: TokenVerifier, engine_name: &str) -> Self {
        Self {
            orchestrator,
            auth: Arc::new(auth),
            engine_name: Arc::from(engine_name),
        }
    }
}
