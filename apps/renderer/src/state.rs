use std::sync::Arc;

use crate::render::RenderPipeline;

/// Shared application state injected into all route handlers via Axum extractors.
#[derive(Clone)]
pub struct AppState {
    /// Stateless between requests; every render opens its own browser session.
    pub pipeline: Arc<RenderPipeline>,
}
