use std::time::Duration;

use thiserror::Error;

use crate::render::pipeline::RenderPhase;
use crate::templates::{CompileError, StoreError};

/// Every way a single render can fail. One request produces at most one of these.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("template not found: {0}")]
    TemplateNotFound(String),

    #[error("template store error: {0}")]
    TemplateStore(String),

    #[error("template compile error: {0}")]
    TemplateCompile(String),

    #[error("browser session failed to launch: {0}")]
    SessionLaunch(String),

    #[error("content did not load within {}ms", .0.as_millis())]
    ContentLoadTimeout(Duration),

    #[error("PDF export did not finish within {}ms", .0.as_millis())]
    ExportTimeout(Duration),

    #[error("render exceeded the overall limit of {}ms", .0.as_millis())]
    OverallTimeout(Duration),

    #[error("render failed: {0}")]
    Unknown(String),
}

impl RenderError {
    /// Stable machine-readable code, used in logs and the JSON error body.
    pub fn code(&self) -> &'static str {
        match self {
            RenderError::TemplateNotFound(_) => "TEMPLATE_NOT_FOUND",
            RenderError::TemplateStore(_) => "TEMPLATE_STORE_ERROR",
            RenderError::TemplateCompile(_) => "TEMPLATE_COMPILE_ERROR",
            RenderError::SessionLaunch(_) => "SESSION_LAUNCH_ERROR",
            RenderError::ContentLoadTimeout(_) => "CONTENT_LOAD_TIMEOUT",
            RenderError::ExportTimeout(_) => "EXPORT_TIMEOUT",
            RenderError::OverallTimeout(_) => "OVERALL_TIMEOUT",
            RenderError::Unknown(_) => "UNKNOWN_FAILURE",
        }
    }

    /// Phase-level timeouts, which turn into `OverallTimeout` when the request
    /// ceiling rather than the phase limit was the binding budget.
    pub fn is_phase_timeout(&self) -> bool {
        matches!(
            self,
            RenderError::ContentLoadTimeout(_) | RenderError::ExportTimeout(_)
        )
    }
}

impl From<StoreError> for RenderError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(name) => RenderError::TemplateNotFound(name),
            other => RenderError::TemplateStore(other.to_string()),
        }
    }
}

impl From<CompileError> for RenderError {
    fn from(e: CompileError) -> Self {
        RenderError::TemplateCompile(e.to_string())
    }
}

/// A failed render together with where and when it failed.
#[derive(Debug, Error)]
#[error("{error} (template '{template}', after phase {phase}, {}ms elapsed)", .elapsed.as_millis())]
pub struct RenderFailure {
    pub error: RenderError,
    pub template: String,
    pub phase: RenderPhase,
    pub elapsed: Duration,
}
