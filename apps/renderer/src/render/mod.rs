// Render pipeline: headless-session lifecycle, readiness detection, PDF export,
// and the orchestrator that composes them per request.
// Blocking browser calls run on tokio's blocking pool (see chrome.rs).

pub mod chrome;
pub mod engine;
pub mod error;
pub mod export;
#[cfg(test)]
pub mod fake;
pub mod layout;
pub mod pipeline;
pub mod readiness;
pub mod session;

// Re-export the public API consumed by routes and startup.
pub use chrome::ChromeEngine;
pub use engine::SessionOptions;
pub use error::{RenderError, RenderFailure};
pub use layout::{LayoutOverrides, LayoutSpec, Margins, PaperFormat};
pub use pipeline::{PhaseTimeouts, RenderPipeline, RenderRequest};
pub use readiness::{ReadinessPolicy, ReadinessWaiter};
pub use session::SessionManager;
