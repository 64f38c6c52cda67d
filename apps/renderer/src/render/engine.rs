//! The seam between the render pipeline and the browser engine.
//!
//! `RenderEngine` launches one isolated page per request; `EnginePage` is the
//! handful of operations the pipeline drives on it. Production uses headless
//! Chromium (`render::chrome`); tests use an in-process fake.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::render::error::RenderError;
use crate::render::layout::LayoutSpec;

/// Launch-time options shared by every session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Keep the browser sandbox on. Turning it off is an explicit trust
    /// decision made in deployment config.
    pub sandbox: bool,
    /// Pass `--disable-dev-shm-usage` (small /dev/shm in containers).
    pub disable_dev_shm: bool,
    pub chrome_path: Option<PathBuf>,
    pub window_size: (u32, u32),
    /// The engine drops its connection after this much silence.
    pub idle_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            sandbox: true,
            disable_dev_shm: false,
            chrome_path: None,
            window_size: (1280, 1024),
            idle_timeout: Duration::from_secs(300),
        }
    }
}

/// One observation of page-level network activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSnapshot {
    /// `document.readyState === "complete"`.
    pub document_complete: bool,
    /// Number of resource fetches the page has finished so far.
    pub finished_resources: u64,
    /// `fetch`/XHR requests started by page scripts and not yet settled.
    pub pending_requests: u64,
}

impl NetworkSnapshot {
    /// Document complete with nothing in flight.
    pub fn is_settled(&self) -> bool {
        self.document_complete && self.pending_requests == 0
    }
}

#[async_trait]
pub trait RenderEngine: Send + Sync {
    /// Starts a fresh, private page. Nothing is shared with other sessions.
    async fn launch(&self, options: &SessionOptions) -> Result<Box<dyn EnginePage>, RenderError>;
}

#[async_trait]
pub trait EnginePage: Send + Sync {
    /// Loads `html` and returns once the DOM is parsed. `timeout` is a hint for
    /// the engine's own waits; callers enforce it independently.
    async fn load(&mut self, html: &str, timeout: Duration) -> Result<(), RenderError>;

    async fn network_snapshot(&self) -> Result<NetworkSnapshot, RenderError>;

    async fn selector_present(&self, selector: &str) -> Result<bool, RenderError>;

    async fn print_pdf(&self, layout: &LayoutSpec) -> Result<Vec<u8>, RenderError>;

    /// Tears the page and its engine process down. Never fails; errors are
    /// logged. Dropping an unclosed page must also tear it down.
    async fn close(&mut self);
}
