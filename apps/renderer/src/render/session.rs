//! Render session lifecycle: open, load content, release.
//!
//! A `RenderSession` owns exactly one engine page. `SessionManager::release`
//! takes the page out of the session, so a second release finds nothing and is
//! a no-op. If the owning task is cancelled before release, the session's
//! `Drop` disposes the page instead; either way disposal happens once.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::render::engine::{EnginePage, RenderEngine, SessionOptions};
use crate::render::error::RenderError;

/// Upper bound on how long teardown may block the request before it moves on.
const RELEASE_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Loaded,
    Released,
}

pub struct RenderSession {
    id: Uuid,
    created_at: DateTime<Utc>,
    started: Instant,
    state: SessionState,
    page: Option<Box<dyn EnginePage>>,
}

impl RenderSession {
    fn new(page: Box<dyn EnginePage>) -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            started: Instant::now(),
            state: SessionState::Open,
            page: Some(page),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn age(&self) -> Duration {
        self.started.elapsed()
    }

    /// The live page, or an error once the session has been released.
    pub fn page(&self) -> Result<&dyn EnginePage, RenderError> {
        self.page
            .as_deref()
            .ok_or_else(|| RenderError::Unknown(format!("session {} already released", self.id)))
    }
}

impl Drop for RenderSession {
    fn drop(&mut self) {
        if let Some(page) = self.page.take() {
            warn!(
                session = %self.id,
                age_ms = self.started.elapsed().as_millis() as u64,
                "render session dropped before release; disposing page"
            );
            drop(page);
        }
    }
}

/// Opens and releases sessions against one engine with fixed launch options.
#[derive(Clone)]
pub struct SessionManager {
    engine: Arc<dyn RenderEngine>,
    options: SessionOptions,
}

impl SessionManager {
    pub fn new(engine: Arc<dyn RenderEngine>, options: SessionOptions) -> Self {
        if !options.sandbox {
            warn!("browser sandbox disabled by configuration; rendered templates must be trusted");
        }
        Self { engine, options }
    }

    pub async fn open(&self) -> Result<RenderSession, RenderError> {
        let page = self.engine.launch(&self.options).await?;
        let session = RenderSession::new(page);
        info!(
            session = %session.id,
            created_at = %session.created_at.to_rfc3339(),
            sandbox = self.options.sandbox,
            "render session opened"
        );
        Ok(session)
    }

    /// Loads the compiled document, failing with `ContentLoadTimeout` when the
    /// DOM is not parsed within `load_timeout`.
    pub async fn load_content(
        &self,
        session: &mut RenderSession,
        html: &str,
        load_timeout: Duration,
    ) -> Result<(), RenderError> {
        let id = session.id;
        let page = session
            .page
            .as_mut()
            .ok_or_else(|| RenderError::Unknown(format!("session {id} already released")))?;

        let outcome = timeout(load_timeout, page.load(html, load_timeout)).await;
        match outcome {
            Ok(Ok(())) => {
                session.state = SessionState::Loaded;
                debug!(session = %id, html_bytes = html.len(), "content loaded");
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(RenderError::ContentLoadTimeout(load_timeout)),
        }
    }

    /// Disposes the session's page. Idempotent and infallible.
    pub async fn release(&self, session: &mut RenderSession) {
        let Some(mut page) = session.page.take() else {
            return;
        };
        session.state = SessionState::Released;

        if timeout(RELEASE_GRACE, page.close()).await.is_err() {
            warn!(
                session = %session.id,
                "session teardown exceeded {}ms; abandoning page",
                RELEASE_GRACE.as_millis()
            );
        }
        debug!(
            session = %session.id,
            age_ms = session.age().as_millis() as u64,
            "render session released"
        );
    }
}
