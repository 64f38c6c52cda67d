//! Content readiness: decides when a loaded page is settled enough to export.
//!
//! Client-side charts have no completion signal, so readiness is a layered
//! heuristic rather than a guarantee:
//!
//! 1. network idle: `readyState` is `complete`, no script-issued request is in
//!    flight, and the finished-resource count has not moved for `quiet_window`,
//! 2. a fixed `grace_delay` for animation and layout to finish drawing,
//! 3. optionally, a selector that must exist before export.
//!
//! Steps 1 and 3 are bounded. Running out of time on either is not a failure:
//! the render proceeds with whatever is drawn, and the result is marked
//! `Degraded` with a warning so callers can tell the difference.
//! Longer windows buy fidelity at the cost of latency on every request.

use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use crate::render::engine::{EnginePage, NetworkSnapshot};
use crate::render::error::RenderError;
use crate::render::session::RenderSession;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadinessPolicy {
    pub quiet_window: Duration,
    pub idle_timeout: Duration,
    pub poll_interval: Duration,
    pub grace_delay: Duration,
    pub selector: Option<String>,
    pub selector_timeout: Duration,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            quiet_window: Duration::from_millis(500),
            idle_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(100),
            grace_delay: Duration::from_millis(250),
            selector: None,
            selector_timeout: Duration::from_secs(5),
        }
    }
}

impl ReadinessPolicy {
    /// Longest the waiter can take when every engine call answers promptly.
    pub fn max_wait(&self) -> Duration {
        let selector = if self.selector.is_some() {
            self.selector_timeout
        } else {
            Duration::ZERO
        };
        self.idle_timeout + self.poll_interval + self.grace_delay + selector
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DegradedReason {
    /// The network never went quiet within the idle timeout.
    NetworkBusy,
    /// The awaited selector never appeared.
    SelectorMissing(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Full,
    Degraded(Vec<DegradedReason>),
}

impl Readiness {
    /// Short label for the `X-Render-Readiness` response header.
    pub fn label(&self) -> &'static str {
        match self {
            Readiness::Full => "full",
            Readiness::Degraded(_) => "degraded",
        }
    }
}

/// Tracks successive snapshots and reports when nothing changed for `window`.
#[derive(Debug)]
pub struct QuietWindow {
    window: Duration,
    last: Option<NetworkSnapshot>,
    quiet_since: Option<Instant>,
}

impl QuietWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last: None,
            quiet_since: None,
        }
    }

    /// Records one observation; returns true once the page has been quiet long enough.
    pub fn observe(&mut self, snapshot: NetworkSnapshot, now: Instant) -> bool {
        if !snapshot.is_settled() {
            self.last = Some(snapshot);
            self.quiet_since = None;
            return false;
        }
        if self.last != Some(snapshot) || self.quiet_since.is_none() {
            self.last = Some(snapshot);
            self.quiet_since = Some(now);
        }
        self.quiet_since
            .is_some_and(|since| now.saturating_duration_since(since) >= self.window)
    }
}

#[derive(Debug, Clone)]
pub struct ReadinessWaiter {
    policy: ReadinessPolicy,
}

impl ReadinessWaiter {
    pub fn new(policy: ReadinessPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &ReadinessPolicy {
        &self.policy
    }

    /// Blocks until the session's page is ready by policy. Only engine errors
    /// fail; running out of wait time degrades.
    pub async fn await_ready(&self, session: &RenderSession) -> Result<Readiness, RenderError> {
        let page = session.page()?;
        let mut reasons = Vec::new();

        if self.wait_network_idle(page).await? {
            debug!(session = %session.id(), "network idle");
        } else {
            warn!(
                session = %session.id(),
                idle_timeout_ms = self.policy.idle_timeout.as_millis() as u64,
                "network never went idle; exporting best-effort content"
            );
            reasons.push(DegradedReason::NetworkBusy);
        }

        if !self.policy.grace_delay.is_zero() {
            sleep(self.policy.grace_delay).await;
        }

        if let Some(selector) = &self.policy.selector {
            if self.wait_selector(page, selector).await? {
                debug!(session = %session.id(), selector, "selector present");
            } else {
                warn!(
                    session = %session.id(),
                    selector,
                    selector_timeout_ms = self.policy.selector_timeout.as_millis() as u64,
                    "selector did not appear; exporting without it"
                );
                reasons.push(DegradedReason::SelectorMissing(selector.clone()));
            }
        }

        if reasons.is_empty() {
            Ok(Readiness::Full)
        } else {
            Ok(Readiness::Degraded(reasons))
        }
    }

    async fn wait_network_idle(&self, page: &dyn EnginePage) -> Result<bool, RenderError> {
        let deadline = Instant::now() + self.policy.idle_timeout;
        let mut quiet = QuietWindow::new(self.policy.quiet_window);

        loop {
            let snapshot = page.network_snapshot().await?;
            let now = Instant::now();
            if quiet.observe(snapshot, now) {
                return Ok(true);
            }
            if now >= deadline {
                return Ok(false);
            }
            sleep(self.policy.poll_interval.min(deadline - now)).await;
        }
    }

    async fn wait_selector(&self, page: &dyn EnginePage, selector: &str) -> Result<bool, RenderError> {
        let deadline = Instant::now() + self.policy.selector_timeout;

        loop {
            if page.selector_present(selector).await? {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            sleep(self.policy.poll_interval.min(deadline - now)).await;
        }
    }
}
