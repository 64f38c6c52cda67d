//! Render orchestration: one request in, one PDF or one typed failure out.
//!
//! ```text
//! Received → TemplateFetched → Compiled → SessionOpen → ContentLoaded → Ready → Exported → Done
//!     └──────────────┴─────────────┴───────────┴──────────────┴──────────┴───────→ Failed(kind)
//! ```
//!
//! Every phase runs under `min(phase limit, remaining overall budget)`. When the
//! overall budget is the tighter one and runs out, the failure is
//! `OverallTimeout`, even if no phase limit fired. Once a session exists it is
//! released before `render` returns, on success and on every failure. No
//! retries happen here.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde_json::Value;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, info_span, Instrument};
use uuid::Uuid;

use crate::render::error::{RenderError, RenderFailure};
use crate::render::export::DocumentExporter;
use crate::render::layout::{LayoutError, LayoutOverrides, LayoutSpec};
use crate::render::readiness::{Readiness, ReadinessWaiter};
use crate::render::session::{RenderSession, SessionManager};
use crate::templates::{TemplateCompiler, TemplateStore};

/// Margin on top of the readiness policy's own ceilings before the pipeline
/// assumes an engine call has hung.
const READINESS_SLACK: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderPhase {
    Received,
    TemplateFetched,
    Compiled,
    SessionOpen,
    ContentLoaded,
    Ready,
    Exported,
    Done,
}

impl fmt::Display for RenderPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Per-phase limits plus the request-wide ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseTimeouts {
    pub fetch: Duration,
    pub launch: Duration,
    pub load: Duration,
    pub export: Duration,
    pub overall: Duration,
}

impl Default for PhaseTimeouts {
    fn default() -> Self {
        Self {
            fetch: Duration::from_secs(10),
            launch: Duration::from_secs(30),
            load: Duration::from_secs(30),
            export: Duration::from_secs(60),
            overall: Duration::from_secs(300),
        }
    }
}

/// An accepted render request. Immutable for the length of the render.
#[derive(Debug, Clone)]
pub struct RenderRequest {
    pub template_name: String,
    pub data: Value,
    pub layout: LayoutSpec,
}

#[derive(Debug, Clone)]
pub struct RenderedDocument {
    pub pdf: Bytes,
    pub readiness: Readiness,
}

pub struct RenderPipeline {
    store: Arc<dyn TemplateStore>,
    compiler: TemplateCompiler,
    sessions: SessionManager,
    waiter: ReadinessWaiter,
    exporter: DocumentExporter,
    layout: LayoutSpec,
    timeouts: PhaseTimeouts,
}

impl RenderPipeline {
    pub fn new(
        store: Arc<dyn TemplateStore>,
        compiler: TemplateCompiler,
        sessions: SessionManager,
        waiter: ReadinessWaiter,
        layout: LayoutSpec,
        timeouts: PhaseTimeouts,
    ) -> Self {
        Self {
            store,
            compiler,
            sessions,
            waiter,
            exporter: DocumentExporter,
            layout,
            timeouts,
        }
    }

    /// The deployment layout with any request overrides applied.
    pub fn layout_for(&self, overrides: Option<&LayoutOverrides>) -> Result<LayoutSpec, LayoutError> {
        match overrides {
            Some(overrides) => self.layout.with_overrides(overrides),
            None => Ok(self.layout.clone()),
        }
    }

    pub async fn render(&self, request: &RenderRequest) -> Result<RenderedDocument, RenderFailure> {
        let span = info_span!(
            "render",
            template = %request.template_name,
            request_id = %Uuid::new_v4()
        );

        async {
            let mut clock = PhaseClock::start(self.timeouts.overall);
            match self.run(&mut clock, request).await {
                Ok(document) => {
                    info!(
                        pdf_bytes = document.pdf.len(),
                        readiness = document.readiness.label(),
                        elapsed_ms = clock.elapsed().as_millis() as u64,
                        "render complete"
                    );
                    Ok(document)
                }
                Err(error) => {
                    let failure = RenderFailure {
                        error,
                        template: request.template_name.clone(),
                        phase: clock.phase,
                        elapsed: clock.elapsed(),
                    };
                    error!(
                        kind = failure.error.code(),
                        phase = %failure.phase,
                        elapsed_ms = failure.elapsed.as_millis() as u64,
                        "render failed: {}",
                        failure.error
                    );
                    Err(failure)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn run(
        &self,
        clock: &mut PhaseClock,
        request: &RenderRequest,
    ) -> Result<RenderedDocument, RenderError> {
        let name = request.template_name.as_str();

        let budget = clock.budget(self.timeouts.fetch)?;
        let source = clock
            .bounded(
                budget,
                async { self.store.fetch(name).await.map_err(RenderError::from) },
                |limit| RenderError::TemplateStore(format!("fetch exceeded {}ms", limit.as_millis())),
            )
            .await?;
        clock.advance(RenderPhase::TemplateFetched);

        let html = self.compiler.compile(name, &source, &request.data)?;
        clock.check()?;
        clock.advance(RenderPhase::Compiled);

        let budget = clock.budget(self.timeouts.launch)?;
        let mut session = clock
            .bounded(budget, self.sessions.open(), |limit| {
                RenderError::SessionLaunch(format!("browser did not start within {}ms", limit.as_millis()))
            })
            .await?;
        clock.advance(RenderPhase::SessionOpen);

        let outcome = self.drive(clock, &mut session, &html, &request.layout).await;
        self.sessions.release(&mut session).await;

        let document = outcome?;
        clock.advance(RenderPhase::Done);
        Ok(document)
    }

    /// Everything that happens while a session is live. The caller releases
    /// the session whatever this returns.
    async fn drive(
        &self,
        clock: &mut PhaseClock,
        session: &mut RenderSession,
        html: &str,
        layout: &LayoutSpec,
    ) -> Result<RenderedDocument, RenderError> {
        let budget = clock.budget(self.timeouts.load)?;
        clock
            .bounded(
                budget,
                self.sessions.load_content(session, html, budget.time),
                RenderError::ContentLoadTimeout,
            )
            .await?;
        clock.advance(RenderPhase::ContentLoaded);

        let budget = clock.budget(self.waiter.policy().max_wait() + READINESS_SLACK)?;
        let readiness = clock
            .bounded(budget, self.waiter.await_ready(session), |limit| {
                RenderError::Unknown(format!("page stopped responding during readiness wait ({}ms)", limit.as_millis()))
            })
            .await?;
        clock.advance(RenderPhase::Ready);

        let budget = clock.budget(self.timeouts.export)?;
        let pdf = clock
            .bounded(
                budget,
                self.exporter.export(session, layout, budget.time),
                RenderError::ExportTimeout,
            )
            .await?;
        clock.advance(RenderPhase::Exported);

        Ok(RenderedDocument { pdf, readiness })
    }
}

/// Time granted to one phase.
#[derive(Debug, Clone, Copy)]
struct Budget {
    /// The phase's own limit.
    limit: Duration,
    /// `min(limit, remaining overall)`.
    time: Duration,
    /// The overall ceiling, not the phase limit, is what `time` ends at.
    overall_binding: bool,
}

/// Tracks the current phase and the request's overall budget.
struct PhaseClock {
    started: Instant,
    overall: Duration,
    phase: RenderPhase,
}

impl PhaseClock {
    fn start(overall: Duration) -> Self {
        Self {
            started: Instant::now(),
            overall,
            phase: RenderPhase::Received,
        }
    }

    fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    fn advance(&mut self, next: RenderPhase) {
        debug!(
            from = %self.phase,
            to = %next,
            elapsed_ms = self.elapsed().as_millis() as u64,
            "render phase complete"
        );
        self.phase = next;
    }

    /// Fails with `OverallTimeout` once the ceiling has been reached.
    fn check(&self) -> Result<(), RenderError> {
        if self.elapsed() >= self.overall {
            return Err(RenderError::OverallTimeout(self.overall));
        }
        Ok(())
    }

    fn budget(&self, limit: Duration) -> Result<Budget, RenderError> {
        self.check()?;
        let remaining = self.overall.saturating_sub(self.elapsed());
        Ok(Budget {
            limit,
            time: limit.min(remaining),
            overall_binding: remaining < limit,
        })
    }

    /// Runs one phase within its budget. Running out of an overall-bound
    /// budget is `OverallTimeout`, whichever timer noticed first; running out
    /// of the phase's own limit is `expired(limit)`.
    async fn bounded<T>(
        &self,
        budget: Budget,
        phase: impl Future<Output = Result<T, RenderError>>,
        expired: impl FnOnce(Duration) -> RenderError,
    ) -> Result<T, RenderError> {
        match timeout(budget.time, phase).await {
            Ok(Err(e)) if budget.overall_binding && e.is_phase_timeout() => {
                Err(RenderError::OverallTimeout(self.overall))
            }
            Ok(result) => result,
            Err(_) if budget.overall_binding => Err(RenderError::OverallTimeout(self.overall)),
            Err(_) => Err(expired(budget.limit)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::engine::SessionOptions;
    use crate::render::fake::{FakeEngine, FakeScript, FaultPhase};
    use crate::render::readiness::{DegradedReason, ReadinessPolicy};
    use crate::templates::store::InMemoryTemplateStore;
    use crate::templates::HelperRegistry;
    use serde_json::json;

    const INVOICE: &str = "<html><body><h1>Invoice for {{customerName}}</h1>\
        <table>{% for item in items %}<tr><td>{{ item.name }}</td></tr>{% endfor %}</table>\
        <script>const rows = {{ items_json }};</script></body></html>";

    fn store() -> InMemoryTemplateStore {
        InMemoryTemplateStore::default()
            .with_template("invoice.html", INVOICE)
            .with_template("broken.html", "<h1>{{ customerName </h1>")
    }

    fn pipeline_with(
        engine: &FakeEngine,
        policy: ReadinessPolicy,
        timeouts: PhaseTimeouts,
    ) -> RenderPipeline {
        RenderPipeline::new(
            Arc::new(store()),
            TemplateCompiler::new(Arc::new(HelperRegistry::standard())),
            SessionManager::new(Arc::new(engine.clone()), SessionOptions::default()),
            ReadinessWaiter::new(policy),
            LayoutSpec::default(),
            timeouts,
        )
    }

    fn pipeline(engine: &FakeEngine) -> RenderPipeline {
        pipeline_with(engine, ReadinessPolicy::default(), PhaseTimeouts::default())
    }

    fn request(template: &str, data: Value) -> RenderRequest {
        RenderRequest {
            template_name: template.to_string(),
            data,
            layout: LayoutSpec::default(),
        }
    }

    fn invoice(customer: &str) -> RenderRequest {
        request("invoice.html", json!({ "customerName": customer, "items": [] }))
    }

    // ── success paths ───────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn test_invoice_renders_customer_name_into_pdf() {
        let engine = FakeEngine::new(FakeScript::default());

        let document = pipeline(&engine)
            .render(&request("invoice.html", json!({ "customerName": "Acme Co" })))
            .await
            .unwrap();

        assert!(!document.pdf.is_empty());
        assert!(document.pdf.starts_with(b"%PDF-"));
        assert_eq!(document.readiness, Readiness::Full);
        let html = engine.loaded_html();
        assert_eq!(html.len(), 1);
        assert!(html[0].contains("Acme Co"));
        assert_eq!(engine.launches(), 1);
        assert_eq!(engine.disposals(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_script_in_data_is_escaped() {
        let engine = FakeEngine::new(FakeScript::default());

        pipeline(&engine)
            .render(&invoice("<script>alert(1)</script>"))
            .await
            .unwrap();

        let html = &engine.loaded_html()[0];
        assert!(!html.contains("<script>alert(1)"), "{html}");
        assert!(html.contains("&lt;script&gt;alert(1)"), "{html}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_items_render_zero_rows() {
        let engine = FakeEngine::new(FakeScript::default());

        let document = pipeline(&engine).render(&invoice("Acme Co")).await.unwrap();

        assert!(document.pdf.starts_with(b"%PDF-"));
        let html = &engine.loaded_html()[0];
        assert!(!html.contains("<tr>"));
        assert!(html.contains("const rows = [];"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_identical_requests_load_identical_html() {
        let engine = FakeEngine::new(FakeScript::default());
        let pipeline = pipeline(&engine);
        let request = request(
            "invoice.html",
            json!({ "customerName": "Acme Co", "items": [{ "name": "Widget" }, { "name": "Gadget" }] }),
        );

        pipeline.render(&request).await.unwrap();
        pipeline.render(&request).await.unwrap();

        let html = engine.loaded_html();
        assert_eq!(html.len(), 2);
        assert_eq!(html[0], html[1]);
        assert_eq!(engine.disposals(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_layout_reaches_exporter() {
        let engine = FakeEngine::new(FakeScript::default());
        let pipeline = pipeline(&engine);
        let layout = pipeline
            .layout_for(Some(&LayoutOverrides {
                format: Some("Letter".to_string()),
                footer_template: Some("<span class=\"pageNumber\"></span>".to_string()),
                ..Default::default()
            }))
            .unwrap();

        let mut req = invoice("Acme Co");
        req.layout = layout.clone();
        pipeline.render(&req).await.unwrap();

        assert_eq!(engine.last_layout(), Some(layout));
    }

    #[tokio::test(start_paused = true)]
    async fn test_selector_timeout_still_renders_but_is_degraded() {
        let engine = FakeEngine::new(FakeScript::default());
        let policy = ReadinessPolicy {
            selector: Some("#chart svg".to_string()),
            selector_timeout: Duration::from_secs(2),
            ..ReadinessPolicy::default()
        };

        let document = pipeline_with(&engine, policy, PhaseTimeouts::default())
            .render(&invoice("Acme Co"))
            .await
            .unwrap();

        assert!(document.pdf.starts_with(b"%PDF-"));
        assert_eq!(
            document.readiness,
            Readiness::Degraded(vec![DegradedReason::SelectorMissing("#chart svg".to_string())])
        );
        assert_eq!(engine.disposals(), 1);
    }

    // ── failure paths ───────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn test_missing_template_never_opens_a_session() {
        let engine = FakeEngine::new(FakeScript::default());

        let failure = pipeline(&engine)
            .render(&request("missing.html", json!({})))
            .await
            .unwrap_err();

        assert!(matches!(failure.error, RenderError::TemplateNotFound(ref n) if n == "missing.html"));
        assert_eq!(failure.phase, RenderPhase::Received);
        assert_eq!(engine.launches(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_template_fetch_fails_without_opening_a_session() {
        let engine = FakeEngine::new(FakeScript::default());
        let pipeline = RenderPipeline::new(
            Arc::new(store().with_delay(Duration::from_secs(30))),
            TemplateCompiler::new(Arc::new(HelperRegistry::standard())),
            SessionManager::new(Arc::new(engine.clone()), SessionOptions::default()),
            ReadinessWaiter::new(ReadinessPolicy::default()),
            LayoutSpec::default(),
            PhaseTimeouts {
                fetch: Duration::from_secs(2),
                ..PhaseTimeouts::default()
            },
        );

        let started = Instant::now();
        let failure = pipeline.render(&invoice("Acme Co")).await.unwrap_err();

        assert!(matches!(failure.error, RenderError::TemplateStore(ref m) if m.contains("2000ms")));
        assert_eq!(failure.error.code(), "TEMPLATE_STORE_ERROR");
        assert_eq!(failure.phase, RenderPhase::Received);
        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(engine.launches(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_compile_error_never_opens_a_session() {
        let engine = FakeEngine::new(FakeScript::default());

        let failure = pipeline(&engine)
            .render(&request("broken.html", json!({})))
            .await
            .unwrap_err();

        assert!(matches!(failure.error, RenderError::TemplateCompile(_)));
        assert_eq!(failure.phase, RenderPhase::TemplateFetched);
        assert_eq!(engine.launches(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fault_at_every_session_phase_releases_exactly_once() {
        let cases = [
            (FaultPhase::Launch, 0, RenderPhase::Compiled),
            (FaultPhase::Load, 1, RenderPhase::SessionOpen),
            (FaultPhase::Readiness, 1, RenderPhase::ContentLoaded),
            (FaultPhase::Export, 1, RenderPhase::Ready),
        ];

        for (fault, expected_disposals, failed_after) in cases {
            let engine = FakeEngine::new(FakeScript {
                fail_at: Some(fault),
                ..Default::default()
            });

            let failure = pipeline(&engine).render(&invoice("Acme Co")).await.unwrap_err();

            assert_eq!(failure.phase, failed_after, "fault at {fault:?}");
            assert_eq!(engine.launches(), 1, "fault at {fault:?}");
            assert_eq!(engine.disposals(), expected_disposals, "fault at {fault:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_load_fails_with_content_load_timeout_and_releases() {
        let engine = FakeEngine::new(FakeScript {
            load_delay: Duration::from_secs(120),
            ..Default::default()
        });
        let timeouts = PhaseTimeouts {
            load: Duration::from_secs(5),
            ..PhaseTimeouts::default()
        };

        let started = Instant::now();
        let failure = pipeline_with(&engine, ReadinessPolicy::default(), timeouts)
            .render(&invoice("Acme Co"))
            .await
            .unwrap_err();

        assert!(matches!(failure.error, RenderError::ContentLoadTimeout(d) if d == Duration::from_secs(5)));
        assert_eq!(failure.phase, RenderPhase::SessionOpen);
        assert_eq!(engine.disposals(), 1);
        assert!(started.elapsed() < Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_export_fails_with_export_timeout() {
        let engine = FakeEngine::new(FakeScript {
            export_delay: Duration::from_secs(120),
            ..Default::default()
        });

        let failure = pipeline(&engine).render(&invoice("Acme Co")).await.unwrap_err();

        assert!(matches!(failure.error, RenderError::ExportTimeout(_)));
        assert_eq!(engine.disposals(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fast_phases_exceeding_the_ceiling_fail_with_overall_timeout() {
        let engine = FakeEngine::new(FakeScript {
            launch_delay: Duration::from_millis(400),
            load_delay: Duration::from_millis(400),
            export_delay: Duration::from_millis(400),
            ..Default::default()
        });
        let policy = ReadinessPolicy {
            quiet_window: Duration::from_millis(100),
            grace_delay: Duration::ZERO,
            ..ReadinessPolicy::default()
        };
        let timeouts = PhaseTimeouts {
            fetch: Duration::from_secs(1),
            launch: Duration::from_secs(1),
            load: Duration::from_secs(1),
            export: Duration::from_secs(1),
            overall: Duration::from_millis(1_000),
        };

        let failure = pipeline_with(&engine, policy, timeouts)
            .render(&invoice("Acme Co"))
            .await
            .unwrap_err();

        assert!(matches!(failure.error, RenderError::OverallTimeout(d) if d == Duration::from_secs(1)));
        assert_eq!(failure.phase, RenderPhase::Ready);
        assert_eq!(engine.disposals(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_render_still_disposes_the_session() {
        let engine = FakeEngine::new(FakeScript {
            load_delay: Duration::from_secs(20),
            ..Default::default()
        });
        let pipeline = pipeline(&engine);
        let request = invoice("Acme Co");

        let cancelled = timeout(Duration::from_secs(1), pipeline.render(&request)).await;

        assert!(cancelled.is_err());
        assert_eq!(engine.launches(), 1);
        assert_eq!(engine.disposals(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pipeline_serves_requests_after_a_failure() {
        let engine = FakeEngine::new(FakeScript::default());
        let pipeline = pipeline(&engine);

        assert!(pipeline.render(&request("missing.html", json!({}))).await.is_err());
        assert!(pipeline.render(&invoice("Acme Co")).await.is_ok());
    }
}
