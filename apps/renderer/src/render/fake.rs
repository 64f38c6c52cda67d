//! In-process `RenderEngine` for tests: scripted delays, injected faults and
//! counters for launches and page disposals.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{sleep, Instant};

use crate::render::engine::{EnginePage, NetworkSnapshot, RenderEngine, SessionOptions};
use crate::render::error::RenderError;
use crate::render::layout::LayoutSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultPhase {
    Launch,
    Load,
    Readiness,
    Export,
}

/// How the fake behaves. All delays run on tokio's clock, so paused-time tests
/// advance through them instantly.
#[derive(Debug, Clone, Default)]
pub struct FakeScript {
    pub launch_delay: Duration,
    pub load_delay: Duration,
    pub export_delay: Duration,
    pub fail_at: Option<FaultPhase>,
    /// Resource count keeps changing until this long after load.
    pub network_busy_for: Duration,
    /// One script request stays in flight until this long after load, with
    /// the resource count frozen meanwhile.
    pub request_pending_for: Duration,
    /// `None` means the selector never appears.
    pub selector_after: Option<Duration>,
}

#[derive(Default)]
struct Counters {
    launches: AtomicUsize,
    disposals: AtomicUsize,
    loaded_html: Mutex<Vec<String>>,
    last_layout: Mutex<Option<LayoutSpec>>,
}

#[derive(Clone)]
pub struct FakeEngine {
    script: FakeScript,
    counters: Arc<Counters>,
}

impl FakeEngine {
    pub fn new(script: FakeScript) -> Self {
        Self {
            script,
            counters: Arc::default(),
        }
    }

    pub fn launches(&self) -> usize {
        self.counters.launches.load(Ordering::SeqCst)
    }

    /// Pages torn down, whether through `close` or by being dropped.
    pub fn disposals(&self) -> usize {
        self.counters.disposals.load(Ordering::SeqCst)
    }

    pub fn loaded_html(&self) -> Vec<String> {
        self.counters.loaded_html.lock().unwrap().clone()
    }

    pub fn last_layout(&self) -> Option<LayoutSpec> {
        self.counters.last_layout.lock().unwrap().clone()
    }

    fn fails_at(&self, phase: FaultPhase) -> bool {
        self.script.fail_at == Some(phase)
    }
}

#[async_trait]
impl RenderEngine for FakeEngine {
    async fn launch(&self, _options: &SessionOptions) -> Result<Box<dyn EnginePage>, RenderError> {
        self.counters.launches.fetch_add(1, Ordering::SeqCst);
        sleep(self.script.launch_delay).await;
        if self.fails_at(FaultPhase::Launch) {
            return Err(RenderError::SessionLaunch("injected launch failure".to_string()));
        }
        Ok(Box::new(FakePage {
            engine: self.clone(),
            loaded_at: None,
            html: String::new(),
            closed: false,
        }))
    }
}

struct FakePage {
    engine: FakeEngine,
    loaded_at: Option<Instant>,
    html: String,
    closed: bool,
}

impl FakePage {
    fn since_load(&self) -> Duration {
        self.loaded_at.map(|t| t.elapsed()).unwrap_or_default()
    }

    fn dispose(&mut self) {
        if !self.closed {
            self.closed = true;
            self.engine.counters.disposals.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl EnginePage for FakePage {
    async fn load(&mut self, html: &str, _timeout: Duration) -> Result<(), RenderError> {
        sleep(self.engine.script.load_delay).await;
        if self.engine.fails_at(FaultPhase::Load) {
            return Err(RenderError::Unknown("injected load failure".to_string()));
        }
        self.html = html.to_string();
        self.loaded_at = Some(Instant::now());
        self.engine
            .counters
            .loaded_html
            .lock()
            .unwrap()
            .push(html.to_string());
        Ok(())
    }

    async fn network_snapshot(&self) -> Result<NetworkSnapshot, RenderError> {
        if self.engine.fails_at(FaultPhase::Readiness) {
            return Err(RenderError::Unknown("injected page crash".to_string()));
        }
        let since = self.since_load();
        let busy_for = self.engine.script.network_busy_for;
        let finished_resources = if since < busy_for {
            since.as_millis() as u64 / 50 + 1
        } else {
            busy_for.as_millis() as u64 / 50 + 1
        };
        let pending_requests = u64::from(since < self.engine.script.request_pending_for);
        Ok(NetworkSnapshot {
            document_complete: self.loaded_at.is_some(),
            finished_resources: finished_resources + 1 - pending_requests,
            pending_requests,
        })
    }

    async fn selector_present(&self, _selector: &str) -> Result<bool, RenderError> {
        Ok(self
            .engine
            .script
            .selector_after
            .is_some_and(|after| self.since_load() >= after))
    }

    async fn print_pdf(&self, layout: &LayoutSpec) -> Result<Vec<u8>, RenderError> {
        sleep(self.engine.script.export_delay).await;
        if self.engine.fails_at(FaultPhase::Export) {
            return Err(RenderError::Unknown("injected export failure".to_string()));
        }
        *self.engine.counters.last_layout.lock().unwrap() = Some(layout.clone());
        Ok(format!("%PDF-1.7\n%fake\n{} bytes of html\n%%EOF\n", self.html.len()).into_bytes())
    }

    async fn close(&mut self) {
        self.dispose();
    }
}

impl Drop for FakePage {
    fn drop(&mut self) {
        self.dispose();
    }
}
