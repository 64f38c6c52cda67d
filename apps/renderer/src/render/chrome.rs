//! Headless Chromium engine, driven over the DevTools protocol.
//!
//! `headless_chrome` is a blocking client, so every call runs on tokio's
//! blocking pool. Each session is its own browser process; dropping the
//! `Browser` kills that process, which is what `close` and the drop path rely on.
//!
//! The compiled HTML is written to a private temp file and navigated to via
//! `file://`, so relative asset loads and the load event behave as for a
//! normal page. The file is removed when the session goes away.
//!
//! Before it is written, the document gets a small script as the first thing
//! in `<head>` that counts `fetch` and XHR requests still in flight. The
//! resource-timing entries only show finished loads, so without it a chart
//! waiting on a slow request would look idle.

use std::ffi::OsStr;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use headless_chrome::types::PrintToPdfOptions;
use headless_chrome::{Browser, LaunchOptions, Tab};
use serde_json::Value;
use tempfile::NamedTempFile;
use tokio::runtime::Handle;
use tokio::task;
use tokio::time::Instant;
use tracing::debug;

use crate::render::engine::{EnginePage, NetworkSnapshot, RenderEngine, SessionOptions};
use crate::render::error::RenderError;
use crate::render::layout::LayoutSpec;

const NETWORK_SNAPSHOT_JS: &str = "JSON.stringify({ \
    documentComplete: document.readyState === 'complete', \
    finishedResources: performance.getEntriesByType('resource').length, \
    pendingRequests: window.__renderNet ? window.__renderNet.pending : 0 \
})";

const REQUEST_TRACKER: &str = r#"<script>(function () {
  if (window.__renderNet) return;
  var net = window.__renderNet = { pending: 0 };
  var done = function () { net.pending = Math.max(0, net.pending - 1); };
  try { performance.setResourceTimingBufferSize(100000); } catch (e) {}
  if (window.fetch) {
    var fetch = window.fetch;
    window.fetch = function () {
      net.pending++;
      return fetch.apply(this, arguments).then(
        function (r) { done(); return r; },
        function (e) { done(); throw e; });
    };
  }
  var send = XMLHttpRequest.prototype.send;
  XMLHttpRequest.prototype.send = function () {
    net.pending++;
    this.addEventListener('loadend', done, { once: true });
    try { return send.apply(this, arguments); } catch (e) { done(); throw e; }
  };
})();</script>"#;

#[derive(Debug, Clone, Default)]
pub struct ChromeEngine;

#[async_trait]
impl RenderEngine for ChromeEngine {
    async fn launch(&self, options: &SessionOptions) -> Result<Box<dyn EnginePage>, RenderError> {
        let options = options.clone();
        let (browser, tab) = task::spawn_blocking(move || start_browser(&options))
            .await
            .map_err(|e| RenderError::SessionLaunch(format!("launch task failed: {e}")))?
            .map_err(|e| RenderError::SessionLaunch(format!("{e:#}")))?;

        Ok(Box::new(ChromePage {
            browser: Some(browser),
            tab,
            document: None,
        }))
    }
}

fn start_browser(options: &SessionOptions) -> anyhow::Result<(Browser, Arc<Tab>)> {
    let mut args: Vec<&OsStr> = Vec::new();
    if options.disable_dev_shm {
        args.push(OsStr::new("--disable-dev-shm-usage"));
    }
    if !options.sandbox {
        args.push(OsStr::new("--disable-setuid-sandbox"));
    }

    let launch = LaunchOptions::default_builder()
        .headless(true)
        .sandbox(options.sandbox)
        .path(options.chrome_path.clone())
        .window_size(Some(options.window_size))
        .idle_browser_timeout(options.idle_timeout)
        .args(args)
        .build()
        .map_err(|e| anyhow!("invalid launch options: {e}"))?;

    let browser = Browser::new(launch)?;
    let tab = browser.new_tab()?;
    Ok((browser, tab))
}

struct ChromePage {
    browser: Option<Browser>,
    tab: Arc<Tab>,
    document: Option<NamedTempFile>,
}

impl ChromePage {
    async fn blocking<T, F>(&self, what: &'static str, call: F) -> Result<T, RenderError>
    where
        T: Send + 'static,
        F: FnOnce(&Tab) -> anyhow::Result<T> + Send + 'static,
    {
        let tab = Arc::clone(&self.tab);
        task::spawn_blocking(move || call(&tab))
            .await
            .map_err(|e| RenderError::Unknown(format!("{what} task failed: {e}")))?
            .map_err(|e| RenderError::Unknown(format!("{what}: {e:#}")))
    }

    async fn evaluate(&self, expression: String) -> Result<Option<Value>, RenderError> {
        self.blocking("evaluate", move |tab| {
            Ok(tab.evaluate(&expression, false)?.value)
        })
        .await
    }
}

#[async_trait]
impl EnginePage for ChromePage {
    async fn load(&mut self, html: &str, timeout: Duration) -> Result<(), RenderError> {
        let mut file = tempfile::Builder::new()
            .prefix("render-")
            .suffix(".html")
            .tempfile()
            .map_err(|e| RenderError::Unknown(format!("creating document file: {e}")))?;
        file.write_all(with_request_tracker(html).as_bytes())
            .and_then(|_| file.flush())
            .map_err(|e| RenderError::Unknown(format!("writing document file: {e}")))?;

        let url = format!("file://{}", file.path().display());
        self.document = Some(file);

        let started = Instant::now();
        let result = self
            .blocking("load", move |tab| {
                tab.set_default_timeout(timeout);
                tab.navigate_to(&url)?.wait_until_navigated()?;
                Ok(())
            })
            .await;

        match result {
            Err(_) if started.elapsed() >= timeout => Err(RenderError::ContentLoadTimeout(timeout)),
            other => other,
        }
    }

    async fn network_snapshot(&self) -> Result<NetworkSnapshot, RenderError> {
        let value = self.evaluate(NETWORK_SNAPSHOT_JS.to_string()).await?;
        let text = value
            .as_ref()
            .and_then(Value::as_str)
            .ok_or_else(|| RenderError::Unknown("network snapshot returned no value".to_string()))?;
        serde_json::from_str(text)
            .map_err(|e| RenderError::Unknown(format!("network snapshot returned bad JSON: {e}")))
    }

    async fn selector_present(&self, selector: &str) -> Result<bool, RenderError> {
        let quoted = serde_json::to_string(selector)
            .map_err(|e| RenderError::Unknown(format!("selector encoding: {e}")))?;
        let value = self
            .evaluate(format!("document.querySelector({quoted}) !== null"))
            .await?;
        Ok(value.as_ref().and_then(Value::as_bool).unwrap_or(false))
    }

    async fn print_pdf(&self, layout: &LayoutSpec) -> Result<Vec<u8>, RenderError> {
        let options = pdf_options(layout);
        self.blocking("print_to_pdf", move |tab| tab.print_to_pdf(Some(options)))
            .await
    }

    async fn close(&mut self) {
        let browser = self.browser.take();
        let document = self.document.take();
        // Killing the browser process waits on the child; keep it off the async workers.
        let teardown = task::spawn_blocking(move || {
            drop(browser);
            drop(document);
        });
        if let Err(e) = teardown.await {
            debug!("browser teardown task failed: {e}");
        }
    }
}

impl Drop for ChromePage {
    /// Reached when a render is cancelled before `close`.
    fn drop(&mut self) {
        if self.browser.is_some() || self.document.is_some() {
            dispose_off_runtime((self.browser.take(), self.document.take()));
        }
    }
}

/// Drops `resource` on the blocking pool when called inside a tokio runtime,
/// inline otherwise.
fn dispose_off_runtime<T: Send + 'static>(resource: T) {
    match Handle::try_current() {
        Ok(handle) => {
            handle.spawn_blocking(move || drop(resource));
        }
        Err(_) => drop(resource),
    }
}

/// Puts `REQUEST_TRACKER` ahead of any page script: right after `<head>`,
/// else after `<html>`, else after the doctype, else at the very start.
fn with_request_tracker(html: &str) -> String {
    let at = open_tag_end(html, "<head")
        .or_else(|| open_tag_end(html, "<html"))
        .or_else(|| open_tag_end(html, "<!doctype"))
        .unwrap_or(0);
    let mut out = String::with_capacity(html.len() + REQUEST_TRACKER.len());
    out.push_str(&html[..at]);
    out.push_str(REQUEST_TRACKER);
    out.push_str(&html[at..]);
    out
}

/// Byte offset just past the first `<tag ...>`, matched case-insensitively.
fn open_tag_end(html: &str, tag: &str) -> Option<usize> {
    let lower = html.to_ascii_lowercase();
    let mut from = 0;
    while let Some(found) = lower[from..].find(tag) {
        let start = from + found;
        let after = start + tag.len();
        // `<header>` is not `<head>`.
        if lower[after..].starts_with(|c: char| c == '>' || c.is_ascii_whitespace()) {
            return lower[after..].find('>').map(|close| after + close + 1);
        }
        from = after;
    }
    None
}

fn pdf_options(layout: &LayoutSpec) -> PrintToPdfOptions {
    let (paper_width, paper_height) = layout.format.size_inches();
    let header_footer = layout.header_footer();
    let display_header_footer = header_footer.is_some();
    let (header_template, footer_template) = match header_footer {
        Some((header, footer)) => (Some(header), Some(footer)),
        None => (None, None),
    };

    PrintToPdfOptions {
        landscape: Some(layout.landscape),
        display_header_footer: Some(display_header_footer),
        print_background: Some(layout.print_background),
        paper_width: Some(paper_width),
        paper_height: Some(paper_height),
        margin_top: Some(layout.margins.top),
        margin_bottom: Some(layout.margins.bottom),
        margin_left: Some(layout.margins.left),
        margin_right: Some(layout.margins.right),
        header_template,
        footer_template,
        prefer_css_page_size: Some(false),
        ..Default::default()
    }
}
