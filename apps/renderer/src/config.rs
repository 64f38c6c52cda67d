use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};

use crate::render::{
    LayoutSpec, Margins, PaperFormat, PhaseTimeouts, ReadinessPolicy, SessionOptions,
};

/// Where templates are fetched from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateStoreKind {
    S3,
    Fs,
}

impl FromStr for TemplateStoreKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "s3" => Ok(TemplateStoreKind::S3),
            "fs" => Ok(TemplateStoreKind::Fs),
            other => Err(format!("expected 's3' or 'fs', got '{other}'")),
        }
    }
}

/// Application configuration loaded from environment variables.
/// Every value has a default; a value that is set but invalid fails startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub rust_log: String,
    pub template_store: TemplateStoreKind,
    pub template_bucket: String,
    pub s3_endpoint: Option<String>,
    pub aws_region: String,
    pub template_dir: PathBuf,
    pub session: SessionOptions,
    pub layout: LayoutSpec,
    pub readiness: ReadinessPolicy,
    pub timeouts: PhaseTimeouts,
    pub max_body_bytes: usize,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // load .env if present; ignore if missing
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key → value source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let vars = Vars(lookup);

        let timeouts = PhaseTimeouts {
            fetch: vars.millis("FETCH_TIMEOUT_MS", 10_000)?,
            launch: vars.millis("LAUNCH_TIMEOUT_MS", 30_000)?,
            load: vars.millis("LOAD_TIMEOUT_MS", 30_000)?,
            export: vars.millis("EXPORT_TIMEOUT_MS", 60_000)?,
            overall: vars.millis("OVERALL_TIMEOUT_MS", 300_000)?,
        };
        if timeouts.overall.is_zero() {
            bail!("OVERALL_TIMEOUT_MS must be greater than zero");
        }

        let readiness = ReadinessPolicy {
            quiet_window: vars.millis("NETWORK_IDLE_WINDOW_MS", 500)?,
            idle_timeout: vars.millis("NETWORK_IDLE_TIMEOUT_MS", 10_000)?,
            poll_interval: vars.millis("READINESS_POLL_MS", 100)?,
            grace_delay: vars.millis("GRACE_DELAY_MS", 250)?,
            selector: vars.optional("READY_SELECTOR"),
            selector_timeout: vars.millis("SELECTOR_TIMEOUT_MS", 5_000)?,
        };
        if readiness.poll_interval.is_zero() {
            bail!("READINESS_POLL_MS must be greater than zero");
        }

        let layout = LayoutSpec {
            format: vars.parse("PDF_FORMAT", PaperFormat::A4)?,
            landscape: vars.flag("PDF_LANDSCAPE", false)?,
            print_background: vars.flag("PDF_PRINT_BACKGROUND", true)?,
            margins: Margins::parse(
                &vars.string("PDF_MARGIN_TOP", "1cm"),
                &vars.string("PDF_MARGIN_BOTTOM", "1cm"),
                &vars.string("PDF_MARGIN_LEFT", "1cm"),
                &vars.string("PDF_MARGIN_RIGHT", "1cm"),
            )
            .context("PDF_MARGIN_* must be CSS lengths such as 1cm, 80px or 0.5in")?,
            header_template: vars.optional("PDF_HEADER_TEMPLATE"),
            footer_template: vars.optional("PDF_FOOTER_TEMPLATE"),
        };

        let session = SessionOptions {
            sandbox: vars.flag("BROWSER_SANDBOX", true)?,
            disable_dev_shm: vars.flag("BROWSER_DISABLE_DEV_SHM", false)?,
            chrome_path: vars.optional("CHROME_PATH").map(PathBuf::from),
            // The engine must not drop its connection in the middle of a render.
            idle_timeout: timeouts.overall,
            ..SessionOptions::default()
        };

        Ok(Config {
            port: vars.parse("PORT", 8080)?,
            rust_log: vars.string("RUST_LOG", "info"),
            template_store: vars.parse("TEMPLATE_STORE", TemplateStoreKind::S3)?,
            template_bucket: vars.string("TEMPLATE_BUCKET", "pdf-pw-templates"),
            s3_endpoint: vars.optional("S3_ENDPOINT"),
            aws_region: vars.string("AWS_REGION", "us-east-1"),
            template_dir: PathBuf::from(vars.string("TEMPLATE_DIR", "./templates")),
            session,
            layout,
            readiness,
            timeouts,
            max_body_bytes: vars.parse("MAX_BODY_BYTES", 50 * 1024 * 1024)?,
        })
    }
}

struct Vars<F>(F);

impl<F: Fn(&str) -> Option<String>> Vars<F> {
    /// Set and non-blank, trimmed.
    fn optional(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.optional(key).unwrap_or_else(|| default.to_string())
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: Display,
    {
        match self.optional(key) {
            Some(raw) => raw
                .parse::<T>()
                .map_err(|e| anyhow!("{key} has invalid value '{raw}': {e}")),
            None => Ok(default),
        }
    }

    fn millis(&self, key: &str, default_ms: u64) -> Result<Duration> {
        self.parse(key, default_ms)
            .map(Duration::from_millis)
            .with_context(|| format!("{key} must be a whole number of milliseconds"))
    }

    fn flag(&self, key: &str, default: bool) -> Result<bool> {
        match self.optional(key).map(|v| v.to_ascii_lowercase()) {
            None => Ok(default),
            Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => Ok(true),
            Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => Ok(false),
            Some(v) => bail!("{key} must be true or false, got '{v}'"),
        }
    }
}
