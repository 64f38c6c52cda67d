//! Template compilation: template source + JSON data → HTML.
//!
//! Templates use Jinja2 syntax. Every interpolation is HTML-escaped whatever
//! the template's name. Missing data is not an error: an absent field renders
//! empty, an absent list iterates zero times, and attribute lookups through a
//! missing value stay empty (`{{ customer.address.city }}`). Malformed source
//! and unknown filters or functions still fail.
//!
//! The raw paths are script-safe JSON for inline chart payloads:
//!
//! ```text
//! <script>const rows = {{ items | json }};</script>
//! <script>draw({{ items_json }});</script>
//! ```
//!
//! Helpers live in a `HelperRegistry` that is assembled once at startup and
//! only read afterwards.

use std::collections::BTreeMap;
use std::error::Error as _;
use std::sync::Arc;

use minijinja::{AutoEscape, Environment, ErrorKind, UndefinedBehavior, Value};
use thiserror::Error;

/// Variable holding `data.items` as script-safe JSON, for templates that feed
/// it straight to a chart script.
pub const ITEMS_JSON: &str = "items_json";

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("template '{name}' is malformed: {detail}")]
    Parse { name: String, detail: String },

    #[error("template '{name}' failed to render: {detail}")]
    Render { name: String, detail: String },

    #[error("data could not be prepared for rendering: {0}")]
    Data(#[from] serde_json::Error),
}

// ────────────────────────────────────────────────────────────────────────────
// Helper registry
// ────────────────────────────────────────────────────────────────────────────

/// Immutable set of template helpers, shared by reference.
pub struct HelperRegistry {
    env: Environment<'static>,
}

pub struct HelperRegistryBuilder {
    env: Environment<'static>,
}

impl HelperRegistry {
    pub fn builder() -> HelperRegistryBuilder {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Chainable);
        env.set_auto_escape_callback(|_name: &str| AutoEscape::Html);
        env.add_filter("json", script_json);
        HelperRegistryBuilder { env }
    }

    /// The registry used in production: the built-in `json` filter only.
    pub fn standard() -> Self {
        Self::builder().build()
    }
}

impl HelperRegistryBuilder {
    #[cfg_attr(not(test), allow(dead_code))]
    pub fn filter<F>(mut self, name: &'static str, filter: F) -> Self
    where
        F: Fn(Value) -> Result<Value, minijinja::Error> + Send + Sync + 'static,
    {
        self.env.add_filter(name, filter);
        self
    }

    pub fn build(self) -> HelperRegistry {
        HelperRegistry { env: self.env }
    }
}

/// `{{ value | json }}`: serializes to JSON and marks the output safe, with the
/// characters that could close a `<script>` element escaped as unicode.
fn script_json(value: Value) -> Result<Value, minijinja::Error> {
    let json = serde_json::to_string(&value)
        .map_err(|e| minijinja::Error::new(ErrorKind::InvalidOperation, e.to_string()))?;
    Ok(Value::from_safe_string(script_safe(&json)))
}

fn script_safe(json: &str) -> String {
    let mut out = String::with_capacity(json.len());
    for c in json.chars() {
        match c {
            '<' => out.push_str("\\u003c"),
            '>' => out.push_str("\\u003e"),
            '&' => out.push_str("\\u0026"),
            '\u{2028}' => out.push_str("\\u2028"),
            '\u{2029}' => out.push_str("\\u2029"),
            c => out.push(c),
        }
    }
    out
}

// ────────────────────────────────────────────────────────────────────────────
// Compiler
// ────────────────────────────────────────────────────────────────────────────

/// Pure template compiler. Same (source, data) in, same HTML out.
#[derive(Clone)]
pub struct TemplateCompiler {
    registry: Arc<HelperRegistry>,
}

impl TemplateCompiler {
    pub fn new(registry: Arc<HelperRegistry>) -> Self {
        Self { registry }
    }

    pub fn compile(
        &self,
        name: &str,
        source: &str,
        data: &serde_json::Value,
    ) -> Result<String, CompileError> {
        let context = build_context(data)?;

        self.registry
            .env
            .render_named_str(name, source, context)
            .map_err(|e| {
                let name = name.to_string();
                let detail = describe(&e);
                if is_template_fault(&e) {
                    CompileError::Parse { name, detail }
                } else {
                    CompileError::Render { name, detail }
                }
            })
    }
}

/// Faults in the template itself rather than in how it met the data.
fn is_template_fault(error: &minijinja::Error) -> bool {
    matches!(
        error.kind(),
        ErrorKind::SyntaxError
            | ErrorKind::UnknownFilter
            | ErrorKind::UnknownFunction
            | ErrorKind::UnknownTest
    )
}

/// Top-level keys of an object payload become template variables. The whole
/// payload is also reachable as `data` unless it defines that key itself, and
/// `items_json` always holds `data.items` (or `[]`) as script-safe JSON.
fn build_context(data: &serde_json::Value) -> Result<Value, CompileError> {
    let mut vars: BTreeMap<String, Value> = BTreeMap::new();

    if let serde_json::Value::Object(fields) = data {
        for (key, value) in fields {
            vars.insert(key.clone(), Value::from_serialize(value));
        }
    }
    vars.entry("data".to_string())
        .or_insert_with(|| Value::from_serialize(data));

    let empty = serde_json::Value::Array(Vec::new());
    let items = data.get("items").unwrap_or(&empty);
    let items_json = script_safe(&serde_json::to_string(items)?);
    vars.insert(ITEMS_JSON.to_string(), Value::from_safe_string(items_json));

    Ok(Value::from_iter(vars))
}

/// The error's own message plus any nested causes.
fn describe(error: &minijinja::Error) -> String {
    let mut parts = vec![error.to_string()];
    let mut source = error.source();
    while let Some(cause) = source {
        parts.push(cause.to_string());
        source = cause.source();
    }
    parts.join(": ")
}
