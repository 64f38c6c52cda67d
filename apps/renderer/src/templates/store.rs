//! Template Store — key-addressed source of raw template text.
//!
//! `AppState` carries an `Arc<dyn TemplateStore>` chosen at startup:
//! an S3-compatible bucket in production, a local directory in development.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use aws_sdk_s3::Client as S3Client;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("template not found: {0}")]
    NotFound(String),

    #[error("invalid template name: '{0}'")]
    InvalidName(String),

    #[error("template '{0}' is not valid UTF-8")]
    NotUtf8(String),

    #[error("template store backend error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait TemplateStore: Send + Sync {
    /// Fetches the raw source of `name`, or `StoreError::NotFound`.
    async fn fetch(&self, name: &str) -> Result<String, StoreError>;
}

// ────────────────────────────────────────────────────────────────────────────
// S3-compatible bucket
// ────────────────────────────────────────────────────────────────────────────

pub struct S3TemplateStore {
    client: S3Client,
    bucket: String,
}

impl S3TemplateStore {
    pub fn new(client: S3Client, bucket: String) -> Self {
        Self { client, bucket }
    }
}

#[async_trait]
impl TemplateStore for S3TemplateStore {
    async fn fetch(&self, name: &str) -> Result<String, StoreError> {
        if name.trim().is_empty() {
            return Err(StoreError::InvalidName(name.to_string()));
        }

        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(name)
            .send()
            .await
            .map_err(|e| {
                let err = e.into_service_error();
                if err.is_no_such_key() {
                    StoreError::NotFound(name.to_string())
                } else {
                    StoreError::Backend(format!("S3 GetObject failed: {err}"))
                }
            })?;

        let body = response
            .body
            .collect()
            .await
            .map_err(|e| StoreError::Backend(format!("S3 body read failed: {e}")))?
            .into_bytes();

        debug!(
            "Fetched template s3://{}/{} ({} bytes)",
            self.bucket,
            name,
            body.len()
        );
        String::from_utf8(body.to_vec()).map_err(|_| StoreError::NotUtf8(name.to_string()))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Local directory
// ────────────────────────────────────────────────────────────────────────────

pub struct FsTemplateStore {
    root: PathBuf,
}

impl FsTemplateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolves `name` under the root. Only plain relative paths are accepted,
    /// so a name can never reach outside the template directory.
    fn resolve(&self, name: &str) -> Result<PathBuf, StoreError> {
        let relative = Path::new(name);
        let plain = !name.trim().is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !plain {
            return Err(StoreError::InvalidName(name.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl TemplateStore for FsTemplateStore {
    async fn fetch(&self, name: &str) -> Result<String, StoreError> {
        let path = self.resolve(name)?;
        let bytes = tokio::fs::read(&path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => StoreError::NotFound(name.to_string()),
            _ => StoreError::Backend(format!("reading {}: {e}", path.display())),
        })?;
        debug!("Read template {} ({} bytes)", path.display(), bytes.len());
        String::from_utf8(bytes).map_err(|_| StoreError::NotUtf8(name.to_string()))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// In-memory (tests)
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
#[derive(Default)]
pub struct InMemoryTemplateStore {
    templates: std::collections::HashMap<String, String>,
    delay: std::time::Duration,
}

#[cfg(test)]
impl InMemoryTemplateStore {
    pub fn with_template(mut self, name: &str, source: &str) -> Self {
        self.templates.insert(name.to_string(), source.to_string());
        self
    }

    /// Every fetch waits this long first (on tokio's clock).
    pub fn with_delay(mut self, delay: std::time::Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[cfg(test)]
#[async_trait]
impl TemplateStore for InMemoryTemplateStore {
    async fn fetch(&self, name: &str) -> Result<String, StoreError> {
        tokio::time::sleep(self.delay).await;
        self.templates
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }
}
