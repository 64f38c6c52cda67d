use std::time::Duration;

use bytes::Bytes;
use tokio::time::timeout;
use tracing::debug;

use crate::render::error::RenderError;
use crate::render::layout::LayoutSpec;
use crate::render::session::RenderSession;

const PDF_SIGNATURE: &[u8] = b"%PDF-";

/// Drives a ready page through PDF export.
#[derive(Debug, Clone, Default)]
pub struct DocumentExporter;

impl DocumentExporter {
    /// Exports the session's page with `layout`, failing with `ExportTimeout`
    /// when the engine takes longer than `export_timeout`.
    pub async fn export(
        &self,
        session: &RenderSession,
        layout: &LayoutSpec,
        export_timeout: Duration,
    ) -> Result<Bytes, RenderError> {
        let page = session.page()?;

        let pdf = timeout(export_timeout, page.print_pdf(layout))
            .await
            .map_err(|_| RenderError::ExportTimeout(export_timeout))??;

        if !pdf.starts_with(PDF_SIGNATURE) {
            return Err(RenderError::Unknown(format!(
                "engine returned {} bytes without a PDF signature",
                pdf.len()
            )));
        }

        debug!(
            session = %session.id(),
            pdf_bytes = pdf.len(),
            format = ?layout.format,
            landscape = layout.landscape,
            "document exported"
        );
        Ok(Bytes::from(pdf))
    }
}
