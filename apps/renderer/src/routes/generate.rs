use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderName, HeaderValue},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::Value;

use crate::errors::AppError;
use crate::render::{LayoutOverrides, RenderRequest};
use crate::state::AppState;

/// `full` or `degraded`; a degraded PDF was exported after a readiness wait ran out.
pub const READINESS_HEADER: HeaderName = HeaderName::from_static("x-render-readiness");

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequest {
    #[serde(default)]
    pub template_name: String,
    #[serde(default = "empty_object")]
    pub data: Value,
    /// Per-request changes to the deployment's page layout.
    #[serde(default)]
    pub layout: Option<LayoutOverrides>,
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

/// POST /generate
pub async fn handle_generate(
    State(state): State<AppState>,
    Json(req): Json<GenerateRequest>,
) -> Result<Response, AppError> {
    let template_name = req.template_name.trim();
    if template_name.is_empty() {
        return Err(AppError::Validation("templateName is required".to_string()));
    }

    let layout = state
        .pipeline
        .layout_for(req.layout.as_ref())
        .map_err(|e| AppError::Validation(format!("invalid layout: {e}")))?;

    let request = RenderRequest {
        template_name: template_name.to_string(),
        data: req.data,
        layout,
    };
    let document = state.pipeline.render(&request).await?;

    Ok((
        [
            (header::CONTENT_TYPE, HeaderValue::from_static("application/pdf")),
            (
                READINESS_HEADER,
                HeaderValue::from_static(document.readiness.label()),
            ),
        ],
        Body::from(document.pdf),
    )
        .into_response())
}
