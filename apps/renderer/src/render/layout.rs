//! Page layout for the export phase: paper format, margins, and the repeating
//! header/footer templates.
//!
//! Page-number tokens inside header/footer templates are resolved by the browser
//! after pagination, using its native markers:
//! `<span class="pageNumber"></span>`, `<span class="totalPages"></span>`,
//! `<span class="date"></span>` and `<span class="title"></span>`.
//! They never pass through the template compiler.

use std::str::FromStr;

use serde::Deserialize;
use thiserror::Error;

/// Rendered in place of a missing header or footer when the other one is set,
/// so the browser does not fall back to its default date/URL decoration.
pub const EMPTY_DECORATION: &str = "<span></span>";

const PX_PER_INCH: f64 = 96.0;
const CM_PER_INCH: f64 = 2.54;
const MM_PER_INCH: f64 = 25.4;
const PT_PER_INCH: f64 = 72.0;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum LayoutError {
    #[error("unknown page format '{0}' (expected A3, A4, A5, Letter, Legal or Tabloid)")]
    UnknownFormat(String),

    #[error("invalid CSS length '{0}'")]
    InvalidLength(String),
}

// ────────────────────────────────────────────────────────────────────────────
// Paper formats
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PaperFormat {
    A3,
    #[default]
    A4,
    A5,
    Letter,
    Legal,
    Tabloid,
}

impl PaperFormat {
    /// Portrait (width, height) in inches.
    pub fn size_inches(self) -> (f64, f64) {
        match self {
            PaperFormat::A3 => (11.69, 16.54),
            PaperFormat::A4 => (8.27, 11.69),
            PaperFormat::A5 => (5.83, 8.27),
            PaperFormat::Letter => (8.5, 11.0),
            PaperFormat::Legal => (8.5, 14.0),
            PaperFormat::Tabloid => (11.0, 17.0),
        }
    }
}

impl FromStr for PaperFormat {
    type Err = LayoutError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "a3" => Ok(PaperFormat::A3),
            "a4" => Ok(PaperFormat::A4),
            "a5" => Ok(PaperFormat::A5),
            "letter" => Ok(PaperFormat::Letter),
            "legal" => Ok(PaperFormat::Legal),
            "tabloid" => Ok(PaperFormat::Tabloid),
            _ => Err(LayoutError::UnknownFormat(s.to_string())),
        }
    }
}

/// Parses a CSS length (`80px`, `1cm`, `0.5in`, `12mm`, `10pt`, or a bare
/// number meaning pixels) into inches.
pub fn parse_css_length(raw: &str) -> Result<f64, LayoutError> {
    let text = raw.trim();
    let split = text
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(text.len());
    let (number, unit) = text.split_at(split);

    let value: f64 = number
        .parse()
        .map_err(|_| LayoutError::InvalidLength(raw.to_string()))?;

    let inches = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "px" => value / PX_PER_INCH,
        "in" => value,
        "cm" => value / CM_PER_INCH,
        "mm" => value / MM_PER_INCH,
        "pt" => value / PT_PER_INCH,
        _ => return Err(LayoutError::InvalidLength(raw.to_string())),
    };
    Ok(inches)
}

// ────────────────────────────────────────────────────────────────────────────
// Layout spec
// ────────────────────────────────────────────────────────────────────────────

/// Page margins in inches.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Margins {
    pub top: f64,
    pub bottom: f64,
    pub left: f64,
    pub right: f64,
}

impl Margins {
    pub fn uniform(inches: f64) -> Self {
        Self {
            top: inches,
            bottom: inches,
            left: inches,
            right: inches,
        }
    }

    pub fn parse(top: &str, bottom: &str, left: &str, right: &str) -> Result<Self, LayoutError> {
        Ok(Self {
            top: parse_css_length(top)?,
            bottom: parse_css_length(bottom)?,
            left: parse_css_length(left)?,
            right: parse_css_length(right)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LayoutSpec {
    pub format: PaperFormat,
    pub landscape: bool,
    pub print_background: bool,
    pub margins: Margins,
    pub header_template: Option<String>,
    pub footer_template: Option<String>,
}

impl Default for LayoutSpec {
    fn default() -> Self {
        Self {
            format: PaperFormat::A4,
            landscape: false,
            print_background: true,
            margins: Margins::uniform(1.0 / CM_PER_INCH),
            header_template: None,
            footer_template: None,
        }
    }
}

/// Per-request layout overrides, as sent in the render request body.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayoutOverrides {
    pub format: Option<String>,
    pub landscape: Option<bool>,
    pub header_template: Option<String>,
    pub footer_template: Option<String>,
    pub margin: Option<MarginOverrides>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MarginOverrides {
    pub top: Option<String>,
    pub bottom: Option<String>,
    pub left: Option<String>,
    pub right: Option<String>,
}

impl LayoutSpec {
    /// Applies request overrides on top of this (deployment) layout.
    pub fn with_overrides(&self, overrides: &LayoutOverrides) -> Result<LayoutSpec, LayoutError> {
        let mut spec = self.clone();

        if let Some(format) = &overrides.format {
            spec.format = format.parse()?;
        }
        if let Some(landscape) = overrides.landscape {
            spec.landscape = landscape;
        }
        if let Some(header) = &overrides.header_template {
            spec.header_template = Some(header.clone());
        }
        if let Some(footer) = &overrides.footer_template {
            spec.footer_template = Some(footer.clone());
        }
        if let Some(margin) = &overrides.margin {
            let side = |value: &Option<String>, current: f64| match value {
                Some(v) => parse_css_length(v),
                None => Ok(current),
            };
            spec.margins = Margins {
                top: side(&margin.top, spec.margins.top)?,
                bottom: side(&margin.bottom, spec.margins.bottom)?,
                left: side(&margin.left, spec.margins.left)?,
                right: side(&margin.right, spec.margins.right)?,
            };
        }

        Ok(spec)
    }

    /// The (header, footer) pair to hand to the engine, or `None` when neither
    /// is configured and page decoration stays off.
    pub fn header_footer(&self) -> Option<(String, String)> {
        if self.header_template.is_none() && self.footer_template.is_none() {
            return None;
        }
        let or_empty = |t: &Option<String>| t.clone().unwrap_or_else(|| EMPTY_DECORATION.to_string());
        Some((or_empty(&self.header_template), or_empty(&self.footer_template)))
    }
}
