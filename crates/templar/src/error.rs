//! Error types for the templar library
//!
//! Errors are organized by the stage that produced them: resolving and
//! compiling a template, or rendering a compiled template with data.

use thiserror::Error;

/// Main error type for the templar library
#[derive(Error, Debug)]
pub enum TemplarError {
    /// Template-related errors (lookup, compilation, construction)
    #[error("Template error: {0}")]
    Template(#[from] TemplateError),

    /// Errors raised while rendering a compiled template
    #[error("Render error: {0}")]
    Render(#[from] RenderError),

    /// Data serialization errors
    #[error("Data error: {0}")]
    Data(#[from] serde_json::Error),
}

/// Template-related errors
///
/// These errors occur while a template is being located or compiled.
#[derive(Error, Debug)]
pub enum TemplateError {
    #[error("Template not found: {name}")]
    NotFound { name: String },

    #[error("Syntax error in template {name}{}: {message}", line_suffix(.line))]
    Syntax {
        name: String,
        line: Option<usize>,
        message: String,
    },

    #[error("Conflicting template sources: {reason}")]
    Conflict { reason: String },
}

/// Rendering error with the location the engine reported
#[derive(Error, Debug, Clone)]
#[error("{}{message}", location_prefix(.template, .line))]
pub struct RenderError {
    /// The error message
    pub message: String,
    /// Template the error occurred in, if the engine knows it
    pub template: Option<String>,
    /// Line number (1-based)
    pub line: Option<usize>,
}

fn line_suffix(line: &Option<usize>) -> String {
    line.map(|l| format!(" (line {l})")).unwrap_or_default()
}

fn location_prefix(template: &Option<String>, line: &Option<usize>) -> String {
    match (template, line) {
        (Some(t), Some(l)) => format!("{t}:{l}: "),
        (Some(t), None) => format!("{t}: "),
        _ => String::new(),
    }
}

/// Shorthand result type for templar operations
pub type Result<T> = std::result::Result<T, TemplarError>;

/// Classify an engine error raised while compiling `name`.
pub(crate) fn compile_error(name: &str, error: minijinja::Error) -> TemplarError {
    match error.kind() {
        minijinja::ErrorKind::TemplateNotFound => TemplateError::NotFound {
            name: name.to_string(),
        }
        .into(),
        _ => TemplateError::Syntax {
            name: error.name().unwrap_or(name).to_string(),
            line: error.line(),
            message: error.detail().unwrap_or("invalid template").to_string(),
        }
        .into(),
    }
}

/// Convert an engine error raised while rendering.
pub(crate) fn render_error(error: minijinja::Error) -> TemplarError {
    TemplarError::Render(RenderError {
        message: match error.detail() {
            Some(detail) => format!("{}: {detail}", error.kind()),
            None => error.kind().to_string(),
        },
        template: error.name().map(str::to_string),
        line: error.line(),
    })
}

impl TemplarError {
    /// Whether the error means the template does not exist at its source
    pub fn is_not_found(&self) -> bool {
        matches!(self, TemplarError::Template(TemplateError::NotFound { .. }))
    }

    /// Whether the template source failed to compile
    pub fn is_syntax(&self) -> bool {
        matches!(self, TemplarError::Template(TemplateError::Syntax { .. }))
    }
}
