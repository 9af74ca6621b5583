//! Templar compiles Jinja-style documents (typically `*.yml.j2` prompt and
//! configuration templates) into renderable objects, and defines the
//! revision markers that caching layers use to decide when a compiled
//! template has gone stale.

pub mod compile;
pub mod error;
pub mod template;
pub mod version;

// Re-export core types
pub use compile::CompiledTemplate;
pub use error::{RenderError, Result, TemplarError, TemplateError};
pub use template::{RAW_TEMPLATE_NAME, Template, TemplateBuilder, TemplateId};
pub use version::{VersionToken, is_stale};

/// Get the library version
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
