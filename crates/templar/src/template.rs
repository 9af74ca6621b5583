//! The template handle given to calling code

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::compile::CompiledTemplate;
use crate::error::{Result, TemplateError};

/// Name used for templates given directly as source text
pub const RAW_TEMPLATE_NAME: &str = "<raw>";

/// Identifier of the source a template was loaded from
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct TemplateId(pub String);

impl From<String> for TemplateId {
    fn from(s: String) -> Self {
        TemplateId(s)
    }
}

impl From<&str> for TemplateId {
    fn from(s: &str) -> Self {
        TemplateId(s.to_string())
    }
}

impl AsRef<str> for TemplateId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TemplateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A compiled template plus the output of its most recent render.
///
/// The compiled form is shared (a cache may hand the same instance to many
/// callers); the rendered output belongs to this handle alone.
#[derive(Debug)]
pub struct Template {
    id: Option<TemplateId>,
    compiled: Arc<CompiledTemplate>,
    rendered: Option<String>,
}

impl Template {
    /// Compile a template given directly as source text.
    ///
    /// Such templates are not backed by any durable source and carry no id.
    pub fn from_raw(source: impl Into<String>) -> Result<Self> {
        let compiled = CompiledTemplate::from_source(RAW_TEMPLATE_NAME, source)?;
        Ok(Self {
            id: None,
            compiled: Arc::new(compiled),
            rendered: None,
        })
    }

    /// Wrap an already compiled template loaded from `id`.
    pub fn from_compiled(id: impl Into<TemplateId>, compiled: Arc<CompiledTemplate>) -> Self {
        Self {
            id: Some(id.into()),
            compiled,
            rendered: None,
        }
    }

    /// Create a new template builder
    pub fn builder() -> TemplateBuilder {
        TemplateBuilder::default()
    }

    /// Render the template with `data`, keeping the output for inspection.
    ///
    /// Rendering is idempotent: the same data always yields the same text.
    pub fn render<S: Serialize>(&mut self, data: S) -> Result<&str> {
        let output = self.compiled.render(data)?;
        Ok(self.rendered.insert(output).as_str())
    }

    /// Output of the most recent successful render
    pub fn rendered(&self) -> Option<&str> {
        self.rendered.as_deref()
    }

    /// The shared compiled form
    pub fn compiled(&self) -> &Arc<CompiledTemplate> {
        &self.compiled
    }

    /// Identifier of the backing source, absent for raw templates
    pub fn id(&self) -> Option<&TemplateId> {
        self.id.as_ref()
    }
}

impl Clone for Template {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            compiled: Arc::clone(&self.compiled),
            rendered: None, // Fresh output slot for the clone
        }
    }
}

/// Builder for [`Template`]
#[derive(Debug, Default)]
pub struct TemplateBuilder {
    id: Option<TemplateId>,
    raw: Option<String>,
    compiled: Option<Arc<CompiledTemplate>>,
}

impl TemplateBuilder {
    /// Set the source identifier
    pub fn id(mut self, id: impl Into<TemplateId>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Use raw source text
    pub fn raw(mut self, source: impl Into<String>) -> Self {
        self.raw = Some(source.into());
        self
    }

    /// Use an already compiled template
    pub fn compiled(mut self, compiled: Arc<CompiledTemplate>) -> Self {
        self.compiled = Some(compiled);
        self
    }

    /// Build the template
    pub fn build(self) -> Result<Template> {
        match (self.raw, self.compiled) {
            (Some(_), Some(_)) => Err(TemplateError::Conflict {
                reason: "both raw source and a compiled template were provided".to_string(),
            }
            .into()),
            (None, None) => Err(TemplateError::Conflict {
                reason: "neither raw source nor a compiled template was provided".to_string(),
            }
            .into()),
            (Some(raw), None) => {
                let mut template = Template::from_raw(raw)?;
                template.id = self.id;
                Ok(template)
            }
            (None, Some(compiled)) => Ok(Template {
                id: self.id,
                compiled,
                rendered: None,
            }),
        }
    }
}
