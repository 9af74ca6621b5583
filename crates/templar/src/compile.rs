//! Compiling template sources into renderable objects
//!
//! A [`CompiledTemplate`] owns the engine environment its entry template was
//! parsed in, together with whatever lookup that environment uses to resolve
//! includes and imports. Compilation of the entry template is eager, so an
//! invalid source fails when it is loaded and not on first render.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use minijinja::Environment;
use serde::Serialize;

use crate::error::{Result, compile_error, render_error};

/// A parsed template ready to be rendered any number of times
pub struct CompiledTemplate {
    env: Environment<'static>,
    name: String,
}

impl CompiledTemplate {
    /// Compile a single self-contained document.
    pub fn from_source(name: impl Into<String>, source: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let mut env = Environment::new();
        env.add_template_owned(name.clone(), source.into())
            .map_err(|e| compile_error(&name, e))?;
        Ok(Self { env, name })
    }

    /// Compile `name` out of a closed set of named sources.
    ///
    /// References to other templates resolve against `sources` only; a name
    /// absent from the set behaves exactly like a missing file.
    pub fn from_sources(name: impl Into<String>, sources: HashMap<String, String>) -> Result<Self> {
        let sources = Arc::new(sources);
        Self::from_lookup(name, move |requested| sources.get(requested).cloned())
    }

    /// Compile `name` using an arbitrary read-only lookup for template text.
    pub fn from_lookup<F>(name: impl Into<String>, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        let mut env = Environment::new();
        env.set_loader(move |requested| Ok(lookup(requested)));
        Self::prime(env, name.into())
    }

    /// Compile `name` from files below `dir`.
    ///
    /// This performs blocking file I/O.
    pub fn from_directory(dir: impl AsRef<Path>, name: impl Into<String>) -> Result<Self> {
        Self::from_directory_observed(dir, name, |_| {})
    }

    /// Like [`from_directory`](Self::from_directory), calling `observe` with
    /// the name of every file the environment reads, includes too.
    ///
    /// Includes are read lazily, so names keep arriving while rendering.
    pub fn from_directory_observed<F>(
        dir: impl AsRef<Path>,
        name: impl Into<String>,
        observe: F,
    ) -> Result<Self>
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        let read = minijinja::path_loader(dir.as_ref().to_path_buf());
        let mut env = Environment::new();
        env.set_loader(move |requested| {
            let source = read(requested)?;
            if source.is_some() {
                observe(requested);
            }
            Ok(source)
        });
        Self::prime(env, name.into())
    }

    fn prime(env: Environment<'static>, name: String) -> Result<Self> {
        env.get_template(&name).map_err(|e| compile_error(&name, e))?;
        Ok(Self { env, name })
    }

    /// Name of the entry template
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Render the entry template with `data` as its context.
    pub fn render<S: Serialize>(&self, data: S) -> Result<String> {
        let template = self.env.get_template(&self.name).map_err(render_error)?;
        template.render(data).map_err(render_error)
    }
}

impl fmt::Debug for CompiledTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledTemplate")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
