use std::path::PathBuf;

use async_trait::async_trait;
use include_dir::{Dir, include_dir};
use templar::{CompiledTemplate, VersionToken};

use super::{LoadedTemplate, TemplateLoader};
use crate::error::{RegistryError, Result};
use crate::identity::{LoaderIdentity, split_template_path};

/// Example templates shipped inside this crate.
pub static BUILTIN_TEMPLATES: Dir<'static> = include_dir!("$CARGO_MANIFEST_DIR/templates");

/// Loads templates from a directory tree embedded at compile time.
///
/// Embedded content cannot change while the process runs, so the version
/// token is constant and cached templates never need a reload.
#[derive(Debug, Clone)]
pub struct PackageLoader {
    tree: &'static Dir<'static>,
    directory: String,
    name: String,
    identity: LoaderIdentity,
}

impl PackageLoader {
    /// Loader for `template_path` inside the tree `tree` embedded by `package`
    pub fn new(package: &str, tree: &'static Dir<'static>, template_path: &str) -> Self {
        let (directory, name) = split_template_path(template_path);
        let identity = LoaderIdentity::package(package, directory.as_str(), name.as_str());
        Self {
            tree,
            directory,
            name,
            identity,
        }
    }

    /// Loader for one of the example templates shipped with this crate,
    /// e.g. `"examples/chat.yml.j2"`
    pub fn builtin(template_path: &str) -> Self {
        Self::new(env!("CARGO_PKG_NAME"), &BUILTIN_TEMPLATES, template_path)
    }

    fn version(&self) -> VersionToken {
        VersionToken::Tag(format!("embedded:{}", self.identity.root()))
    }
}

#[async_trait]
impl TemplateLoader for PackageLoader {
    fn identity(&self) -> &LoaderIdentity {
        &self.identity
    }

    async fn load(&self) -> Result<LoadedTemplate> {
        let tree = self.tree;
        let base = match self.directory.as_str() {
            "." | "/" => PathBuf::new(),
            directory => PathBuf::from(directory.trim_matches('/')),
        };
        let template = CompiledTemplate::from_lookup(self.name.as_str(), move |requested| {
            tree.get_file(base.join(requested))
                .and_then(|file| file.contents_utf8())
                .map(str::to_string)
        })
        .map_err(|e| RegistryError::from_template(&self.identity, e))?;

        Ok(LoadedTemplate {
            template,
            version: Some(self.version()),
        })
    }

    async fn current_version(&self) -> Result<Option<VersionToken>> {
        Ok(Some(self.version()))
    }
}
