//! Cache keys naming where a template comes from

use std::fmt;

use serde::{Deserialize, Serialize};
use templar::TemplateId;

/// Scheme of templates read from the local filesystem
pub const FILE_SCHEME: &str = "file";
/// Scheme of templates embedded in a crate at compile time
pub const PACKAGE_SCHEME: &str = "package";

/// Typed key identifying a (source kind, location) pair.
///
/// Every component takes part in equality, so loaders of different kinds
/// can never share a cache slot even when their paths happen to match.
/// Rendered as `{scheme}://{root}/{directory}/{name}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LoaderIdentity {
    scheme: String,
    root: String,
    directory: String,
    name: String,
}

impl LoaderIdentity {
    pub fn new(
        scheme: impl Into<String>,
        root: impl Into<String>,
        directory: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            scheme: scheme.into(),
            root: root.into(),
            directory: directory.into(),
            name: name.into(),
        }
    }

    /// Identity of a file below a local directory
    pub fn file(directory: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(FILE_SCHEME, "", directory, name)
    }

    /// Identity of a resource embedded in `package`
    pub fn package(
        package: impl Into<String>,
        directory: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self::new(PACKAGE_SCHEME, package, directory, name)
    }

    /// Identity of an object in a bucket of an object store
    pub fn object(
        scheme: impl Into<String>,
        bucket: impl Into<String>,
        directory: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self::new(scheme, bucket, directory, name)
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn directory(&self) -> &str {
        &self.directory
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for LoaderIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}://{}/{}/{}",
            self.scheme,
            self.root,
            self.directory.trim_matches('/'),
            self.name
        )
    }
}

impl From<&LoaderIdentity> for TemplateId {
    fn from(identity: &LoaderIdentity) -> Self {
        TemplateId(identity.to_string())
    }
}

/// Split a template path into its directory and file name.
///
/// A path without a directory component lives in `"."`.
pub fn split_template_path(path: &str) -> (String, String) {
    match path.rsplit_once('/') {
        Some(("", name)) => ("/".to_string(), name.to_string()),
        Some((directory, name)) => (directory.to_string(), name.to_string()),
        None => (".".to_string(), path.to_string()),
    }
}
