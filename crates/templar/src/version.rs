//! Revision markers for template sources

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::SystemTime;

/// Opaque marker for one revision of a template source's content.
///
/// Two observations of the same source carrying equal tokens are assumed to
/// have identical content. That guarantee is delegated to whatever produced
/// the token (object generation, entity tag, file modification time).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionToken {
    /// Monotonic object generation number
    Generation(i64),
    /// Entity tag, content digest or build tag
    Tag(String),
    /// Local modification time
    Modified(SystemTime),
}

impl fmt::Display for VersionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionToken::Generation(generation) => write!(f, "generation {generation}"),
            VersionToken::Tag(tag) => write!(f, "tag {tag}"),
            VersionToken::Modified(at) => match at.duration_since(SystemTime::UNIX_EPOCH) {
                Ok(d) => write!(f, "modified {}.{:09}", d.as_secs(), d.subsec_nanos()),
                Err(_) => write!(f, "modified before epoch"),
            },
        }
    }
}

impl From<i64> for VersionToken {
    fn from(generation: i64) -> Self {
        VersionToken::Generation(generation)
    }
}

/// Decide whether content observed at `last` must be fetched again given the
/// source currently reports `current`.
///
/// A token that was never observed, or a source that does not track
/// revisions at all, always counts as stale.
pub fn is_stale(last: Option<&VersionToken>, current: Option<&VersionToken>) -> bool {
    match (last, current) {
        (Some(last), Some(current)) => last != current,
        _ => true,
    }
}
