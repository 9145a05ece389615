//! Project snapshot types: files and declared dependencies.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single source file submitted as part of a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProjectFile {
    /// Relative, forward-slash path inside the project root.
    pub path: String,
    pub content: String,
    /// Declared size in bytes. Falls back to the UTF-8 length of `content`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

impl ProjectFile {
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
            size: None,
        }
    }

    pub fn byte_size(&self) -> u64 {
        self.size.unwrap_or(self.content.len() as u64)
    }

    /// Final path segment.
    pub fn basename(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}

/// Package name → version range, split the way npm manifests split them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectDependencies {
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
    #[serde(default)]
    pub dev_dependencies: BTreeMap<String, String>,
    #[serde(default)]
    pub peer_dependencies: BTreeMap<String, String>,
}

impl ProjectDependencies {
    pub fn with_dependency(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.dependencies.insert(name.into(), version.into());
        self
    }

    pub fn with_dev_dependency(
        mut self,
        name: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        self.dev_dependencies.insert(name.into(), version.into());
        self
    }

    /// Every declared package name across all three maps.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.dependencies
            .keys()
            .chain(self.dev_dependencies.keys())
            .chain(self.peer_dependencies.keys())
            .map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.dependencies.len() + self.dev_dependencies.len() + self.peer_dependencies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Overlay `other` on top of `self`; entries in `other` win.
    pub fn merge(&mut self, other: &ProjectDependencies) {
        self.dependencies.extend(other.dependencies.clone());
        self.dev_dependencies.extend(other.dev_dependencies.clone());
        self.peer_dependencies.extend(other.peer_dependencies.clone());
    }
}
