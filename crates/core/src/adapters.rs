//! LoRA adapter discovery
//!
//! Adapters are plain weight files dropped into one directory. The registry
//! never caches: every listing is a fresh scan, so files added or removed
//! while the app runs show up on the next refresh.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// File extensions recognised as adapter weight files
pub const ADAPTER_EXTENSIONS: &[&str] = &["safetensors"];

/// Name of an adapter file inside the adapters directory.
///
/// Two identities are equal when their file names are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AdapterIdentity(String);

impl AdapterIdentity {
    pub fn new(file_name: impl Into<String>) -> Self {
        Self(file_name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// File name without the extension, for display
    pub fn display_name(&self) -> &str {
        Path::new(&self.0)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(&self.0)
    }

    /// True if the name is a bare file name (no separators, no parent hops)
    pub fn is_plain_file_name(&self) -> bool {
        !self.0.is_empty()
            && !self.0.contains('/')
            && !self.0.contains('\\')
            && self.0 != "."
            && self.0 != ".."
    }
}

impl std::fmt::Display for AdapterIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

fn has_adapter_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| {
            ADAPTER_EXTENSIONS
                .iter()
                .any(|known| e.eq_ignore_ascii_case(known))
        })
        .unwrap_or(false)
}

#[derive(Debug, Clone)]
pub struct AdapterRegistry {
    dir: PathBuf,
}

impl AdapterRegistry {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Scan the adapters directory, sorted by name.
    ///
    /// A missing or unreadable directory yields an empty list.
    pub fn list(&self) -> Vec<AdapterIdentity> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::debug!("Adapters directory {:?} not readable: {}", self.dir, e);
                return Vec::new();
            }
        };

        let mut adapters: Vec<AdapterIdentity> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
            .map(|e| e.path())
            .filter(|p| has_adapter_extension(p))
            .filter_map(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map(AdapterIdentity::new)
            })
            .collect();

        adapters.sort();
        adapters
    }

    /// Re-scan the directory
    pub fn refresh(&self) -> Vec<AdapterIdentity> {
        let adapters = self.list();
        tracing::info!("Found {} adapter(s) in {:?}", adapters.len(), self.dir);
        adapters
    }

    /// Path the identity refers to. Existence is not checked here.
    pub fn resolve(&self, identity: &AdapterIdentity) -> PathBuf {
        self.dir.join(identity.as_str())
    }
}
