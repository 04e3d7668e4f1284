//! Identity derivation from storage layout.
//!
//! Manifests arrive in a `<root>/<hash>/<alias>/manifest.json` tree, and the
//! manifest itself may omit `hash_id`. [`IdentityResolver`] abstracts the
//! path → identity convention so alternate layouts stay pluggable.

use std::path::Path;

/// Identity fields recoverable from a manifest's location on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathIdentity {
    pub hash_id: String,
    pub alias: String,
}

pub trait IdentityResolver: Send + Sync {
    /// Resolve the identity for a manifest path, or `None` when the path
    /// does not follow the resolver's layout.
    fn resolve(&self, manifest_path: &Path) -> Option<PathIdentity>;
}

/// The default `<root>/<hash>/<alias>/manifest.json` convention: the alias
/// is the manifest's parent directory, the hash its grandparent.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectoryLayout;

impl IdentityResolver for DirectoryLayout {
    fn resolve(&self, manifest_path: &Path) -> Option<PathIdentity> {
        let alias_dir = manifest_path.parent()?;
        let hash_dir = alias_dir.parent()?;

        let alias = alias_dir.file_name()?.to_str()?.to_string();
        let hash_id = hash_dir.file_name()?.to_str()?.to_string();

        if alias.is_empty() || hash_id.is_empty() {
            return None;
        }

        Some(PathIdentity { hash_id, alias })
    }
}
