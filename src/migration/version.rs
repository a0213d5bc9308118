use std::path::Path;

use crate::migration::error::DetectionError;
use crate::storage::{
    read_header, DatabaseLayout, StoreFile, StoreVersion, CURRENT_GENERATION, FORMAT_NAME,
    LEGACY_GENERATION,
};

/// How a detected version relates to this build.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VersionCheck {
    /// Equal to the kernel version; open normally.
    Current,
    /// Older, and a migration path is registered.
    Upgradable,
    /// Known but no migration path leads from it.
    Unsupported,
}

/// Reads store versions from file headers without opening the store.
#[derive(Clone, Debug)]
pub struct VersionOracle {
    current: StoreVersion,
    upgradable_from: Vec<StoreVersion>,
}

impl Default for VersionOracle {
    fn default() -> Self {
        Self::new()
    }
}

impl VersionOracle {
    /// Oracle for this build: current generation plus the registered sources.
    pub fn new() -> Self {
        Self {
            current: StoreVersion::current(),
            upgradable_from: vec![StoreVersion::new(LEGACY_GENERATION)],
        }
    }

    /// Oracle for `current` that can upgrade only from `sources`.
    pub fn with_sources(current: StoreVersion, sources: Vec<StoreVersion>) -> Self {
        Self {
            current,
            upgradable_from: sources,
        }
    }

    /// The kernel's native version.
    pub fn current(&self) -> &StoreVersion {
        &self.current
    }

    /// Version of the store, taken from the meta file header.
    pub fn detect(&self, layout: &DatabaseLayout) -> Result<StoreVersion, DetectionError> {
        self.detect_file(&layout.store_file(StoreFile::Meta))
    }

    /// Version recorded in one store file.
    pub fn detect_file(&self, path: &Path) -> Result<StoreVersion, DetectionError> {
        let header = read_header(path).map_err(|source| DetectionError::Unreadable {
            path: path.to_path_buf(),
            source,
        })?;
        let version = header.version;
        if !self.is_known(&version) {
            return Err(DetectionError::Unknown {
                path: path.to_path_buf(),
                found: version,
            });
        }
        Ok(version)
    }

    /// Version of every store file present in `layout`.
    pub fn detect_all(
        &self,
        layout: &DatabaseLayout,
    ) -> Result<Vec<(StoreFile, StoreVersion)>, DetectionError> {
        layout
            .present_store_files()
            .into_iter()
            .map(|file| Ok((file, self.detect_file(&layout.store_file(file))?)))
            .collect()
    }

    /// Whether every present store file is in the current version.
    pub fn has_current_format(&self, layout: &DatabaseLayout) -> Result<bool, DetectionError> {
        let versions = self.detect_all(layout)?;
        Ok(!versions.is_empty() && versions.iter().all(|(_, v)| *v == self.current))
    }

    /// Classifies `version` against this build.
    pub fn compare(&self, version: &StoreVersion) -> VersionCheck {
        if *version == self.current {
            VersionCheck::Current
        } else if self.upgradable_from.contains(version) {
            VersionCheck::Upgradable
        } else {
            VersionCheck::Unsupported
        }
    }

    fn is_known(&self, version: &StoreVersion) -> bool {
        version.format == FORMAT_NAME
            && (LEGACY_GENERATION..=CURRENT_GENERATION).contains(&version.generation)
    }
}
