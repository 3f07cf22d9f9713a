//! Local filesystem storage.

use std::path::PathBuf;

use anyhow::Result;

use crate::profile::Profile;

use super::{Storage, UploadLocation};

/// Writes profiles as JSON files under a configurable root directory.
#[derive(Debug, Clone)]
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &PathBuf {
        &self.root
    }
}

impl Storage for FileStorage {
    fn upload(&self, profile: &Profile) -> Result<UploadLocation> {
        let path = profile.write_to(&self.root)?;
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(UploadLocation {
            url: path.display().to_string(),
            name,
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_upload_writes_profile_under_root() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());
        let profile = Profile::from_engine(
            "fake",
            json!({"mode": "cpu", "samples": [1], "metadata": {}}),
        )
        .unwrap();

        let location = storage.upload(&profile).unwrap();

        assert!(location.url.starts_with(dir.path().display().to_string().as_str()));
        assert!(location.name.ends_with(".json"));
        assert!(std::path::Path::new(&location.url).exists());
    }
}
