//! Profile artifacts
//!
//! A [`Profile`] is the completed result of one profiling session: the
//! opaque payload produced by the sampling engine plus the metadata the
//! coordinator guarantees (mode, id, optional context). Immutable once
//! produced; whoever collects it owns it.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::Error;
use crate::time;

pub const PROFILE_ID_METADATA_KEY: &str = "profile_id";
pub const PROFILE_BACKEND_METADATA_KEY: &str = "profiler";
const DURATION_METADATA_KEY: &str = "duration";

/// Unique id for one profiling session's artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProfileId(String);

impl ProfileId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProfileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ProfileId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// The completed profiling result.
#[derive(Debug, Clone)]
pub struct Profile {
    data: Value,
    id: ProfileId,
    context: Option<String>,
}

impl Profile {
    /// Build a profile from an engine payload.
    ///
    /// The payload must be a JSON object carrying a `mode` field. The
    /// internal metadata keys `id` and `context` are lifted out of the
    /// payload's metadata map when the engine recorded them there; the
    /// engine name and the (possibly generated) profile id are written
    /// back in their place.
    pub fn from_engine(engine_name: &str, mut data: Value) -> Result<Self, Error> {
        let object = data
            .as_object_mut()
            .ok_or_else(|| Error::InvalidProfile("payload is not an object".into()))?;

        match object.get("mode").and_then(Value::as_str) {
            Some(mode) if !mode.is_empty() => {}
            _ => return Err(Error::InvalidProfile("payload has no mode".into())),
        }

        let metadata = object
            .entry("metadata")
            .or_insert_with(|| Value::Object(Map::new()));
        let metadata = metadata
            .as_object_mut()
            .ok_or_else(|| Error::InvalidProfile("metadata is not an object".into()))?;

        let id = match metadata.remove("id").and_then(value_into_string) {
            Some(id) => ProfileId::from(id),
            None => ProfileId::generate(),
        };
        let context = metadata.remove("context").and_then(value_into_string);

        metadata.insert(
            PROFILE_BACKEND_METADATA_KEY.into(),
            Value::from(engine_name),
        );
        metadata.insert(PROFILE_ID_METADATA_KEY.into(), Value::from(id.as_str()));

        Ok(Self { data, id, context })
    }

    pub fn id(&self) -> &ProfileId {
        &self.id
    }

    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    pub fn mode(&self) -> &str {
        self.data
            .get("mode")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    pub fn as_json(&self) -> &Value {
        &self.data
    }

    pub fn into_json(self) -> Value {
        self.data
    }

    /// Record the measured session length, in seconds, into the metadata.
    pub(crate) fn set_duration_secs(&mut self, duration: f64) {
        if let Some(metadata) = self
            .data
            .get_mut("metadata")
            .and_then(Value::as_object_mut)
        {
            metadata.insert(DURATION_METADATA_KEY.into(), Value::from(duration));
        }
    }

    /// `<timestamp>-<mode>-<id>-<hostname>.json`, validated against the
    /// `[0-9A-Za-z._-]` allow-list.
    pub fn file_name(&self) -> Result<String, Error> {
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| format!("pid-{}", std::process::id()));

        let name = format!(
            "{}-{}-{}-{}.json",
            time::file_timestamp(),
            self.mode(),
            self.id,
            host
        );

        if name
            .chars()
            .any(|c| !c.is_ascii_alphanumeric() && !matches!(c, '.' | '-' | '_'))
        {
            return Err(Error::UnsafeFileName(name));
        }
        Ok(name)
    }

    /// Persist the payload as JSON under `dir`, creating it if needed.
    /// Returns the written path.
    pub fn write_to(&self, dir: &Path) -> anyhow::Result<PathBuf> {
        let path = dir.join(self.file_name()?);
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create profile directory {}", dir.display()))?;
        let body = serde_json::to_vec(&self.data).context("failed to serialize profile")?;
        fs::write(&path, body)
            .with_context(|| format!("failed to write profile {}", path.display()))?;
        Ok(path)
    }
}

fn value_into_string(value: Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn payload() -> Value {
        json!({
            "mode": "cpu",
            "interval": 1000,
            "samples": [1, 2, 3],
            "metadata": {},
        })
    }

    #[test]
    fn test_from_engine_generates_id_and_records_engine_name() {
        let profile = Profile::from_engine("fake", payload()).unwrap();
        assert!(!profile.id().as_str().is_empty());
        assert_eq!("cpu", profile.mode());
        assert_eq!(
            Some(profile.id().as_str()),
            profile.as_json()["metadata"][PROFILE_ID_METADATA_KEY].as_str()
        );
        assert_eq!(
            Some("fake"),
            profile.as_json()["metadata"][PROFILE_BACKEND_METADATA_KEY].as_str()
        );
    }

    #[test]
    fn test_from_engine_lifts_id_and_context_from_metadata() {
        let mut data = payload();
        data["metadata"] = json!({"id": "wowza", "context": "bar"});

        let profile = Profile::from_engine("fake", data).unwrap();
        assert_eq!("wowza", profile.id().as_str());
        assert_eq!(Some("bar"), profile.context());
        // Lifted keys do not survive in the payload metadata.
        assert!(profile.as_json()["metadata"].get("id").is_none());
        assert!(profile.as_json()["metadata"].get("context").is_none());
    }

    #[test]
    fn test_from_engine_rejects_payload_without_mode() {
        let err = Profile::from_engine("fake", json!({"samples": []})).unwrap_err();
        assert!(matches!(err, Error::InvalidProfile(_)));
    }

    #[test]
    fn test_from_engine_rejects_non_object_payload() {
        let err = Profile::from_engine("fake", json!("not a profile")).unwrap_err();
        assert!(matches!(err, Error::InvalidProfile(_)));
    }

    #[test]
    fn test_file_name_embeds_mode_and_id() {
        let profile = Profile::from_engine("fake", payload()).unwrap();
        let name = profile.file_name().unwrap();
        assert!(name.contains("cpu"));
        assert!(name.contains(profile.id().as_str()));
        assert!(name.ends_with(".json"));
    }

    #[test]
    fn test_file_name_rejects_unsafe_characters() {
        let mut data = payload();
        data["metadata"] = json!({"id": "../../etc/passwd"});

        let profile = Profile::from_engine("fake", data).unwrap();
        assert!(matches!(
            profile.file_name(),
            Err(Error::UnsafeFileName(_))
        ));
    }

    #[test]
    fn test_write_to_persists_payload() {
        let dir = tempfile::tempdir().unwrap();
        let profile = Profile::from_engine("fake", payload()).unwrap();

        let path = profile.write_to(dir.path()).unwrap();
        let written: Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(written, *profile.as_json());
    }

    #[test]
    fn test_set_duration_records_metadata() {
        let mut profile = Profile::from_engine("fake", payload()).unwrap();
        profile.set_duration_secs(0.25);
        assert_eq!(
            Some(0.25),
            profile.as_json()["metadata"]["duration"].as_f64()
        );
    }
}
