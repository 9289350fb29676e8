use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

use anyhow::{Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};

/// Saved playback progress of one episode, in seconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EpisodeProgress {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StateFile {
    #[serde(default)]
    progress: BTreeMap<String, EpisodeProgress>,
}

/// Durable resume positions, written through to disk on every mutation.
pub struct ProgressStore {
    path: PathBuf,
    state: StateFile,
}

impl ProgressStore {
    /// Load persisted progress. An unreadable or malformed state file starts
    /// fresh instead of failing.
    pub fn load(path: PathBuf) -> Self {
        let state = match fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<StateFile>(&raw) {
                Ok(state) => state,
                Err(err) => {
                    warn!(
                        "state file {} is not usable ({err}), starting fresh",
                        path.display()
                    );
                    StateFile::default()
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => StateFile::default(),
            Err(err) => {
                warn!("could not read state file {}: {err}", path.display());
                StateFile::default()
            }
        };
        ProgressStore { path, state }
    }

    pub fn get(&self, key: &str) -> EpisodeProgress {
        self.state.progress.get(key).cloned().unwrap_or_default()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.state.progress.contains_key(key)
    }

    /// Merge the provided fields into the episode's record and persist.
    /// A failed write rolls the record back, keeping memory and disk in step.
    pub fn set_position(
        &mut self,
        key: &str,
        position: Option<f64>,
        duration: Option<f64>,
    ) -> Result<()> {
        let previous = self.state.progress.get(key).cloned();
        let entry = self.state.progress.entry(key.to_string()).or_default();
        if let Some(position) = position {
            entry.position = Some(position);
        }
        if let Some(duration) = duration {
            entry.duration = Some(duration);
        }
        if let Err(err) = self.save() {
            match previous {
                Some(record) => self.state.progress.insert(key.to_string(), record),
                None => self.state.progress.remove(key),
            };
            return Err(err);
        }
        Ok(())
    }

    pub fn clear(&mut self, key: &str) -> Result<()> {
        let previous = self.state.progress.remove(key);
        if let Err(err) = self.save() {
            if let Some(record) = previous {
                self.state.progress.insert(key.to_string(), record);
            }
            return Err(err);
        }
        Ok(())
    }

    /// Watched fraction of the episode, clamped to [0, 1]. Zero until both
    /// position and a positive duration are known.
    pub fn completion_ratio(&self, key: &str) -> f64 {
        let record = self.get(key);
        match (record.position, record.duration) {
            (Some(position), Some(duration)) if duration > 0.0 => {
                (position / duration).clamp(0.0, 1.0)
            }
            _ => 0.0,
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &EpisodeProgress)> {
        self.state
            .progress
            .iter()
            .map(|(key, record)| (key.as_str(), record))
    }

    fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create state directory {}", parent.display())
            })?;
        }
        let json =
            serde_json::to_string_pretty(&self.state).context("failed to serialize state")?;
        fs::write(&self.path, json)
            .with_context(|| format!("failed to write state file {}", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store_in(dir: &tempfile::TempDir) -> ProgressStore {
        ProgressStore::load(dir.path().join("state.json"))
    }

    #[test]
    fn missing_file_starts_empty() {
        let dir = tempdir().unwrap();
        let store = store_in(&dir);
        assert_eq!(store.get("ep01.mkv"), EpisodeProgress::default());
        assert_eq!(store.entries().count(), 0);
    }

    #[test]
    fn corrupt_file_starts_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "{not json").unwrap();
        let store = ProgressStore::load(path);
        assert_eq!(store.entries().count(), 0);
    }

    #[test]
    fn non_mapping_document_starts_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "[1, 2, 3]").unwrap();
        let store = ProgressStore::load(path);
        assert_eq!(store.entries().count(), 0);
    }

    #[test]
    fn non_mapping_progress_field_starts_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, r#"{"progress": [1, 2]}"#).unwrap();
        let store = ProgressStore::load(path);
        assert_eq!(store.entries().count(), 0);
    }

    #[test]
    fn partial_update_preserves_other_fields() {
        let dir = tempdir().unwrap();
        let mut store = store_in(&dir);
        store.set_position("ep01.mkv", None, Some(100.0)).unwrap();
        store.set_position("ep01.mkv", Some(5.0), None).unwrap();

        let record = store.get("ep01.mkv");
        assert_eq!(record.position, Some(5.0));
        assert_eq!(record.duration, Some(100.0));
    }

    #[test]
    fn mutations_are_written_through() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");

        let mut store = ProgressStore::load(path.clone());
        store.set_position("ep01.mkv", Some(42.0), Some(120.0)).unwrap();

        let reloaded = ProgressStore::load(path.clone());
        assert_eq!(reloaded.get("ep01.mkv").position, Some(42.0));

        let mut store = reloaded;
        store.clear("ep01.mkv").unwrap();
        let reloaded = ProgressStore::load(path);
        assert!(!reloaded.contains("ep01.mkv"));
    }

    #[test]
    fn unknown_top_level_fields_are_dropped_on_rewrite() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(
            &path,
            r#"{"progress": {"ep01.mkv": {"position": 1.0}}, "extra": true}"#,
        )
        .unwrap();

        let mut store = ProgressStore::load(path.clone());
        assert_eq!(store.get("ep01.mkv").position, Some(1.0));
        store.set_position("ep01.mkv", Some(2.0), None).unwrap();

        let raw = fs::read_to_string(&path).unwrap();
        assert!(!raw.contains("extra"));
    }

    #[test]
    fn absent_fields_are_not_serialized() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        let mut store = ProgressStore::load(path.clone());
        store.set_position("ep01.mkv", Some(3.0), None).unwrap();

        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.contains("position"));
        assert!(!raw.contains("duration"));
    }

    #[test]
    fn completion_ratio_clamps_and_defaults() {
        let dir = tempdir().unwrap();
        let mut store = store_in(&dir);

        assert_eq!(store.completion_ratio("missing.mkv"), 0.0);

        store.set_position("a.mkv", Some(50.0), Some(100.0)).unwrap();
        assert!((store.completion_ratio("a.mkv") - 0.5).abs() < f64::EPSILON);

        store.set_position("b.mkv", Some(150.0), Some(100.0)).unwrap();
        assert_eq!(store.completion_ratio("b.mkv"), 1.0);

        store.set_position("c.mkv", Some(10.0), None).unwrap();
        assert_eq!(store.completion_ratio("c.mkv"), 0.0);

        store.set_position("d.mkv", Some(10.0), Some(0.0)).unwrap();
        assert_eq!(store.completion_ratio("d.mkv"), 0.0);
    }

    #[test]
    fn clear_missing_key_still_persists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        let mut store = ProgressStore::load(path.clone());
        store.clear("never-seen.mkv").unwrap();
        assert!(path.exists());
    }

    #[test]
    fn save_failure_propagates_and_rolls_back() {
        let dir = tempdir().unwrap();
        // The state path is a directory, so every write must fail.
        let mut store = ProgressStore::load(dir.path().to_path_buf());
        assert!(store.set_position("ep01.mkv", Some(1.0), None).is_err());
        assert!(!store.contains("ep01.mkv"));
    }
}
