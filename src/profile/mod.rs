//! Per-user state the core persists: a small set of memory facts in a closed
//! category set, and optional per-mode system-prompt overrides. Stored as one
//! JSON blob per user; a corrupt or missing file means an empty profile.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use crate::types::Mode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryCategory {
    Profile,
    Interests,
    Personal,
    Insights,
    Preferences,
    Context,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserProfile {
    #[serde(default)]
    pub memory: BTreeMap<MemoryCategory, BTreeMap<String, String>>,
    #[serde(default)]
    pub prompt_overrides: HashMap<Mode, String>,
}

impl UserProfile {
    /// Flatten memory into (key, value) facts for the prompt assembler, in
    /// stable category order.
    pub fn memory_facts(&self) -> Vec<(String, String)> {
        self.memory
            .values()
            .flat_map(|facts| facts.iter().map(|(k, v)| (k.clone(), v.clone())))
            .collect()
    }

    /// Canonical serialization used for cache fingerprinting.
    pub fn memory_blob(&self) -> String {
        serde_json::to_string(&self.memory).unwrap_or_default()
    }

    pub fn override_for(&self, mode: Mode) -> Option<&str> {
        self.prompt_overrides.get(&mode).map(|s| s.as_str())
    }
}

pub struct ProfileStore {
    dir: PathBuf,
    loaded: RwLock<HashMap<String, UserProfile>>,
}

impl ProfileStore {
    pub fn new(dir: PathBuf) -> Self {
        std::fs::create_dir_all(&dir).ok();
        Self {
            dir,
            loaded: RwLock::new(HashMap::new()),
        }
    }

    fn path_for(&self, user_id: &str) -> PathBuf {
        // File names come from caller-supplied ids; keep them path-safe.
        let safe: String = user_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.json", safe))
    }

    /// Load a profile, caching it for the process lifetime. Anonymous
    /// requests get the default empty profile.
    pub fn load(&self, user_id: &str) -> UserProfile {
        if let Some(profile) = self.loaded.read().get(user_id) {
            return profile.clone();
        }

        let path = self.path_for(user_id);
        let profile = match std::fs::read_to_string(&path) {
            Ok(json) => match serde_json::from_str(&json) {
                Ok(profile) => profile,
                Err(e) => {
                    tracing::warn!(user = %user_id, error = %e, "corrupt profile, using empty");
                    UserProfile::default()
                }
            },
            Err(_) => UserProfile::default(),
        };

        self.loaded
            .write()
            .insert(user_id.to_string(), profile.clone());
        profile
    }

    pub fn save(&self, user_id: &str, profile: &UserProfile) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(profile)?;
        std::fs::write(self.path_for(user_id), json)?;
        self.loaded
            .write()
            .insert(user_id.to_string(), profile.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_profile_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProfileStore::new(dir.path().to_path_buf());
        let profile = store.load("nobody");
        assert!(profile.memory.is_empty());
        assert!(profile.prompt_overrides.is_empty());
    }

    #[test]
    fn save_and_reload_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProfileStore::new(dir.path().to_path_buf());

        let mut profile = UserProfile::default();
        profile
            .memory
            .entry(MemoryCategory::Interests)
            .or_default()
            .insert("market".into(), "ES futures".into());
        profile
            .prompt_overrides
            .insert(Mode::CorpusOnly, "Answer tersely.".into());
        store.save("trader1", &profile).unwrap();

        let fresh = ProfileStore::new(dir.path().to_path_buf());
        let loaded = fresh.load("trader1");
        assert_eq!(loaded.memory_facts(), vec![("market".into(), "ES futures".into())]);
        assert_eq!(loaded.override_for(Mode::CorpusOnly), Some("Answer tersely."));
    }

    #[test]
    fn memory_blob_is_stable() {
        let mut profile = UserProfile::default();
        profile
            .memory
            .entry(MemoryCategory::Profile)
            .or_default()
            .insert("name".into(), "Sam".into());
        assert_eq!(profile.memory_blob(), profile.clone().memory_blob());
        assert_ne!(profile.memory_blob(), UserProfile::default().memory_blob());
    }

    #[test]
    fn unsafe_user_ids_become_safe_filenames() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProfileStore::new(dir.path().to_path_buf());
        let profile = UserProfile::default();
        store.save("../../etc/passwd", &profile).unwrap();
        // Nothing escaped the profile directory.
        assert!(dir.path().join("______etc_passwd.json").exists());
    }
}
