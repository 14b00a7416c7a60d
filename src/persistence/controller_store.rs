//! Saved-controller store.
//!
//! BLE addresses are stable per controller, so pairing once and saving the
//! address under a friendly name allows later sessions to skip scanning. The
//! store is a small TOML file under the user config directory; the last
//! successfully connected address is recorded alongside it for launcher-style
//! quick-connect tooling.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use thiserror::Error;

const STORE_DIR: &str = "gcbridge";
const STORE_FILE: &str = "controllers.toml";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("could not locate a user config directory")]
    NoConfigDir,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed store file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("could not serialize store: {0}")]
    Serialize(#[from] toml::ser::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedController {
    pub name: String,
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LastConnected {
    address: String,
    at: DateTime<Local>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreFile {
    #[serde(default)]
    controllers: Vec<SavedController>,
    #[serde(default)]
    last_connected: Option<LastConnected>,
}

#[derive(Debug, Clone)]
pub struct ControllerStore {
    path: PathBuf,
}

impl ControllerStore {
    /// Store at the default per-user location.
    pub fn open_default() -> Result<Self, StoreError> {
        let dir = dirs::config_dir().ok_or(StoreError::NoConfigDir)?;
        Ok(Self::at(dir.join(STORE_DIR).join(STORE_FILE)))
    }

    pub fn at(path: PathBuf) -> Self {
        Self { path }
    }

    fn load(&self) -> Result<StoreFile, StoreError> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => Ok(toml::from_str(&contents)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(StoreFile::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn persist(&self, file: &StoreFile) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, toml::to_string_pretty(file)?)?;
        Ok(())
    }

    /// Adds or renames a controller; addresses are unique keys.
    pub fn add(&self, address: &str, name: &str) -> Result<(), StoreError> {
        let address = address.trim();
        let mut file = self.load()?;
        file.controllers.retain(|c| c.address != address);
        file.controllers.push(SavedController {
            address: address.to_string(),
            name: {
                let name = name.trim();
                if name.is_empty() {
                    address.to_string()
                } else {
                    name.to_string()
                }
            },
        });
        self.persist(&file)
    }

    /// Removes a controller by address; returns whether one was present.
    pub fn remove(&self, address: &str) -> Result<bool, StoreError> {
        let mut file = self.load()?;
        let before = file.controllers.len();
        file.controllers.retain(|c| c.address != address);
        let removed = file.controllers.len() != before;
        if removed {
            self.persist(&file)?;
        }
        Ok(removed)
    }

    pub fn list(&self) -> Result<Vec<SavedController>, StoreError> {
        Ok(self.load()?.controllers)
    }

    pub fn lookup(&self, name: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .load()?
            .controllers
            .into_iter()
            .find(|c| c.name == name)
            .map(|c| c.address))
    }

    pub fn last_connected(&self) -> Result<Option<String>, StoreError> {
        Ok(self.load()?.last_connected.map(|last| last.address))
    }

    pub fn set_last_connected(&self, address: &str) -> Result<(), StoreError> {
        let mut file = self.load()?;
        file.last_connected = Some(LastConnected {
            address: address.to_string(),
            at: Local::now(),
        });
        self.persist(&file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_store(tag: &str) -> ControllerStore {
        let path = std::env::temp_dir()
            .join(format!("gcbridge-store-{}-{tag}", std::process::id()))
            .join(STORE_FILE);
        let _ = fs::remove_file(&path);
        ControllerStore::at(path)
    }

    #[test]
    fn missing_file_reads_as_empty() {
        let store = scratch_store("empty");
        assert!(store.list().unwrap().is_empty());
        assert_eq!(store.last_connected().unwrap(), None);
    }

    #[test]
    fn add_lookup_remove_round_trip() {
        let store = scratch_store("roundtrip");
        store.add("AA:BB:CC:DD:EE:FF", "Living room").unwrap();
        store.add("11:22:33:44:55:66", "Spare").unwrap();

        assert_eq!(
            store.lookup("Living room").unwrap(),
            Some("AA:BB:CC:DD:EE:FF".to_string())
        );
        assert_eq!(store.lookup("Nobody").unwrap(), None);

        // Re-adding the same address renames instead of duplicating.
        store.add("AA:BB:CC:DD:EE:FF", "Couch").unwrap();
        let saved = store.list().unwrap();
        assert_eq!(saved.len(), 2);
        assert!(saved.iter().any(|c| c.name == "Couch"));
        assert!(!saved.iter().any(|c| c.name == "Living room"));

        assert!(store.remove("11:22:33:44:55:66").unwrap());
        assert!(!store.remove("11:22:33:44:55:66").unwrap());
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn blank_name_falls_back_to_address() {
        let store = scratch_store("blankname");
        store.add("AA:BB:CC:DD:EE:FF", "  ").unwrap();
        assert_eq!(
            store.lookup("AA:BB:CC:DD:EE:FF").unwrap(),
            Some("AA:BB:CC:DD:EE:FF".to_string())
        );
    }

    #[test]
    fn last_connected_round_trip() {
        let store = scratch_store("lastconn");
        store.set_last_connected("AA:BB:CC:DD:EE:FF").unwrap();
        assert_eq!(
            store.last_connected().unwrap(),
            Some("AA:BB:CC:DD:EE:FF".to_string())
        );
    }
}
