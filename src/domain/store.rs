//! Profile Store
//!
//! Key-value persistence for the profile records: every key maps to one
//! JSON document. The file-backed store keeps a file per key under the
//! platform config directory; the in-memory store backs tests.

use crate::domain::profiles::{
    default_presets, default_rooms, DeviceRecord, PresetRecord, RoomRecord,
};
use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::debug;

pub const DEVICES_KEY: &str = "devices";
pub const ROOMS_KEY: &str = "rooms";
pub const PRESETS_KEY: &str = "presets";

/// Raw storage contract: one JSON document per string key.
pub trait ProfileStore: Send + Sync {
    /// Returns the stored document, or `None` if the key was never written.
    fn load_raw(&self, key: &str) -> Result<Option<String>>;
    fn save_raw(&self, key: &str, json: &str) -> Result<()>;
}

/// Typed access on top of any [`ProfileStore`]. A missing key reads as an
/// empty record list.
pub trait ProfileStoreExt: ProfileStore {
    fn load_records<T: DeserializeOwned>(&self, key: &str) -> Result<Vec<T>> {
        match self.load_raw(key)? {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(Vec::new()),
        }
    }

    fn save_records<T: Serialize>(&self, key: &str, records: &[T]) -> Result<()> {
        self.save_raw(key, &serde_json::to_string(records)?)
    }

    fn devices(&self) -> Result<Vec<DeviceRecord>> {
        self.load_records(DEVICES_KEY)
    }

    fn save_devices(&self, devices: &[DeviceRecord]) -> Result<()> {
        self.save_records(DEVICES_KEY, devices)
    }

    fn rooms(&self) -> Result<Vec<RoomRecord>> {
        self.load_records(ROOMS_KEY)
    }

    fn save_rooms(&self, rooms: &[RoomRecord]) -> Result<()> {
        self.save_records(ROOMS_KEY, rooms)
    }

    fn presets(&self) -> Result<Vec<PresetRecord>> {
        self.load_records(PRESETS_KEY)
    }

    fn save_presets(&self, presets: &[PresetRecord]) -> Result<()> {
        self.save_records(PRESETS_KEY, presets)
    }
}

impl<S: ProfileStore + ?Sized> ProfileStoreExt for S {}

/// Writes the factory rooms and presets for keys that have never been
/// written, leaving existing data alone. Devices start empty.
pub fn seed_factory_profiles(store: &dyn ProfileStore) -> Result<()> {
    if store.load_raw(ROOMS_KEY)?.is_none() {
        debug!("Seeding factory rooms");
        store.save_records(ROOMS_KEY, &default_rooms())?;
    }
    if store.load_raw(PRESETS_KEY)?.is_none() {
        debug!("Seeding factory presets");
        store.save_records(PRESETS_KEY, &default_presets())?;
    }
    Ok(())
}

/// File-per-key store under the platform config directory.
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new() -> Result<Self> {
        let mut dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        dir.push("AcousticPod");
        Self::with_dir(dir)
    }

    pub fn with_dir(dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn key_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }
}

impl ProfileStore for JsonFileStore {
    fn load_raw(&self, key: &str) -> Result<Option<String>> {
        match fs::read_to_string(self.key_path(key)) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save_raw(&self, key: &str, json: &str) -> Result<()> {
        fs::write(self.key_path(key), json)?;
        Ok(())
    }
}

/// In-memory store for tests.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProfileStore for MemoryStore {
    fn load_raw(&self, key: &str) -> Result<Option<String>> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| anyhow::anyhow!("Store lock poisoned"))?;
        Ok(entries.get(key).cloned())
    }

    fn save_raw(&self, key: &str, json: &str) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| anyhow::anyhow!("Store lock poisoned"))?;
        entries.insert(key.to_string(), json.to_string());
        Ok(())
    }
}
