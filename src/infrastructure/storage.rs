//! Flat-file persistence
//!
//! One `<device id>.json` per known device in the watch list directory, and
//! transferred files written verbatim into the transferred-data directory.

use crate::domain::models::{LocalFile, PersistedDevice, TransferredFile};
use crate::domain::ports::{DeviceStore, FileSink};
use anyhow::Context;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Extensions of files produced by a transfer
const DATA_EXTENSIONS: [&str; 3] = ["csv", "hr", "sv"];

pub struct FlatFileStore {
    watch_list_dir: PathBuf,
    transferred_dir: PathBuf,
}

impl FlatFileStore {
    pub fn new(watch_list_dir: impl Into<PathBuf>, transferred_dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let store = Self {
            watch_list_dir: watch_list_dir.into(),
            transferred_dir: transferred_dir.into(),
        };
        for dir in [&store.watch_list_dir, &store.transferred_dir] {
            fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        }
        Ok(store)
    }

    fn device_path(&self, device_id: &str) -> PathBuf {
        let file_name: String = device_id
            .chars()
            .map(|c| if matches!(c, '/' | '\\' | ':') { '_' } else { c })
            .collect();
        self.watch_list_dir.join(format!("{}.json", file_name))
    }
}

fn read_device(path: &Path) -> anyhow::Result<PersistedDevice> {
    let contents = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&contents)?)
}

impl DeviceStore for FlatFileStore {
    fn save_device(&self, device: &PersistedDevice) -> anyhow::Result<()> {
        let path = self.device_path(&device.device_id);
        let json = serde_json::to_string_pretty(device)?;
        fs::write(&path, json).with_context(|| format!("writing {}", path.display()))?;
        debug!(device = %device.device_id, path = %path.display(), "Saved device");
        Ok(())
    }

    fn load_devices(&self) -> anyhow::Result<Vec<PersistedDevice>> {
        let mut devices = Vec::new();
        for entry in fs::read_dir(&self.watch_list_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_device(&path) {
                Ok(device) => devices.push(device),
                Err(e) => warn!(path = %path.display(), "Skipping unreadable device file: {:#}", e),
            }
        }
        devices.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        Ok(devices)
    }
}

impl FileSink for FlatFileStore {
    fn write_file(&self, file: &TransferredFile) -> anyhow::Result<PathBuf> {
        let path = self.transferred_dir.join(&file.name);
        fs::write(&path, file.lines.join("\n")).with_context(|| format!("writing {}", path.display()))?;
        Ok(path)
    }

    fn list_files(&self) -> anyhow::Result<Vec<LocalFile>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.transferred_dir)? {
            let entry = entry?;
            let path = entry.path();
            let is_data = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| DATA_EXTENSIONS.contains(&e));
            if !is_data {
                continue;
            }
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                files.push(LocalFile {
                    name: name.to_string(),
                    size: entry.metadata()?.len(),
                });
            }
        }
        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store(tag: &str) -> (FlatFileStore, PathBuf) {
        let root = std::env::temp_dir().join(format!(
            "wearable_fleet_{}_{}",
            tag,
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&root);
        let store = FlatFileStore::new(root.join("watch_list"), root.join("transferred")).unwrap();
        (store, root)
    }

    #[test]
    fn test_device_list_round_trip() {
        let (store, root) = temp_store("devices");
        let device = PersistedDevice {
            device_id: "Bangle.js 1a2b".to_string(),
            watch_name: "W001".to_string(),
            mac_id: "Unknown".to_string(),
            serial_number: "Unknown".to_string(),
        };
        store.save_device(&device).unwrap();
        fs::write(root.join("watch_list").join("broken.json"), "{").unwrap();

        assert_eq!(store.load_devices().unwrap(), vec![device]);
        fs::remove_dir_all(root).unwrap();
    }

    #[test]
    fn test_write_and_list_files() {
        let (store, root) = temp_store("files");
        let file = TransferredFile {
            name: "2024-06-01_time_10-00-00_0000_W001.csv".to_string(),
            header: None,
            lines: vec!["START_RECORD".to_string(), "1,2,3".to_string()],
        };
        let path = store.write_file(&file).unwrap();
        assert_eq!(fs::read_to_string(path).unwrap(), "START_RECORD\n1,2,3");
        fs::write(root.join("transferred").join("notes.txt"), "x").unwrap();

        let files = store.list_files().unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].size, 18);
        fs::remove_dir_all(root).unwrap();
    }
}
