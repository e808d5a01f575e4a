//! Collaborator ports
//!
//! The fleet core persists nothing itself. Device metadata and transferred
//! files go through these traits; `infrastructure::storage` provides the
//! flat-file implementation and tests use in-memory ones.

use crate::domain::models::{LocalFile, PersistedDevice, TransferredFile};
use std::path::PathBuf;

/// Persisted device list, one record per known device.
pub trait DeviceStore: Send + Sync {
    fn save_device(&self, device: &PersistedDevice) -> anyhow::Result<()>;

    fn load_devices(&self) -> anyhow::Result<Vec<PersistedDevice>>;
}

/// Destination for reconstructed transfer files.
pub trait FileSink: Send + Sync {
    /// Write a completed file and return where it landed.
    fn write_file(&self, file: &TransferredFile) -> anyhow::Result<PathBuf>;

    fn list_files(&self) -> anyhow::Result<Vec<LocalFile>>;
}

/// Server wall clock in milliseconds since the Unix epoch.
pub trait ServerClock: Send + Sync {
    fn now_ms(&self) -> f64;

    fn current_year(&self) -> u32;
}

pub struct SystemClock;

impl ServerClock for SystemClock {
    fn now_ms(&self) -> f64 {
        chrono::Utc::now().timestamp_micros() as f64 / 1000.0
    }

    fn current_year(&self) -> u32 {
        use chrono::Datelike;
        chrono::Local::now().year().max(0) as u32
    }
}
