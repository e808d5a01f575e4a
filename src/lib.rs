//! Host-side manager for a fleet of BLE wearables: presence tracking,
//! serialized command sessions, file transfer and clock synchronization.

pub mod domain;
pub mod infrastructure;
