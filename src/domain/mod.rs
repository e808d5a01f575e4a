pub mod clock_sync;
pub mod error;
pub mod file_transfer;
pub mod fleet;
pub mod models;
pub mod ports;
pub mod settings;
