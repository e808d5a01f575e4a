use crate::domain::clock_sync::ClockSyncParams;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_true")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_true")]
    pub show_file_line: bool,
    #[serde(default = "default_false")]
    pub show_thread_ids: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_true(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_true(),
            show_thread_ids: default_false(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "wearable_fleet".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub log_settings: LogSettings,

    // Storage
    #[serde(default = "default_watch_list_dir")]
    pub watch_list_dir: PathBuf,
    #[serde(default = "default_transferred_data_dir")]
    pub transferred_data_dir: PathBuf,

    // Radio
    #[serde(default = "default_service_uuid")]
    pub uart_service_uuid: String,
    #[serde(default = "default_tx_uuid")]
    pub tx_char_uuid: String,
    #[serde(default = "default_rx_uuid")]
    pub rx_char_uuid: String,
    #[serde(default = "default_name_prefixes")]
    pub name_prefixes: Vec<String>,
    #[serde(default = "default_true")]
    pub allow_new_devices: bool,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    // Timing (ms)
    #[serde(default = "default_presence_timeout_ms")]
    pub presence_timeout_ms: u64,
    #[serde(default = "default_batch_step_ms")]
    pub batch_step_ms: u64,
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    #[serde(default = "default_event_quiet_period_ms")]
    pub event_quiet_period_ms: u64,
    #[serde(default = "default_stream_stop_delay_ms")]
    pub stream_stop_delay_ms: u64,
    /// 0 disables the idle timeout
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,

    // Clock sync
    #[serde(default = "default_sync_trials")]
    pub sync_trials: usize,
    #[serde(default = "default_start_offset_ms")]
    pub start_offset_ms: f64,
    #[serde(default = "default_trial_average")]
    pub trial_average: usize,
    #[serde(default = "default_device_delay_ms")]
    pub device_delay_ms: f64,

    // Dashboard bridge
    #[serde(default = "default_dashboard_socket")]
    pub dashboard_socket: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_settings: LogSettings::default(),
            watch_list_dir: default_watch_list_dir(),
            transferred_data_dir: default_transferred_data_dir(),
            uart_service_uuid: default_service_uuid(),
            tx_char_uuid: default_tx_uuid(),
            rx_char_uuid: default_rx_uuid(),
            name_prefixes: default_name_prefixes(),
            allow_new_devices: true,
            chunk_size: default_chunk_size(),
            presence_timeout_ms: default_presence_timeout_ms(),
            batch_step_ms: default_batch_step_ms(),
            settle_delay_ms: default_settle_delay_ms(),
            event_quiet_period_ms: default_event_quiet_period_ms(),
            stream_stop_delay_ms: default_stream_stop_delay_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
            sync_trials: default_sync_trials(),
            start_offset_ms: default_start_offset_ms(),
            trial_average: default_trial_average(),
            device_delay_ms: default_device_delay_ms(),
            dashboard_socket: default_dashboard_socket(),
        }
    }
}

impl Settings {
    pub fn clock_sync(&self) -> ClockSyncParams {
        ClockSyncParams {
            trials: self.sync_trials,
            start_offset_ms: self.start_offset_ms,
            trial_average: self.trial_average,
            device_delay_ms: self.device_delay_ms,
        }
    }

    pub fn presence_timeout(&self) -> Duration {
        Duration::from_millis(self.presence_timeout_ms)
    }

    pub fn batch_step(&self) -> Duration {
        Duration::from_millis(self.batch_step_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn event_quiet_period(&self) -> Duration {
        Duration::from_millis(self.event_quiet_period_ms)
    }

    pub fn stream_stop_delay(&self) -> Duration {
        Duration::from_millis(self.stream_stop_delay_ms)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_ms > 0).then(|| Duration::from_millis(self.idle_timeout_ms))
    }
}

fn default_watch_list_dir() -> PathBuf {
    PathBuf::from("watch_list")
}
fn default_transferred_data_dir() -> PathBuf {
    PathBuf::from("transferred_data")
}
fn default_service_uuid() -> String {
    "6e400001-b5a3-f393-e0a9-e50e24dcca9e".to_string()
}
fn default_tx_uuid() -> String {
    "6e400002-b5a3-f393-e0a9-e50e24dcca9e".to_string()
}
fn default_rx_uuid() -> String {
    "6e400003-b5a3-f393-e0a9-e50e24dcca9e".to_string()
}
fn default_name_prefixes() -> Vec<String> {
    vec!["Bangle.js".to_string(), "BEATLab".to_string()]
}
fn default_chunk_size() -> usize {
    20
}
fn default_presence_timeout_ms() -> u64 {
    10_000
}
fn default_batch_step_ms() -> u64 {
    50
}
fn default_settle_delay_ms() -> u64 {
    300
}
fn default_event_quiet_period_ms() -> u64 {
    1_000
}
fn default_stream_stop_delay_ms() -> u64 {
    300
}
fn default_idle_timeout_ms() -> u64 {
    30_000
}
fn default_sync_trials() -> usize {
    15
}
fn default_start_offset_ms() -> f64 {
    100.0
}
fn default_trial_average() -> usize {
    5
}
fn default_device_delay_ms() -> f64 {
    5.0
}
fn default_dashboard_socket() -> String {
    "wearable_fleet.sock".to_string()
}

pub struct SettingsService {
    settings: Settings,
    settings_path: Option<PathBuf>,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        let settings = match Self::load_from_file(&settings_path) {
            Ok(settings) => settings,
            Err(e) => {
                warn!(path = %settings_path.display(), "Using default settings: {:#}", e);
                Settings::default()
            }
        };

        Ok(Self {
            settings,
            settings_path: Some(settings_path),
        })
    }

    /// Settings that are never written back to disk.
    pub fn in_memory(settings: Settings) -> Self {
        Self {
            settings,
            settings_path: None,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("WearableFleet");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let Some(path) = &self.settings_path else {
            return Ok(());
        };
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_fills_defaults() {
        let settings: Settings =
            serde_json::from_str(r#"{"allow_new_devices": false, "sync_trials": 20}"#).unwrap();
        assert!(!settings.allow_new_devices);
        assert_eq!(settings.sync_trials, 20);
        assert_eq!(settings.presence_timeout_ms, 10_000);
        assert_eq!(settings.chunk_size, 20);
        assert_eq!(settings.log_settings.file_name_prefix, "wearable_fleet");
        assert_eq!(settings.clock_sync().trial_average, 5);
    }

    #[test]
    fn test_zero_idle_timeout_disables() {
        let settings = Settings {
            idle_timeout_ms: 0,
            ..Settings::default()
        };
        assert_eq!(settings.idle_timeout(), None);
        assert_eq!(
            Settings::default().idle_timeout(),
            Some(Duration::from_secs(30))
        );
    }

    #[test]
    fn test_in_memory_save_is_noop() {
        let mut service = SettingsService::in_memory(Settings::default());
        service.get_mut().batch_step_ms = 100;
        service.save().unwrap();
        assert_eq!(service.get().batch_step(), Duration::from_millis(100));
    }
}
