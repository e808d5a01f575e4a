use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::domain::clock_sync::ClockSyncResult;

/// Operational state reported by a device, either through its advertisement
/// or through a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OperationalState {
    #[default]
    Unknown,
    Waiting,
    Recording,
    Sending,
}

impl OperationalState {
    /// Map the advertised state code onto the closed state set.
    /// Anything unrecognized is `Unknown`.
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => Self::Waiting,
            1 => Self::Recording,
            2 => Self::Sending,
            _ => Self::Unknown,
        }
    }
}

/// Short code assigned to a device by a human (loaded onto the watch app).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ShortCode {
    #[default]
    Unknown,
    /// The device answered the identity query with an error marker
    NotAvailable,
    Assigned(String),
}

impl ShortCode {
    pub fn assigned(&self) -> Option<&str> {
        match self {
            Self::Assigned(code) => Some(code),
            _ => None,
        }
    }

    /// Inverse of `Display`, used when reading the persisted device list.
    pub fn parse(value: &str) -> Self {
        match value {
            "" | "Unknown" => Self::Unknown,
            "N/A" => Self::NotAvailable,
            code => Self::Assigned(code.to_string()),
        }
    }
}

impl fmt::Display for ShortCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => f.write_str("Unknown"),
            Self::NotAvailable => f.write_str("N/A"),
            Self::Assigned(code) => f.write_str(code),
        }
    }
}

impl Serialize for ShortCode {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Whether the device was recently sighted in an advertisement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(tag = "presence", content = "rssi", rename_all = "camelCase")]
pub enum Presence {
    #[default]
    Unknown,
    Nearby(i16),
}

/// Connection session lifecycle.
///
/// ```text
/// Idle → Connecting → DiscoveringServices → Subscribed → Active → Closing → Idle
///             └──────────────┴──→ Failed → Idle
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum SessionState {
    #[default]
    Idle,
    Connecting,
    DiscoveringServices,
    Subscribed,
    Active,
    Closing,
    Failed,
}

impl SessionState {
    /// A physical link exists in this state.
    pub fn is_connected(self) -> bool {
        matches!(
            self,
            Self::DiscoveringServices | Self::Subscribed | Self::Active | Self::Closing
        )
    }
}

/// One file held in device storage. Sizes are only known once the file has
/// been matched against a transferred local copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StorageEntry {
    pub name: String,
    pub size: Option<u64>,
}

impl StorageEntry {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            size: None,
        }
    }
}

/// An advertisement sighting delivered by the scanner.
#[derive(Debug, Clone, PartialEq)]
pub struct Sighting {
    /// Local name broadcast by the device (its wire identity)
    pub name: String,
    pub rssi: Option<i16>,
    /// State code decoded from manufacturer data, if present
    pub state_code: Option<i64>,
}

/// One decoded 19-byte live telemetry record.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetrySample {
    pub dt: f64,
    pub hrm_bpm: u8,
    pub hrm_conf: u8,
    pub hrm_raw: i16,
    pub hrm_filt: i16,
    pub acc_x: i8,
    pub acc_y: i8,
    pub acc_z: i8,
    pub acc_diff: u8,
    pub acc_mag: u8,
}

/// Full-info snapshot of one device, as shown on the dashboard.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSnapshot {
    pub device_id: String,
    pub watch_name: ShortCode,
    pub state: OperationalState,
    pub nearby: Presence,
    pub connected: bool,
    pub storage: Vec<String>,
    pub time_sync_accuracy: Option<f64>,
    pub progress: String,
}

/// A single dashboard field update.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "component", content = "value", rename_all = "camelCase")]
pub enum InfoField {
    Storage(Vec<String>),
    Progress(String),
    WatchName(ShortCode),
    Nearby(Presence),
    State(OperationalState),
    Connected(bool),
    TimeSync(Option<f64>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MessageSeverity {
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusMessage {
    pub message: String,
    pub severity: MessageSeverity,
}

/// Events emitted upward to the dashboard collaborator. Per-device ordering
/// is the order in which the fleet registry produced them.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum FleetEvent {
    DeviceCreated {
        device: String,
    },
    InfoAll(DeviceSnapshot),
    InfoSingle {
        device: String,
        field: InfoField,
    },
    LiveSample {
        device: String,
        sample: TelemetrySample,
    },
    Message {
        device: String,
        message: StatusMessage,
    },
}

impl FleetEvent {
    pub fn device(&self) -> &str {
        match self {
            Self::DeviceCreated { device }
            | Self::InfoSingle { device, .. }
            | Self::LiveSample { device, .. }
            | Self::Message { device, .. } => device,
            Self::InfoAll(snapshot) => &snapshot.device_id,
        }
    }
}

/// Which devices a downward command applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceTarget {
    All,
    One(String),
}

impl From<&str> for DeviceTarget {
    fn from(value: &str) -> Self {
        if value == "all" {
            Self::All
        } else {
            Self::One(value.to_string())
        }
    }
}

/// Named operations the dashboard can request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FleetCommand {
    GetName,
    GetStorageList,
    GetFile(String),
    RecordStart,
    RecordStop,
    StreamStart,
    StreamStop,
    Sync,
    GetDrift,
    SendCommand(String),
    Reconnect,
    VerifyFiles,
    Disconnect,
}

impl FleetCommand {
    /// Build a command from its wire name and optional argument.
    pub fn from_wire(cmd: &str, msg: Option<&str>) -> Result<Self, String> {
        let required = |name: &str| {
            msg.filter(|m| !m.is_empty())
                .map(str::to_string)
                .ok_or_else(|| format!("command '{}' requires a message", name))
        };
        Ok(match cmd {
            "getName" => Self::GetName,
            "getStorageList" => Self::GetStorageList,
            "getFiles" => Self::GetFile(required(cmd)?),
            "recordStart" => Self::RecordStart,
            "recordStop" => Self::RecordStop,
            "streamStart" => Self::StreamStart,
            "streamStop" => Self::StreamStop,
            "sync" => Self::Sync,
            "getDrift" => Self::GetDrift,
            "sendCommand" => Self::SendCommand(required(cmd)?),
            "reconnect" => Self::Reconnect,
            "verifyFiles" => Self::VerifyFiles,
            "disconnect" => Self::Disconnect,
            other => return Err(format!("unknown command '{}'", other)),
        })
    }
}

/// Persisted device list record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedDevice {
    #[serde(rename = "deviceId")]
    pub device_id: String,
    #[serde(rename = "watchName", default = "unknown")]
    pub watch_name: String,
    #[serde(rename = "MACid", default = "unknown")]
    pub mac_id: String,
    #[serde(rename = "serialNumber", default = "unknown")]
    pub serial_number: String,
}

fn unknown() -> String {
    "Unknown".to_string()
}

/// A file reconstructed from a transfer, ready to be flushed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferredFile {
    pub name: String,
    /// The header line carrying the remote name and metadata
    pub header: Option<String>,
    pub lines: Vec<String>,
}

/// A file already present in the transferred-data directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFile {
    pub name: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMatch {
    pub remote: String,
    pub local: Option<LocalFile>,
}

/// Result of a completed command.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandReport {
    Identity(ShortCode),
    Storage(Vec<String>),
    /// Device refused the command while recording; carries its reply
    Busy(String),
    FileTransferred {
        name: String,
        lines: usize,
        path: Option<PathBuf>,
    },
    TimeSynced(ClockSyncResult),
    Drift {
        residual_ms: f64,
    },
    Acknowledged {
        replies: Vec<String>,
    },
    Streamed {
        samples: usize,
    },
    StreamStopping,
    Reconnecting,
    Disconnected,
    Verification(Vec<FileMatch>),
}
