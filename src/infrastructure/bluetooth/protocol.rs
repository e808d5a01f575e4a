//! Wearable UART Protocol
//!
//! Wire contract of the watch app over the Nordic UART service: control
//! prefixed text commands out, CRLF terminated text lines back.

use crate::domain::models::TelemetrySample;
use std::collections::HashMap;
use uuid::Uuid;

/// Nordic UART service
pub const UART_SERVICE_UUID: Uuid = Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);

/// Write characteristic (host → device)
pub const TX_CHAR_UUID: Uuid = Uuid::from_u128(0x6e400002_b5a3_f393_e0a9_e50e24dcca9e);

/// Notify characteristic (device → host)
pub const RX_CHAR_UUID: Uuid = Uuid::from_u128(0x6e400003_b5a3_f393_e0a9_e50e24dcca9e);

/// Ctrl-C clears a partially typed line, DLE suppresses echo of the command.
pub const CONTROL_PREFIX: &str = "\x03\x10";

/// Minimum safe ATT payload
pub const CHUNK_SIZE: usize = 20;

pub const LINE_TERMINATOR: &str = "\r\n";

/// Manufacturer data key carrying the advertised state
pub const STATE_MANUFACTURER_ID: u16 = 0x0590;

/// Length of one live telemetry record
pub const TELEMETRY_LEN: usize = 19;

/// Marker substrings, in match priority order
pub mod markers {
    pub const EOF: &str = "[INFO] Reached EOF";
    pub const PROGRESS: &str = "[Progress]";
    pub const SENDING_FILE: &str = "[INFO] Sending file";
    pub const FILE_HEADER: &str = "{\"File\":";
    pub const INFO: &str = "[INFO]";
    pub const BUSY: &str = "[INFO] Watch is busy";
}

/// Named remote procedures of the watch app
#[derive(Debug, Clone, PartialEq)]
pub enum WireCommand {
    WatchId,
    Storage,
    SendData(String),
    RecordStart,
    RecordStop,
    StreamStart,
    StreamStop,
    /// First clock write, time in seconds
    SetTime(f64),
    /// Subsequent clock writes, time in seconds
    SyncTime(f64),
    SyncDone,
    Drift(f64),
    Raw(String),
}

impl WireCommand {
    pub fn text(&self) -> String {
        match self {
            Self::WatchId => "sendWatchId();".to_string(),
            Self::Storage => "if(1)sendStorage();".to_string(),
            Self::SendData(name) => format!("if(1)sendData('{}')", name),
            Self::RecordStart => "startRecord();".to_string(),
            Self::RecordStop => "stopRecord();".to_string(),
            Self::StreamStart => "startStreaming();".to_string(),
            Self::StreamStop => "stopStreaming();".to_string(),
            Self::SetTime(s) => format!("setTime('{}');print(getTime());", s),
            Self::SyncTime(s) => format!("if(1)syncTime('{}');", s),
            Self::SyncDone => "if(1)draw();print(\"Done\");".to_string(),
            Self::Drift(s) => format!("getDrift({});", s),
            Self::Raw(text) => text.clone(),
        }
    }
}

/// Frame a command for the wire: control prefix, text, newline.
///
/// The link carries 8-bit text; characters above U+00FF become `?`.
pub fn frame_command(text: &str) -> Vec<u8> {
    format!("{}{}\n", CONTROL_PREFIX, text)
        .chars()
        .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
        .collect()
}

/// Decode an inbound notification byte by byte.
pub fn decode_fragment(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| char::from(b)).collect()
}

/// Strip terminal artifacts from one response line: carriage returns,
/// prompt markers and a leading "clear to end of line" escape.
pub fn clean_line(line: &str) -> String {
    let line: String = line.chars().filter(|c| *c != '\r' && *c != '>').collect();
    line.strip_prefix("\x1b[J")
        .or_else(|| line.strip_prefix("[J"))
        .unwrap_or(&line)
        .to_string()
}

/// Meaning of one file transfer line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferLine {
    Eof,
    /// Device refused the transfer
    Busy,
    Progress,
    SendingFile,
    Header,
    Payload,
}

/// Classify a file transfer line. Markers are tested in fixed priority
/// order and the first match wins; unmatched lines are payload.
pub fn classify_transfer_line(line: &str) -> TransferLine {
    const PRIORITY: [(&str, TransferLine); 5] = [
        (markers::EOF, TransferLine::Eof),
        (markers::BUSY, TransferLine::Busy),
        (markers::PROGRESS, TransferLine::Progress),
        (markers::SENDING_FILE, TransferLine::SendingFile),
        (markers::FILE_HEADER, TransferLine::Header),
    ];
    PRIORITY
        .iter()
        .find(|(marker, _)| line.contains(marker))
        .map(|(_, kind)| *kind)
        .unwrap_or(TransferLine::Payload)
}

/// Parse one live telemetry line: 19 comma separated byte values.
///
/// # Record layout (big-endian)
///
/// ```text
/// [0-7]   : timestamp (f64)
/// [8]     : heart rate bpm (u8)
/// [9]     : heart rate confidence (u8)
/// [10-11] : raw signal (i16)
/// [12-13] : filtered signal (i16)
/// [14-16] : acceleration x/y/z (i8)
/// [17]    : acceleration magnitude difference (u8)
/// [18]    : acceleration magnitude (u8)
/// ```
pub fn decode_telemetry(line: &str) -> Option<TelemetrySample> {
    let bytes = line
        .split(',')
        .map(|v| v.trim().parse::<u8>().ok())
        .collect::<Option<Vec<u8>>>()?;
    let bytes: [u8; TELEMETRY_LEN] = bytes.try_into().ok()?;

    let mut dt = [0u8; 8];
    dt.copy_from_slice(&bytes[0..8]);

    Some(TelemetrySample {
        dt: f64::from_be_bytes(dt),
        hrm_bpm: bytes[8],
        hrm_conf: bytes[9],
        hrm_raw: i16::from_be_bytes([bytes[10], bytes[11]]),
        hrm_filt: i16::from_be_bytes([bytes[12], bytes[13]]),
        acc_x: bytes[14] as i8,
        acc_y: bytes[15] as i8,
        acc_z: bytes[16] as i8,
        acc_diff: bytes[17],
        acc_mag: bytes[18],
    })
}

/// State code carried in advertisement manufacturer data.
///
/// Current firmware sends `{"s":n}`; older firmware a single raw byte.
pub fn decode_advertised_state(manufacturer_data: &HashMap<u16, Vec<u8>>) -> Option<i64> {
    let data = manufacturer_data.get(&STATE_MANUFACTURER_ID)?;
    if let Ok(value) = serde_json::from_slice::<serde_json::Value>(data) {
        if let Some(state) = value.get("s").and_then(serde_json::Value::as_i64) {
            return Some(state);
        }
    }
    match data.as_slice() {
        [byte] => Some(i64::from(*byte)),
        _ => None,
    }
}

/// Device clock reply in seconds, converted to ms.
pub fn parse_device_time(line: &str) -> Option<f64> {
    line.trim()
        .parse::<f64>()
        .ok()
        .filter(|s| s.is_finite())
        .map(|s| s * 1000.0)
}

/// Parse a UUID from settings, falling back to the default on error.
pub fn parse_uuid(value: &str, default: Uuid) -> Uuid {
    Uuid::parse_str(value).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uart_uuids() {
        assert_eq!(
            UART_SERVICE_UUID.to_string(),
            "6e400001-b5a3-f393-e0a9-e50e24dcca9e"
        );
        assert_eq!(
            parse_uuid("6e400003-b5a3-f393-e0a9-e50e24dcca9e", TX_CHAR_UUID),
            RX_CHAR_UUID
        );
        assert_eq!(parse_uuid("not-a-uuid", TX_CHAR_UUID), TX_CHAR_UUID);
    }

    #[test]
    fn test_frame_command() {
        assert_eq!(frame_command("sendWatchId();"), b"\x03\x10sendWatchId();\n");
        assert_eq!(frame_command("print('é€')"), b"\x03\x10print('\xe9?')\n");
    }

    #[test]
    fn test_wire_command_text() {
        assert_eq!(
            WireCommand::SendData("06-01T10:00:00_0000_W001".into()).text(),
            "if(1)sendData('06-01T10:00:00_0000_W001')"
        );
        assert_eq!(
            WireCommand::SetTime(1717236000.1).text(),
            "setTime('1717236000.1');print(getTime());"
        );
        assert_eq!(WireCommand::SyncDone.text(), "if(1)draw();print(\"Done\");");
    }

    #[test]
    fn test_clean_line() {
        assert_eq!(clean_line("\x1b[JW001\r"), "W001");
        assert_eq!(clean_line("[JW001"), "W001");
        assert_eq!(clean_line(">1717236000.25"), "1717236000.25");
        assert_eq!(clean_line("1,2,[J3"), "1,2,[J3");
    }

    #[test]
    fn test_marker_priority() {
        assert_eq!(
            classify_transfer_line("[INFO] Reached EOF ... Done [1.2 s]"),
            TransferLine::Eof
        );
        // EOF outranks progress when both appear
        assert_eq!(
            classify_transfer_line("[Progress] 100% [INFO] Reached EOF"),
            TransferLine::Eof
        );
        assert_eq!(classify_transfer_line("[Progress] 42%"), TransferLine::Progress);
        assert_eq!(
            classify_transfer_line("[INFO] Sending file 06-01T10:00:00_0000_W001"),
            TransferLine::SendingFile
        );
        assert_eq!(
            classify_transfer_line(r#"{"File":{"Name":"x"}}"#),
            TransferLine::Header
        );
        assert_eq!(
            classify_transfer_line("[INFO] Watch is busy, cannot send data!"),
            TransferLine::Busy
        );
        assert_eq!(classify_transfer_line("START_RECORD"), TransferLine::Payload);
        assert_eq!(classify_transfer_line("1,2,3"), TransferLine::Payload);
    }

    #[test]
    fn test_decode_telemetry() {
        let mut bytes = 1.5f64.to_be_bytes().to_vec();
        bytes.extend_from_slice(&[72, 90, 0x01, 0x02, 0xff, 0xfe, 0xff, 2, 3, 4, 5]);
        let line = bytes
            .iter()
            .map(u8::to_string)
            .collect::<Vec<_>>()
            .join(",");

        let sample = decode_telemetry(&line).unwrap();
        assert_eq!(sample.dt, 1.5);
        assert_eq!(sample.hrm_bpm, 72);
        assert_eq!(sample.hrm_conf, 90);
        assert_eq!(sample.hrm_raw, 0x0102);
        assert_eq!(sample.hrm_filt, -2);
        assert_eq!(sample.acc_x, -1);
        assert_eq!(sample.acc_mag, 5);

        assert!(decode_telemetry("1,2,3").is_none());
        assert!(decode_telemetry(&format!("{},300", line)).is_none());
    }

    #[test]
    fn test_decode_advertised_state() {
        let mut data = HashMap::new();
        data.insert(STATE_MANUFACTURER_ID, br#"{"s":1}"#.to_vec());
        assert_eq!(decode_advertised_state(&data), Some(1));

        data.insert(STATE_MANUFACTURER_ID, vec![0]);
        assert_eq!(decode_advertised_state(&data), Some(0));

        data.insert(STATE_MANUFACTURER_ID, vec![1, 2, 3]);
        assert_eq!(decode_advertised_state(&data), None);

        assert_eq!(decode_advertised_state(&HashMap::new()), None);
    }

    #[test]
    fn test_parse_device_time() {
        assert_eq!(parse_device_time("1717236000.25"), Some(1_717_236_000_250.0));
        assert_eq!(parse_device_time("Done"), None);
    }
}
