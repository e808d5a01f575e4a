//! Transferred file reconstruction
//!
//! Devices name their storage files after the record start time. Two
//! conventions exist in the field:
//!
//! ```text
//! new: [YY-]MM-DDTHH:MM:SS_NNNN_WCCC     (WCCC = device short code)
//! old: [YY-]MM-DDTHH:MM:SS_NNNN.csv
//! ```
//!
//! Both map to the local name `YYYY-MM-DD_time_HH-MM-SS_NNNN_<code>.csv`.

use crate::domain::models::{FileMatch, LocalFile, TransferredFile};

const NAME_KEY: &str = "\"Name\":\"";

/// Remote file name broken into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFileName {
    pub year: Option<u32>,
    pub month: String,
    pub day: String,
    pub hour: String,
    pub minute: String,
    pub second: String,
    pub serial: String,
    /// Short code embedded by the new convention
    pub code: Option<String>,
}

impl RemoteFileName {
    /// Parse a device storage name in either convention. Trailing text after
    /// the recognized prefix is ignored.
    pub fn parse(name: &str) -> Option<Self> {
        let (date, rest) = name.split_once('T')?;
        let date_parts: Vec<&str> = date.split('-').collect();
        let (year, month, day) = match date_parts.as_slice() {
            [y, m, d] if is_digits(y, 2) => (y.parse().ok().map(|y: u32| 2000 + y), *m, *d),
            [m, d] => (None, *m, *d),
            _ => return None,
        };
        if !is_digits(month, 2) || !is_digits(day, 2) {
            return None;
        }

        let time = rest.get(0..8)?;
        let mut fields = time.split(':');
        let (hour, minute, second) = (fields.next()?, fields.next()?, fields.next()?);
        if ![hour, minute, second].iter().all(|f| is_digits(f, 2)) {
            return None;
        }

        if rest.get(8..9)? != "_" {
            return None;
        }
        let serial = rest.get(9..13)?;
        let tail = rest.get(13..)?;

        let code = if let Some(code) = tail.strip_prefix("_W") {
            Some(format!("W{}", code.get(0..3)?))
        } else if tail.starts_with(".csv") {
            None
        } else {
            return None;
        };

        Some(Self {
            year,
            month: month.to_string(),
            day: day.to_string(),
            hour: hour.to_string(),
            minute: minute.to_string(),
            second: second.to_string(),
            serial: serial.to_string(),
            code,
        })
    }

    /// Local file name. `device_code` is used when the name itself carries
    /// no code; `current_year` fills a missing year.
    pub fn local_name(&self, device_code: Option<&str>, current_year: u32) -> String {
        let code = self.code.as_deref().or(device_code);
        format!(
            "{:04}-{}-{}_time_{}-{}-{}_{}{}.csv",
            self.year.unwrap_or(current_year),
            self.month,
            self.day,
            self.hour,
            self.minute,
            self.second,
            self.serial,
            code.map(|c| format!("_{}", c)).unwrap_or_default()
        )
    }
}

fn is_digits(s: &str, len: usize) -> bool {
    s.len() == len && s.bytes().all(|b| b.is_ascii_digit())
}

/// Extract the remote file name from a `{"File":{"Name":"..."}}` header.
pub fn header_file_name(header: &str) -> Option<&str> {
    let start = header.find(NAME_KEY)? + NAME_KEY.len();
    let len = header[start..].find('"')?;
    Some(&header[start..start + len])
}

/// Accumulates the lines of one transfer until EOF, then yields the file
/// exactly once.
#[derive(Debug)]
pub struct FileAccumulator {
    name: String,
    header: Option<String>,
    lines: Vec<String>,
    flushed: bool,
}

impl FileAccumulator {
    /// `fallback_name` is used until a header names the file.
    pub fn new(fallback_name: impl Into<String>) -> Self {
        Self {
            name: fallback_name.into(),
            header: None,
            lines: Vec::new(),
            flushed: false,
        }
    }

    /// Record the header line and, when it parses, the local name.
    pub fn set_header(&mut self, header: &str, device_code: Option<&str>, current_year: u32) {
        if let Some(remote) = header_file_name(header).and_then(RemoteFileName::parse) {
            self.name = remote.local_name(device_code, current_year);
        }
        self.header = Some(header.to_string());
    }

    pub fn push(&mut self, line: &str) {
        if !self.flushed {
            self.lines.push(line.to_string());
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Take the completed file. Returns `None` on every call after the first.
    pub fn finish(&mut self) -> Option<TransferredFile> {
        if self.flushed {
            return None;
        }
        self.flushed = true;
        Some(TransferredFile {
            name: self.name.clone(),
            header: self.header.take(),
            lines: std::mem::take(&mut self.lines),
        })
    }
}

/// Match device storage names against transferred local files by their
/// derived local name.
pub fn match_storage_files(
    remote_names: &[String],
    device_code: Option<&str>,
    current_year: u32,
    local_files: &[LocalFile],
) -> Vec<FileMatch> {
    remote_names
        .iter()
        .map(|remote| {
            let local = RemoteFileName::parse(remote)
                .map(|parsed| parsed.local_name(device_code, current_year))
                .and_then(|name| local_files.iter().find(|f| f.name == name).cloned());
            FileMatch {
                remote: remote.clone(),
                local,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_convention_with_year() {
        let remote = RemoteFileName::parse("24-06-01T10:00:00_0000_W001").unwrap();
        assert_eq!(remote.code.as_deref(), Some("W001"));
        assert_eq!(
            remote.local_name(Some("W999"), 2030),
            "2024-06-01_time_10-00-00_0000_W001.csv"
        );
    }

    #[test]
    fn test_new_convention_without_year() {
        let remote = RemoteFileName::parse("06-01T10:00:00_0042_W017HR").unwrap();
        assert_eq!(
            remote.local_name(None, 2025),
            "2025-06-01_time_10-00-00_0042_W017.csv"
        );
    }

    #[test]
    fn test_old_convention_uses_device_code() {
        let remote = RemoteFileName::parse("06-01T10:00:00_0003.csv").unwrap();
        assert_eq!(remote.code, None);
        assert_eq!(
            remote.local_name(Some("W004"), 2024),
            "2024-06-01_time_10-00-00_0003_W004.csv"
        );
        assert_eq!(
            remote.local_name(None, 2024),
            "2024-06-01_time_10-00-00_0003.csv"
        );
    }

    #[test]
    fn test_rejects_other_names() {
        assert!(RemoteFileName::parse("physicalID.json").is_none());
        assert!(RemoteFileName::parse("06-01T10:00_0003.csv").is_none());
        assert!(RemoteFileName::parse("06-01T10:00:00_0003.txt").is_none());
        assert!(RemoteFileName::parse("2024-06-01T10:00:00_0003.csv").is_none());
    }

    #[test]
    fn test_header_file_name() {
        let header = r#"{"File":{"Name":"24-06-01T10:00:00_0000_W001","Version":2}}"#;
        assert_eq!(header_file_name(header), Some("24-06-01T10:00:00_0000_W001"));
        assert_eq!(header_file_name(r#"{"File":{}}"#), None);
    }

    #[test]
    fn test_accumulator_flushes_once() {
        let mut acc = FileAccumulator::new("1717236000000.csv");
        acc.set_header(
            r#"{"File":{"Name":"24-06-01T10:00:00_0000_W001"}}"#,
            None,
            2024,
        );
        acc.push("1,2,3");
        acc.push("4,5,6");

        let file = acc.finish().unwrap();
        assert_eq!(file.name, "2024-06-01_time_10-00-00_0000_W001.csv");
        assert_eq!(file.lines, vec!["1,2,3", "4,5,6"]);
        assert!(file.header.is_some());

        acc.push("7,8,9");
        assert!(acc.finish().is_none());
    }

    #[test]
    fn test_match_storage_files() {
        let local = vec![LocalFile {
            name: "2024-06-01_time_10-00-00_0000_W001.csv".to_string(),
            size: 2048,
        }];
        let remote = vec![
            "06-01T10:00:00_0000_W001".to_string(),
            "06-02T09:00:00_0001_W001".to_string(),
        ];
        let matches = match_storage_files(&remote, Some("W001"), 2024, &local);
        assert_eq!(matches[0].local.as_ref().map(|f| f.size), Some(2048));
        assert!(matches[1].local.is_none());
    }

    #[test]
    fn test_unparsed_header_keeps_fallback_name() {
        let mut acc = FileAccumulator::new("1717236000000.csv");
        acc.set_header(r#"{"File":{"Name":"physicalID.json"}}"#, None, 2024);
        assert_eq!(acc.name(), "1717236000000.csv");
    }
}
