//! Command handlers
//!
//! Each handler supplies the opening command of an exchange and decides,
//! line by line, when the exchange is complete. Handlers never touch the
//! link directly; they answer with a [`HandlerStep`] and the session acts
//! on it.

use crate::domain::clock_sync::{round_trip_residual, ClockSyncEstimator, ClockSyncParams, SyncPhase};
use crate::domain::file_transfer::FileAccumulator;
use crate::domain::fleet::DeviceReporter;
use crate::domain::models::{CommandReport, ShortCode};
use crate::domain::ports::FileSink;
use crate::infrastructure::bluetooth::protocol::{
    classify_transfer_line, decode_telemetry, markers, parse_device_time, TransferLine, WireCommand,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum HandlerStep {
    Continue,
    /// Write another command and keep going
    Send(String),
    /// Exchange complete; close the session
    Done,
}

pub trait CommandHandler: Send {
    /// Command written once the session is active. `now_ms` is server time.
    fn opening(&mut self, now_ms: f64) -> String;

    fn on_line(&mut self, line: &str, now_ms: f64) -> HandlerStep;

    /// Complete the exchange after this long without a notification.
    fn quiet_period(&self) -> Option<Duration> {
        None
    }

    /// A requested close counts as completion rather than cancellation.
    fn completes_on_close(&self) -> bool {
        false
    }

    /// Result of a completed exchange.
    fn report(&mut self) -> Option<CommandReport>;
}

/// `sendWatchId()`: one line carrying the short code.
#[derive(Debug, Default)]
pub struct IdentityQuery {
    code: Option<ShortCode>,
}

impl IdentityQuery {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CommandHandler for IdentityQuery {
    fn opening(&mut self, _now_ms: f64) -> String {
        WireCommand::WatchId.text()
    }

    fn on_line(&mut self, line: &str, _now_ms: f64) -> HandlerStep {
        let code = if line.starts_with(markers::INFO) {
            ShortCode::NotAvailable
        } else {
            ShortCode::Assigned(line.trim().to_string())
        };
        debug!(code = %code, "Identity reply");
        self.code = Some(code);
        HandlerStep::Done
    }

    fn report(&mut self) -> Option<CommandReport> {
        self.code.take().map(CommandReport::Identity)
    }
}

/// `sendStorage()`: one comma separated line of storage names.
#[derive(Debug, Default)]
pub struct StorageListing {
    report: Option<CommandReport>,
}

impl StorageListing {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CommandHandler for StorageListing {
    fn opening(&mut self, _now_ms: f64) -> String {
        WireCommand::Storage.text()
    }

    fn on_line(&mut self, line: &str, _now_ms: f64) -> HandlerStep {
        let line = line.replace('\x01', "");
        self.report = Some(if line.contains(markers::INFO) {
            CommandReport::Busy(line)
        } else {
            CommandReport::Storage(
                line.split(',')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(str::to_string)
                    .collect(),
            )
        });
        HandlerStep::Done
    }

    fn report(&mut self) -> Option<CommandReport> {
        self.report.take()
    }
}

/// `sendData('<name>')`: streams one storage file until the EOF marker.
pub struct FileTransfer {
    remote_name: String,
    accumulator: FileAccumulator,
    device_code: Option<String>,
    current_year: u32,
    sink: Arc<dyn FileSink>,
    reporter: DeviceReporter,
    flushed: Option<(String, usize, Option<PathBuf>)>,
    busy: Option<String>,
}

impl FileTransfer {
    pub fn new(
        remote_name: impl Into<String>,
        reporter: DeviceReporter,
        sink: Arc<dyn FileSink>,
        now_ms: f64,
        current_year: u32,
    ) -> Self {
        Self {
            remote_name: remote_name.into(),
            accumulator: FileAccumulator::new(format!("{}.csv", now_ms as i64)),
            device_code: reporter.code(),
            current_year,
            sink,
            reporter,
            flushed: None,
            busy: None,
        }
    }

    fn flush(&mut self) {
        let Some(file) = self.accumulator.finish() else {
            return;
        };
        let path = match self.sink.write_file(&file) {
            Ok(path) => {
                info!(device = %self.reporter.device(), file = %file.name, lines = file.lines.len(), "File transferred");
                Some(path)
            }
            Err(e) => {
                error!(device = %self.reporter.device(), file = %file.name, "Failed to write transferred file: {:#}", e);
                None
            }
        };
        self.flushed = Some((file.name, file.lines.len(), path));
    }
}

impl CommandHandler for FileTransfer {
    fn opening(&mut self, _now_ms: f64) -> String {
        WireCommand::SendData(self.remote_name.clone()).text()
    }

    fn on_line(&mut self, line: &str, _now_ms: f64) -> HandlerStep {
        match classify_transfer_line(line) {
            TransferLine::Eof => {
                self.reporter.progress(line, true);
                self.flush();
                HandlerStep::Done
            }
            TransferLine::Busy => {
                warn!(device = %self.reporter.device(), file = %self.remote_name, "Transfer refused: {}", line);
                self.busy = Some(line.to_string());
                HandlerStep::Done
            }
            TransferLine::Progress => {
                self.reporter.progress(line, true);
                HandlerStep::Continue
            }
            TransferLine::SendingFile => {
                self.reporter.progress(line, false);
                HandlerStep::Continue
            }
            TransferLine::Header => {
                self.accumulator
                    .set_header(line, self.device_code.as_deref(), self.current_year);
                debug!(device = %self.reporter.device(), file = %self.accumulator.name(), "Transfer header");
                HandlerStep::Continue
            }
            TransferLine::Payload => {
                self.accumulator.push(line);
                HandlerStep::Continue
            }
        }
    }

    fn report(&mut self) -> Option<CommandReport> {
        if let Some(reply) = self.busy.take() {
            return Some(CommandReport::Busy(reply));
        }
        self.flushed
            .take()
            .map(|(name, lines, path)| CommandReport::FileTransferred { name, lines, path })
    }
}

/// Iterative clock synchronization, see [`ClockSyncEstimator`].
pub struct ClockSync {
    estimator: ClockSyncEstimator,
    device: String,
}

impl ClockSync {
    pub fn new(params: ClockSyncParams, device: impl Into<String>) -> Self {
        Self {
            estimator: ClockSyncEstimator::new(params),
            device: device.into(),
        }
    }

    fn next_write(&mut self, now_ms: f64) -> String {
        WireCommand::SyncTime(self.estimator.begin(now_ms) / 1000.0).text()
    }
}

impl CommandHandler for ClockSync {
    fn opening(&mut self, now_ms: f64) -> String {
        WireCommand::SetTime(self.estimator.begin(now_ms) / 1000.0).text()
    }

    fn on_line(&mut self, line: &str, now_ms: f64) -> HandlerStep {
        if self.estimator.phase() == SyncPhase::Finished {
            return HandlerStep::Done;
        }
        let Some(device_time) = parse_device_time(line) else {
            debug!(device = %self.device, line, "Ignoring non-time reply during sync");
            return HandlerStep::Continue;
        };
        if self.estimator.record_reply(now_ms, device_time).is_none() {
            return HandlerStep::Continue;
        }

        match self.estimator.phase() {
            SyncPhase::Finished => {
                if let Some(result) = self.estimator.result() {
                    info!(
                        device = %self.device,
                        offset_ms = result.offset_ms,
                        accuracy_ms = result.accuracy_ms,
                        "Time sync converged"
                    );
                    match serde_json::to_string(&result) {
                        Ok(log) => info!(device = %self.device, trials = %log, "Time sync trial log"),
                        Err(e) => warn!("Could not serialize trial log: {}", e),
                    }
                }
                HandlerStep::Send(WireCommand::SyncDone.text())
            }
            _ => HandlerStep::Send(self.next_write(now_ms)),
        }
    }

    fn report(&mut self) -> Option<CommandReport> {
        self.estimator.result().map(CommandReport::TimeSynced)
    }
}

/// Re-sends the converged offset once and reports the fresh residual.
pub struct DriftCheck {
    offset_ms: f64,
    device_delay_ms: f64,
    time_start_ms: f64,
    device: String,
    residual_ms: Option<f64>,
}

impl DriftCheck {
    pub fn new(offset_ms: f64, device_delay_ms: f64, device: impl Into<String>) -> Self {
        Self {
            offset_ms,
            device_delay_ms,
            time_start_ms: 0.0,
            device: device.into(),
            residual_ms: None,
        }
    }
}

impl CommandHandler for DriftCheck {
    fn opening(&mut self, now_ms: f64) -> String {
        self.time_start_ms = now_ms;
        WireCommand::Drift((now_ms + self.offset_ms) / 1000.0).text()
    }

    fn on_line(&mut self, line: &str, now_ms: f64) -> HandlerStep {
        let Some(device_time) = parse_device_time(line) else {
            return HandlerStep::Continue;
        };
        let (round_trip, residual) =
            round_trip_residual(self.time_start_ms, now_ms, device_time, self.device_delay_ms);
        info!(
            device = %self.device,
            offset_ms = self.offset_ms,
            round_trip_ms = round_trip,
            residual_ms = residual,
            "Drift estimate"
        );
        self.residual_ms = Some(residual);
        HandlerStep::Done
    }

    fn report(&mut self) -> Option<CommandReport> {
        self.residual_ms
            .map(|residual_ms| CommandReport::Drift { residual_ms })
    }
}

/// Commands with no protocol acknowledgment. The exchange ends on the
/// first reply line when `close_on_first_line` is set, otherwise after
/// the quiet period. Best effort only.
pub struct SimpleCommand {
    text: String,
    close_on_first_line: bool,
    quiet: Duration,
    replies: Vec<String>,
}

impl SimpleCommand {
    pub fn new(text: impl Into<String>, close_on_first_line: bool, quiet: Duration) -> Self {
        Self {
            text: text.into(),
            close_on_first_line,
            quiet,
            replies: Vec::new(),
        }
    }
}

impl CommandHandler for SimpleCommand {
    fn opening(&mut self, _now_ms: f64) -> String {
        self.text.clone()
    }

    fn on_line(&mut self, line: &str, _now_ms: f64) -> HandlerStep {
        self.replies.push(line.to_string());
        if self.close_on_first_line {
            HandlerStep::Done
        } else {
            HandlerStep::Continue
        }
    }

    fn quiet_period(&self) -> Option<Duration> {
        Some(self.quiet)
    }

    fn completes_on_close(&self) -> bool {
        true
    }

    fn report(&mut self) -> Option<CommandReport> {
        Some(CommandReport::Acknowledged {
            replies: std::mem::take(&mut self.replies),
        })
    }
}

/// Live telemetry: runs until the session is closed from outside.
pub struct Streaming {
    reporter: DeviceReporter,
    samples: usize,
}

impl Streaming {
    pub fn new(reporter: DeviceReporter) -> Self {
        Self {
            reporter,
            samples: 0,
        }
    }
}

impl CommandHandler for Streaming {
    fn opening(&mut self, _now_ms: f64) -> String {
        WireCommand::StreamStart.text()
    }

    fn on_line(&mut self, line: &str, _now_ms: f64) -> HandlerStep {
        if let Some(sample) = decode_telemetry(line) {
            self.samples += 1;
            self.reporter
                .progress(&format!("Streaming: {}", sample.hrm_bpm), true);
            self.reporter.live_sample(sample);
        }
        HandlerStep::Continue
    }

    fn completes_on_close(&self) -> bool {
        true
    }

    fn report(&mut self) -> Option<CommandReport> {
        Some(CommandReport::Streamed {
            samples: self.samples,
        })
    }
}
