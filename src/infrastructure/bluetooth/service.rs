//! Fleet Service Module
//!
//! Coordinates scanning, the fleet registry and per-device sessions. It is
//! the only owner of the scan state and the only place where sessions are
//! opened.

use crate::domain::error::SessionError;
use crate::domain::file_transfer::match_storage_files;
use crate::domain::fleet::{lock, DeviceReporter, FleetRegistry, SharedRegistry, SightingOutcome};
use crate::domain::models::{
    CommandReport, DeviceTarget, FleetCommand, FleetEvent, MessageSeverity, Sighting,
};
use crate::domain::ports::{DeviceStore, FileSink, ServerClock};
use crate::domain::settings::Settings;
use crate::infrastructure::bluetooth::handlers::{
    ClockSync, CommandHandler, DriftCheck, FileTransfer, IdentityQuery, SimpleCommand,
    StorageListing, Streaming,
};
use crate::infrastructure::bluetooth::protocol::WireCommand;
use crate::infrastructure::bluetooth::scanner::AdvertisementSource;
use crate::infrastructure::bluetooth::session::{Session, SessionConfig, SessionControl};
use crate::infrastructure::bluetooth::transport::Connector;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Collaborators the service talks to.
pub struct ServiceParts<C> {
    pub connector: C,
    pub scanner: Box<dyn AdvertisementSource>,
    pub store: Arc<dyn DeviceStore>,
    pub sink: Arc<dyn FileSink>,
    pub clock: Arc<dyn ServerClock>,
}

struct Inner<C> {
    connector: C,
    scanner: Box<dyn AdvertisementSource>,
    store: Arc<dyn DeviceStore>,
    sink: Arc<dyn FileSink>,
    clock: Arc<dyn ServerClock>,
    registry: SharedRegistry,
    settings: Settings,
    controls: Mutex<HashMap<String, mpsc::UnboundedSender<SessionControl>>>,
    presence_timers: Mutex<HashMap<String, JoinHandle<()>>>,
    sightings_task: Mutex<Option<JoinHandle<()>>>,
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Main service coordinating the fleet
pub struct FleetService<C: Connector> {
    inner: Arc<Inner<C>>,
}

impl<C: Connector> Clone for FleetService<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: Connector> FleetService<C> {
    pub fn new(
        settings: Settings,
        parts: ServiceParts<C>,
        events: mpsc::UnboundedSender<FleetEvent>,
    ) -> Self {
        let registry = FleetRegistry::new(
            settings.allow_new_devices,
            settings.name_prefixes.clone(),
            events,
        )
        .into_shared();
        Self {
            inner: Arc::new(Inner {
                connector: parts.connector,
                scanner: parts.scanner,
                store: parts.store,
                sink: parts.sink,
                clock: parts.clock,
                registry,
                settings,
                controls: Mutex::new(HashMap::new()),
                presence_timers: Mutex::new(HashMap::new()),
                sightings_task: Mutex::new(None),
            }),
        }
    }

    pub fn registry(&self) -> &SharedRegistry {
        &self.inner.registry
    }

    /// Recreate every device from the persisted list.
    pub fn restore_known(&self) -> anyhow::Result<usize> {
        let devices = self.inner.store.load_devices()?;
        let mut registry = lock(&self.inner.registry);
        for device in &devices {
            registry.restore(device);
        }
        info!(count = devices.len(), "Restored known devices");
        Ok(devices.len())
    }

    pub async fn start_scanning(&self) -> anyhow::Result<()> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Sighting>();
        self.inner.scanner.start(tx).await?;

        let service = self.clone();
        let task = tokio::spawn(async move {
            while let Some(sighting) = rx.recv().await {
                service.handle_sighting(sighting);
            }
        });
        if let Some(previous) = guard(&self.inner.sightings_task).replace(task) {
            previous.abort();
        }
        Ok(())
    }

    pub async fn stop_scanning(&self) -> anyhow::Result<()> {
        self.inner.scanner.stop().await?;
        if let Some(task) = guard(&self.inner.sightings_task).take() {
            task.abort();
        }
        Ok(())
    }

    pub fn is_scanning(&self) -> bool {
        self.inner.scanner.is_scanning()
    }

    /// Apply one advertisement sighting and re-arm the presence timer.
    pub fn handle_sighting(&self, sighting: Sighting) {
        let observation = lock(&self.inner.registry).observe(&sighting);
        let device = sighting.name;

        match observation.outcome {
            SightingOutcome::Ignored => return,
            SightingOutcome::Created => {
                self.persist(&device);
                self.spawn_identity_query(&device);
            }
            SightingOutcome::Unresolved => self.spawn_identity_query(&device),
            SightingOutcome::Refreshed => {}
        }

        let registry = self.inner.registry.clone();
        let timeout = self.inner.settings.presence_timeout();
        let name = device.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            lock(&registry).expire_presence(&name, observation.epoch);
        });
        if let Some(previous) = guard(&self.inner.presence_timers).insert(device, timer) {
            previous.abort();
        }
    }

    fn spawn_identity_query(&self, device: &str) {
        let service = self.clone();
        let device = device.to_string();
        tokio::spawn(async move {
            if service.execute(&device, FleetCommand::GetName).await.is_ok() {
                service.persist(&device);
            }
        });
    }

    fn persist(&self, device: &str) {
        let Some(record) = lock(&self.inner.registry).get(device).map(|r| r.persisted()) else {
            return;
        };
        if let Err(e) = self.inner.store.save_device(&record) {
            warn!(device = %device, "Failed to persist device: {:#}", e);
        }
    }

    /// Dispatch a command. For `All`, the device at position `i` starts
    /// after `i * batch_step` so connection attempts are spread out.
    pub fn dispatch(
        &self,
        target: DeviceTarget,
        command: FleetCommand,
    ) -> Vec<JoinHandle<Result<CommandReport, SessionError>>> {
        let devices = match target {
            DeviceTarget::All => lock(&self.inner.registry).device_ids(),
            DeviceTarget::One(device) => vec![device],
        };
        let step = self.inner.settings.batch_step();

        devices
            .into_iter()
            .enumerate()
            .map(|(position, device)| {
                let service = self.clone();
                let command = command.clone();
                let delay = step * position as u32;
                tokio::spawn(async move {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    service.execute(&device, command).await
                })
            })
            .collect()
    }

    /// Run one command against one device. Failures are logged with device
    /// context and surfaced as a status message; the outcome always resolves.
    pub async fn execute(
        &self,
        device: &str,
        command: FleetCommand,
    ) -> Result<CommandReport, SessionError> {
        debug!(device = %device, ?command, "Executing command");
        let result = self.run_command(device, command).await;
        match &result {
            Ok(report) => self.apply(device, report),
            Err(e) => {
                error!(device = %device, "Command failed: {}", e);
                lock(&self.inner.registry).message(device, &e.user_message(), MessageSeverity::Error);
            }
        }
        tokio::time::sleep(self.inner.settings.settle_delay()).await;
        result
    }

    fn control(&self, device: &str) -> Option<mpsc::UnboundedSender<SessionControl>> {
        guard(&self.inner.controls).get(device).cloned()
    }

    async fn run_command(
        &self,
        device: &str,
        command: FleetCommand,
    ) -> Result<CommandReport, SessionError> {
        let settings = &self.inner.settings;
        let reporter = DeviceReporter::new(self.inner.registry.clone(), device);

        let handler: Box<dyn CommandHandler> = match command {
            FleetCommand::Reconnect => {
                return if lock(&self.inner.registry).mark_unresolved(device) {
                    Ok(CommandReport::Reconnecting)
                } else {
                    Err(SessionError::UnknownDevice(device.to_string()))
                };
            }
            FleetCommand::Disconnect => {
                if let Some(control) = self.control(device) {
                    let _ = control.send(SessionControl::Close);
                }
                return Ok(CommandReport::Disconnected);
            }
            FleetCommand::StreamStop => {
                let control = self.control(device).ok_or(SessionError::NotConnected)?;
                control
                    .send(SessionControl::Write(WireCommand::StreamStop.text()))
                    .map_err(|_| SessionError::NotConnected)?;
                tokio::time::sleep(settings.stream_stop_delay()).await;
                let _ = control.send(SessionControl::Close);
                return Ok(CommandReport::StreamStopping);
            }
            FleetCommand::VerifyFiles => return self.verify_files(device).await,
            FleetCommand::GetDrift => {
                let offset = lock(&self.inner.registry)
                    .get(device)
                    .ok_or_else(|| SessionError::UnknownDevice(device.to_string()))?
                    .avg_offset_ms
                    .ok_or(SessionError::NotSynced)?;
                Box::new(DriftCheck::new(offset, settings.device_delay_ms, device))
            }
            FleetCommand::GetName => Box::new(IdentityQuery::new()),
            FleetCommand::GetStorageList => Box::new(StorageListing::new()),
            FleetCommand::GetFile(name) => Box::new(FileTransfer::new(
                name,
                reporter,
                self.inner.sink.clone(),
                self.inner.clock.now_ms(),
                self.inner.clock.current_year(),
            )),
            FleetCommand::RecordStart => Box::new(SimpleCommand::new(
                WireCommand::RecordStart.text(),
                true,
                settings.event_quiet_period(),
            )),
            FleetCommand::RecordStop => Box::new(SimpleCommand::new(
                WireCommand::RecordStop.text(),
                true,
                settings.event_quiet_period(),
            )),
            FleetCommand::SendCommand(text) => Box::new(SimpleCommand::new(
                WireCommand::Raw(text).text(),
                false,
                settings.event_quiet_period(),
            )),
            FleetCommand::StreamStart => Box::new(Streaming::new(reporter)),
            FleetCommand::Sync => Box::new(ClockSync::new(settings.clock_sync(), device)),
        };

        self.run_session(device, handler).await
    }

    async fn run_session(
        &self,
        device: &str,
        mut handler: Box<dyn CommandHandler>,
    ) -> Result<CommandReport, SessionError> {
        lock(&self.inner.registry).begin_session(device)?;

        let (control_tx, mut control_rx) = mpsc::unbounded_channel();
        guard(&self.inner.controls).insert(device.to_string(), control_tx);

        let config = SessionConfig {
            chunk_size: self.inner.settings.chunk_size,
            idle_timeout: self.inner.settings.idle_timeout(),
        };
        let reporter = DeviceReporter::new(self.inner.registry.clone(), device);
        let outcome = match Session::open(&self.inner.connector, reporter, config, &mut control_rx).await {
            Ok(mut session) => {
                let outcome = session
                    .exchange(handler.as_mut(), &mut control_rx, self.inner.clock.as_ref())
                    .await;
                session.close().await;
                outcome
            }
            Err(e) => Err(e),
        };

        guard(&self.inner.controls).remove(device);
        outcome?;
        handler.report().ok_or(SessionError::Incomplete)
    }

    async fn verify_files(&self, device: &str) -> Result<CommandReport, SessionError> {
        let names = match self.run_session(device, Box::new(StorageListing::new())).await? {
            CommandReport::Storage(names) => names,
            other => return Ok(other),
        };
        let local = self.inner.sink.list_files().map_err(|e| {
            warn!(device = %device, "Could not list transferred files: {:#}", e);
            SessionError::Backend(e.to_string())
        })?;
        let code = lock(&self.inner.registry)
            .get(device)
            .and_then(|r| r.code.assigned().map(str::to_string));
        Ok(CommandReport::Verification(match_storage_files(
            &names,
            code.as_deref(),
            self.inner.clock.current_year(),
            &local,
        )))
    }

    /// Fold a completed command's result into the registry.
    fn apply(&self, device: &str, report: &CommandReport) {
        let mut registry = lock(&self.inner.registry);
        match report {
            CommandReport::Identity(code) => {
                info!(device = %device, code = %code, "Identity resolved");
                registry.set_code(device, code.clone());
            }
            CommandReport::Storage(names) => registry.set_storage(device, names.clone()),
            CommandReport::Busy(reply) => {
                registry.message(device, reply, MessageSeverity::Warning);
            }
            CommandReport::FileTransferred { name, lines, path } => {
                let severity = if path.is_some() {
                    MessageSeverity::Success
                } else {
                    MessageSeverity::Error
                };
                registry.message(device, &format!("Transferred {} ({} lines)", name, lines), severity);
            }
            CommandReport::TimeSynced(result) => {
                registry.set_time_sync(device, result.offset_ms, result.accuracy_ms);
            }
            CommandReport::Drift { residual_ms } => {
                registry.message(
                    device,
                    &format!("Drift: {:.1} ms", residual_ms),
                    MessageSeverity::Info,
                );
            }
            CommandReport::Verification(matches) => {
                registry.set_storage(device, matches.iter().map(|m| m.remote.clone()).collect());
                registry.apply_matches(device, matches);
                let missing = matches.iter().filter(|m| m.local.is_none()).count();
                let severity = if missing == 0 {
                    MessageSeverity::Success
                } else {
                    MessageSeverity::Warning
                };
                registry.message(
                    device,
                    &format!("{} of {} files transferred", matches.len() - missing, matches.len()),
                    severity,
                );
            }
            CommandReport::Acknowledged { replies } => {
                debug!(device = %device, ?replies, "Command acknowledged");
            }
            CommandReport::Streamed { samples } => {
                info!(device = %device, samples, "Streaming ended");
            }
            CommandReport::StreamStopping
            | CommandReport::Reconnecting
            | CommandReport::Disconnected => {}
        }
    }

    /// Full snapshot of every device, e.g. for a newly attached dashboard.
    pub fn announce_all(&self) {
        lock(&self.inner.registry).announce_all();
    }

    pub fn announce(&self, device: &str, component: Option<&str>) {
        let registry = lock(&self.inner.registry);
        match component {
            Some(component) => {
                if !registry.announce_field(device, component) {
                    debug!(device = %device, component, "Unknown info component");
                }
            }
            None => registry.announce(device),
        }
    }
}
