//! Fleet registry
//!
//! Owns every known device record. Records are created by discovery or
//! restored from the persisted list, mutated by sightings, session outcomes
//! and the presence-expiry timer, and destroyed only by explicit removal.
//! Every mutation that the dashboard shows is emitted as a [`FleetEvent`]
//! while the registry lock is held, so per-device event order matches
//! mutation order.

use crate::domain::error::SessionError;
use crate::domain::models::{
    DeviceSnapshot, FileMatch, FleetEvent, InfoField, MessageSeverity, OperationalState,
    PersistedDevice, Presence, SessionState, ShortCode, Sighting, StatusMessage, StorageEntry,
    TelemetrySample,
};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, info};

pub type SharedRegistry = Arc<Mutex<FleetRegistry>>;

/// Lock the shared registry. A poisoned lock still holds consistent
/// records, so it is recovered rather than propagated.
pub fn lock(registry: &SharedRegistry) -> MutexGuard<'_, FleetRegistry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone)]
pub struct DeviceRecord {
    pub device_id: String,
    pub code: ShortCode,
    pub mac_id: String,
    pub serial_number: String,
    pub session: SessionState,
    pub presence: Presence,
    pub state: OperationalState,
    pub storage: Vec<StorageEntry>,
    pub avg_offset_ms: Option<f64>,
    pub time_sync_accuracy_ms: Option<f64>,
    pub progress: String,
    /// Identity has been queried during this run
    resolved: bool,
    presence_epoch: u64,
}

impl DeviceRecord {
    fn new(device_id: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
            code: ShortCode::Unknown,
            mac_id: "Unknown".to_string(),
            serial_number: "Unknown".to_string(),
            session: SessionState::Idle,
            presence: Presence::Unknown,
            state: OperationalState::Unknown,
            storage: Vec::new(),
            avg_offset_ms: None,
            time_sync_accuracy_ms: None,
            progress: String::new(),
            resolved: false,
            presence_epoch: 0,
        }
    }

    pub fn snapshot(&self) -> DeviceSnapshot {
        DeviceSnapshot {
            device_id: self.device_id.clone(),
            watch_name: self.code.clone(),
            state: self.state,
            nearby: self.presence,
            connected: self.session.is_connected(),
            storage: self.storage.iter().map(|e| e.name.clone()).collect(),
            time_sync_accuracy: self.time_sync_accuracy_ms,
            progress: self.progress.clone(),
        }
    }

    pub fn persisted(&self) -> PersistedDevice {
        PersistedDevice {
            device_id: self.device_id.clone(),
            watch_name: self.code.to_string(),
            mac_id: self.mac_id.clone(),
            serial_number: self.serial_number.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SightingOutcome {
    /// Not a fleet device, or new devices are not accepted
    Ignored,
    /// First sighting ever; the record was just created
    Created,
    /// Known record whose identity has not been queried this run
    Unresolved,
    Refreshed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    pub outcome: SightingOutcome,
    /// Presence epoch to hand back to [`FleetRegistry::expire_presence`]
    pub epoch: u64,
}

pub struct FleetRegistry {
    devices: BTreeMap<String, DeviceRecord>,
    allow_new_devices: bool,
    name_prefixes: Vec<String>,
    events: mpsc::UnboundedSender<FleetEvent>,
}

impl FleetRegistry {
    pub fn new(
        allow_new_devices: bool,
        name_prefixes: Vec<String>,
        events: mpsc::UnboundedSender<FleetEvent>,
    ) -> Self {
        Self {
            devices: BTreeMap::new(),
            allow_new_devices,
            name_prefixes,
            events,
        }
    }

    pub fn into_shared(self) -> SharedRegistry {
        Arc::new(Mutex::new(self))
    }

    fn emit(&self, event: FleetEvent) {
        let _ = self.events.send(event);
    }

    fn emit_field(&self, device: &str, field: InfoField) {
        self.emit(FleetEvent::InfoSingle {
            device: device.to_string(),
            field,
        });
    }

    pub fn is_fleet_name(&self, name: &str) -> bool {
        self.name_prefixes.iter().any(|p| name.starts_with(p.as_str()))
    }

    /// Recreate a record from the persisted list. Presence stays unknown
    /// until the device is sighted.
    pub fn restore(&mut self, persisted: &PersistedDevice) {
        if self.devices.contains_key(&persisted.device_id) {
            return;
        }
        let mut record = DeviceRecord::new(&persisted.device_id);
        record.code = ShortCode::parse(&persisted.watch_name);
        record.mac_id = persisted.mac_id.clone();
        record.serial_number = persisted.serial_number.clone();
        info!(device = %persisted.device_id, "Restored known device");
        self.devices.insert(persisted.device_id.clone(), record);
        self.emit(FleetEvent::DeviceCreated {
            device: persisted.device_id.clone(),
        });
    }

    /// Apply an advertisement sighting.
    pub fn observe(&mut self, sighting: &Sighting) -> Observation {
        let ignored = Observation {
            outcome: SightingOutcome::Ignored,
            epoch: 0,
        };
        if !self.is_fleet_name(&sighting.name) {
            return ignored;
        }

        let outcome = match self.devices.get_mut(&sighting.name) {
            Some(record) if !record.resolved => {
                record.resolved = true;
                SightingOutcome::Unresolved
            }
            Some(_) => SightingOutcome::Refreshed,
            None if self.allow_new_devices => {
                let mut record = DeviceRecord::new(&sighting.name);
                record.resolved = true;
                self.devices.insert(sighting.name.clone(), record);
                info!(device = %sighting.name, "Found new device");
                self.emit(FleetEvent::DeviceCreated {
                    device: sighting.name.clone(),
                });
                SightingOutcome::Created
            }
            None => return ignored,
        };

        let Some(record) = self.devices.get_mut(&sighting.name) else {
            return ignored;
        };
        let rssi = sighting.rssi.unwrap_or(match record.presence {
            Presence::Nearby(rssi) => rssi,
            Presence::Unknown => 0,
        });
        record.presence = Presence::Nearby(rssi);
        record.presence_epoch += 1;
        let epoch = record.presence_epoch;

        let state_change = sighting
            .state_code
            .map(OperationalState::from_code)
            .filter(|state| *state != record.state);
        if let Some(state) = state_change {
            record.state = state;
        }

        self.emit_field(&sighting.name, InfoField::Nearby(Presence::Nearby(rssi)));
        if let Some(state) = state_change {
            self.emit_field(&sighting.name, InfoField::State(state));
        }
        Observation { outcome, epoch }
    }

    /// Demote presence and state to unknown if no sighting arrived since
    /// `epoch`. Returns whether a demotion happened.
    pub fn expire_presence(&mut self, device: &str, epoch: u64) -> bool {
        let Some(record) = self.devices.get_mut(device) else {
            return false;
        };
        if record.presence_epoch != epoch || record.presence == Presence::Unknown {
            return false;
        }
        record.presence = Presence::Unknown;
        record.state = OperationalState::Unknown;
        debug!(device = %device, "Presence expired");
        self.emit_field(device, InfoField::Nearby(Presence::Unknown));
        self.emit_field(device, InfoField::State(OperationalState::Unknown));
        true
    }

    /// Claim the single session slot of a device.
    pub fn begin_session(&mut self, device: &str) -> Result<(), SessionError> {
        let record = self
            .devices
            .get(device)
            .ok_or_else(|| SessionError::UnknownDevice(device.to_string()))?;
        if record.session != SessionState::Idle {
            return Err(SessionError::AlreadyConnected);
        }
        self.set_session_state(device, SessionState::Connecting);
        Ok(())
    }

    pub fn set_session_state(&mut self, device: &str, state: SessionState) {
        let Some(record) = self.devices.get_mut(device) else {
            return;
        };
        let was_connected = record.session.is_connected();
        record.session = state;
        // A failed attempt is reported even if no link was ever up
        if was_connected != state.is_connected() || state == SessionState::Failed {
            self.emit_field(device, InfoField::Connected(state.is_connected()));
        }
    }

    pub fn end_session(&mut self, device: &str) {
        self.set_session_state(device, SessionState::Idle);
    }

    pub fn session_state(&self, device: &str) -> Option<SessionState> {
        self.devices.get(device).map(|r| r.session)
    }

    pub fn set_code(&mut self, device: &str, code: ShortCode) {
        if let Some(record) = self.devices.get_mut(device) {
            record.code = code.clone();
            self.emit_field(device, InfoField::WatchName(code));
        }
    }

    pub fn set_storage(&mut self, device: &str, names: Vec<String>) {
        if let Some(record) = self.devices.get_mut(device) {
            record.storage = names.iter().map(StorageEntry::named).collect();
            self.emit_field(device, InfoField::Storage(names));
        }
    }

    /// Fill in sizes of storage entries that matched a local file.
    pub fn apply_matches(&mut self, device: &str, matches: &[FileMatch]) {
        if let Some(record) = self.devices.get_mut(device) {
            for entry in &mut record.storage {
                entry.size = matches
                    .iter()
                    .find(|m| m.remote == entry.name)
                    .and_then(|m| m.local.as_ref())
                    .map(|f| f.size);
            }
        }
    }

    /// Update the progress message. Only emitted upward when `emit` is set.
    pub fn set_progress(&mut self, device: &str, message: &str, emit: bool) {
        if let Some(record) = self.devices.get_mut(device) {
            record.progress = message.to_string();
            if emit {
                self.emit_field(device, InfoField::Progress(message.to_string()));
            }
        }
    }

    pub fn set_time_sync(&mut self, device: &str, offset_ms: f64, accuracy_ms: f64) {
        if let Some(record) = self.devices.get_mut(device) {
            record.avg_offset_ms = Some(offset_ms);
            record.time_sync_accuracy_ms = Some(accuracy_ms);
            self.emit_field(device, InfoField::TimeSync(Some(accuracy_ms)));
        }
    }

    pub fn live_sample(&self, device: &str, sample: TelemetrySample) {
        self.emit(FleetEvent::LiveSample {
            device: device.to_string(),
            sample,
        });
    }

    pub fn message(&self, device: &str, message: &str, severity: MessageSeverity) {
        self.emit(FleetEvent::Message {
            device: device.to_string(),
            message: StatusMessage {
                message: message.to_string(),
                severity,
            },
        });
    }

    /// Force the identity query to run again on the next sighting.
    pub fn mark_unresolved(&mut self, device: &str) -> bool {
        match self.devices.get_mut(device) {
            Some(record) => {
                record.resolved = false;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, device: &str) -> Option<&DeviceRecord> {
        self.devices.get(device)
    }

    /// Device identities in stable order.
    pub fn device_ids(&self) -> Vec<String> {
        self.devices.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Emit a full-info snapshot for one device.
    pub fn announce(&self, device: &str) {
        if let Some(record) = self.devices.get(device) {
            self.emit(FleetEvent::InfoAll(record.snapshot()));
        }
    }

    pub fn announce_all(&self) {
        for record in self.devices.values() {
            self.emit(FleetEvent::InfoAll(record.snapshot()));
        }
    }

    /// Re-emit a single field, by its dashboard component name.
    pub fn announce_field(&self, device: &str, component: &str) -> bool {
        let Some(record) = self.devices.get(device) else {
            return false;
        };
        let field = match component {
            "storage" => InfoField::Storage(record.snapshot().storage),
            "progress" => InfoField::Progress(record.progress.clone()),
            "watchName" => InfoField::WatchName(record.code.clone()),
            "nearby" => InfoField::Nearby(record.presence),
            "state" => InfoField::State(record.state),
            "connected" => InfoField::Connected(record.session.is_connected()),
            "timeSync" => InfoField::TimeSync(record.time_sync_accuracy_ms),
            _ => return false,
        };
        self.emit_field(device, field);
        true
    }
}

/// Handle through which a running command reports progress for one device.
#[derive(Clone)]
pub struct DeviceReporter {
    registry: SharedRegistry,
    device: String,
}

impl DeviceReporter {
    pub fn new(registry: SharedRegistry, device: impl Into<String>) -> Self {
        Self {
            registry,
            device: device.into(),
        }
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn session_state(&self, state: SessionState) {
        lock(&self.registry).set_session_state(&self.device, state);
    }

    pub fn progress(&self, message: &str, emit: bool) {
        lock(&self.registry).set_progress(&self.device, message, emit);
    }

    pub fn live_sample(&self, sample: TelemetrySample) {
        lock(&self.registry).live_sample(&self.device, sample);
    }

    pub fn code(&self) -> Option<String> {
        lock(&self.registry)
            .get(&self.device)
            .and_then(|r| r.code.assigned().map(str::to_string))
    }
}
