//! BLE Scanner Module
//!
//! Passive advertisement scanning. Every discovery or update of a named
//! peripheral is turned into a [`Sighting`]; fleet membership is decided by
//! the registry, not here.

use crate::domain::models::Sighting;
use crate::infrastructure::bluetooth::protocol;
use async_trait::async_trait;
use btleplug::api::{Central, CentralEvent, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, PeripheralId};
use futures::StreamExt;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Source of advertisement sightings.
#[async_trait]
pub trait AdvertisementSource: Send + Sync {
    async fn start(&self, sightings: mpsc::UnboundedSender<Sighting>) -> anyhow::Result<()>;

    async fn stop(&self) -> anyhow::Result<()>;

    fn is_scanning(&self) -> bool;
}

pub struct BleScanner {
    adapter: Adapter,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl BleScanner {
    pub fn new(adapter: Adapter) -> Self {
        Self {
            adapter,
            task: Mutex::new(None),
        }
    }

    fn take_task(&self) -> Option<JoinHandle<()>> {
        self.task
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
    }
}

async fn sighting_for(adapter: &Adapter, id: &PeripheralId) -> Option<Sighting> {
    let peripheral = adapter.peripheral(id).await.ok()?;
    let properties = peripheral.properties().await.ok()??;
    let name = properties.local_name?;
    Some(Sighting {
        name,
        rssi: properties.rssi,
        state_code: protocol::decode_advertised_state(&properties.manufacturer_data),
    })
}

#[async_trait]
impl AdvertisementSource for BleScanner {
    async fn start(&self, sightings: mpsc::UnboundedSender<Sighting>) -> anyhow::Result<()> {
        self.stop().await?;

        let mut events = self.adapter.events().await?;
        self.adapter.start_scan(ScanFilter::default()).await?;
        info!("Scanning for devices");

        let adapter = self.adapter.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let id = match event {
                    CentralEvent::DeviceDiscovered(id)
                    | CentralEvent::DeviceUpdated(id)
                    | CentralEvent::ManufacturerDataAdvertisement { id, .. } => id,
                    _ => continue,
                };
                if let Some(sighting) = sighting_for(&adapter, &id).await {
                    if sightings.send(sighting).is_err() {
                        break;
                    }
                }
            }
            debug!("Advertisement stream ended");
        });

        *self
            .task
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(task);
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        if let Some(task) = self.take_task() {
            info!("Stopping scan");
            task.abort();
            if let Err(e) = self.adapter.stop_scan().await {
                warn!("Failed to stop scan: {}", e);
                return Err(e.into());
            }
        }
        Ok(())
    }

    fn is_scanning(&self) -> bool {
        self.task
            .lock()
            .map(|task| task.is_some())
            .unwrap_or(false)
    }
}
