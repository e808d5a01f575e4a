//! BLE Connection Module
//!
//! btleplug backed [`Connector`] and [`UartLink`]: finds the peripheral by
//! its advertised name, connects, resolves the UART service and its TX/RX
//! characteristics and subscribes to notifications.

use crate::domain::error::{MissingEndpoint, SessionError};
use crate::domain::settings::Settings;
use crate::infrastructure::bluetooth::protocol::{self, RX_CHAR_UUID, TX_CHAR_UUID, UART_SERVICE_UUID};
use crate::infrastructure::bluetooth::transport::{Connector, UartLink};
use async_trait::async_trait;
use btleplug::api::{Central, Characteristic, Manager as _, Peripheral as _, ValueNotification, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::stream::Stream;
use futures::StreamExt;
use std::pin::Pin;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Service and characteristic identifiers to resolve on connect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UartEndpoints {
    pub service: Uuid,
    pub tx: Uuid,
    pub rx: Uuid,
}

impl Default for UartEndpoints {
    fn default() -> Self {
        Self {
            service: UART_SERVICE_UUID,
            tx: TX_CHAR_UUID,
            rx: RX_CHAR_UUID,
        }
    }
}

impl UartEndpoints {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            service: protocol::parse_uuid(&settings.uart_service_uuid, UART_SERVICE_UUID),
            tx: protocol::parse_uuid(&settings.tx_char_uuid, TX_CHAR_UUID),
            rx: protocol::parse_uuid(&settings.rx_char_uuid, RX_CHAR_UUID),
        }
    }
}

/// First Bluetooth adapter of the host.
pub async fn default_adapter() -> anyhow::Result<Adapter> {
    let manager = Manager::new().await?;
    manager
        .adapters()
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| anyhow::anyhow!("No Bluetooth adapter found"))
}

pub struct BtleplugConnector {
    adapter: Adapter,
    endpoints: UartEndpoints,
}

impl BtleplugConnector {
    pub fn new(adapter: Adapter, endpoints: UartEndpoints) -> Self {
        Self { adapter, endpoints }
    }

    async fn find_peripheral(&self, device: &str) -> Result<Option<Peripheral>, SessionError> {
        let peripherals = self
            .adapter
            .peripherals()
            .await
            .map_err(|e| SessionError::Backend(e.to_string()))?;
        for peripheral in peripherals {
            let name = peripheral
                .properties()
                .await
                .ok()
                .flatten()
                .and_then(|p| p.local_name);
            if name.as_deref() == Some(device) {
                return Ok(Some(peripheral));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl Connector for BtleplugConnector {
    type Link = BtleplugLink;

    async fn connect(&self, device: &str) -> Result<BtleplugLink, SessionError> {
        let peripheral = self
            .find_peripheral(device)
            .await?
            .ok_or_else(|| SessionError::ConnectFailed(format!("{} has not been seen by the adapter", device)))?;

        if !peripheral.is_connected().await.unwrap_or(false) {
            peripheral
                .connect()
                .await
                .map_err(|e| SessionError::ConnectFailed(e.to_string()))?;
        }
        info!(device = %device, address = %peripheral.address(), "Link established");

        Ok(BtleplugLink {
            peripheral,
            device: device.to_string(),
            endpoints: self.endpoints,
            tx: None,
            rx: None,
            notifications: None,
        })
    }
}

type NotificationStream = Pin<Box<dyn Stream<Item = ValueNotification> + Send>>;

pub struct BtleplugLink {
    peripheral: Peripheral,
    device: String,
    endpoints: UartEndpoints,
    tx: Option<Characteristic>,
    rx: Option<Characteristic>,
    notifications: Option<NotificationStream>,
}

#[async_trait]
impl UartLink for BtleplugLink {
    async fn discover(&mut self) -> Result<(), SessionError> {
        self.peripheral
            .discover_services()
            .await
            .map_err(|e| SessionError::Backend(e.to_string()))?;

        let services = self.peripheral.services();
        let Some(service) = services.iter().find(|s| s.uuid == self.endpoints.service) else {
            error!(device = %self.device, uuid = %self.endpoints.service, "UART service not found");
            return Err(SessionError::ServiceDiscoveryFailed(MissingEndpoint::Service));
        };
        debug!(device = %self.device, characteristics = service.characteristics.len(), "Found UART service");

        let find = |uuid: Uuid| service.characteristics.iter().find(|c| c.uuid == uuid).cloned();
        let Some(tx) = find(self.endpoints.tx) else {
            error!(device = %self.device, uuid = %self.endpoints.tx, "TX characteristic not found");
            return Err(SessionError::ServiceDiscoveryFailed(MissingEndpoint::Tx));
        };
        let Some(rx) = find(self.endpoints.rx) else {
            error!(device = %self.device, uuid = %self.endpoints.rx, "RX characteristic not found");
            return Err(SessionError::ServiceDiscoveryFailed(MissingEndpoint::Rx));
        };

        self.tx = Some(tx);
        self.rx = Some(rx);
        Ok(())
    }

    async fn subscribe(&mut self) -> Result<(), SessionError> {
        let rx = self
            .rx
            .as_ref()
            .ok_or(SessionError::ServiceDiscoveryFailed(MissingEndpoint::Rx))?;
        self.peripheral
            .subscribe(rx)
            .await
            .map_err(|e| SessionError::SubscribeFailed(e.to_string()))?;
        let stream = self
            .peripheral
            .notifications()
            .await
            .map_err(|e| SessionError::SubscribeFailed(e.to_string()))?;
        self.notifications = Some(stream);
        Ok(())
    }

    fn is_writable(&self) -> bool {
        self.tx.is_some()
    }

    async fn write_packet(&mut self, packet: &[u8]) -> Result<(), SessionError> {
        let tx = self.tx.as_ref().ok_or(SessionError::NotConnected)?;
        self.peripheral
            .write(tx, packet, WriteType::WithResponse)
            .await
            .map_err(|e| SessionError::WriteFailed(e.to_string()))
    }

    async fn next_fragment(&mut self) -> Option<Vec<u8>> {
        let rx_uuid = self.rx.as_ref()?.uuid;
        let stream = self.notifications.as_mut()?;
        while let Some(notification) = stream.next().await {
            if notification.uuid == rx_uuid {
                return Some(notification.value);
            }
        }
        None
    }

    async fn disconnect(&mut self) -> Result<(), SessionError> {
        self.notifications = None;
        self.tx = None;
        if let Some(rx) = self.rx.take() {
            if let Err(e) = self.peripheral.unsubscribe(&rx).await {
                debug!(device = %self.device, "Unsubscribe failed: {}", e);
            }
        }
        self.peripheral
            .disconnect()
            .await
            .map_err(|e| SessionError::DisconnectFailed(e.to_string()))
    }
}
