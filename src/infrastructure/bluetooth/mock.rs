//! Scripted in-memory radio for tests.
//!
//! The mock link reassembles written packets into commands, strips the
//! control prefix and hands each command to a script that returns the
//! notification fragments the device would send back.

use crate::domain::error::{MissingEndpoint, SessionError};
use crate::domain::models::{LocalFile, PersistedDevice, TransferredFile};
use crate::domain::ports::{DeviceStore, FileSink, ServerClock};
use crate::infrastructure::bluetooth::protocol::CONTROL_PREFIX;
use crate::infrastructure::bluetooth::transport::{Connector, UartLink};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Reply of the scripted device to one command.
pub enum Reply {
    Fragments(Vec<Vec<u8>>),
    /// Drop the link without answering
    HangUp,
}

impl Reply {
    /// Lines sent as CRLF terminated text, one fragment each.
    pub fn lines(lines: &[&str]) -> Self {
        Self::Fragments(
            lines
                .iter()
                .map(|l| format!("{}\r\n", l).into_bytes())
                .collect(),
        )
    }

    pub fn none() -> Self {
        Self::Fragments(Vec::new())
    }
}

type Script = Arc<dyn Fn(&str) -> Reply + Send + Sync>;

#[derive(Debug, Default, Clone)]
pub struct MockLog {
    pub connects: usize,
    pub disconnects: usize,
    pub packets: Vec<Vec<u8>>,
    pub commands: Vec<String>,
}

#[derive(Clone)]
pub struct MockConnector {
    script: Script,
    log: Arc<Mutex<MockLog>>,
    fail_connect: bool,
    connect_delay: Option<Duration>,
    missing: Option<MissingEndpoint>,
}

impl MockConnector {
    pub fn new(script: impl Fn(&str) -> Reply + Send + Sync + 'static) -> Self {
        Self {
            script: Arc::new(script),
            log: Arc::default(),
            fail_connect: false,
            connect_delay: None,
            missing: None,
        }
    }

    pub fn silent() -> Self {
        Self::new(|_| Reply::none())
    }

    pub fn failing_connect(mut self) -> Self {
        self.fail_connect = true;
        self
    }

    /// Connection attempts take `delay` before succeeding.
    pub fn slow_connect(mut self, delay: Duration) -> Self {
        self.connect_delay = Some(delay);
        self
    }

    pub fn missing(mut self, endpoint: MissingEndpoint) -> Self {
        self.missing = Some(endpoint);
        self
    }

    pub fn log(&self) -> MockLog {
        self.log.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    type Link = MockLink;

    async fn connect(&self, _device: &str) -> Result<MockLink, SessionError> {
        if let Some(delay) = self.connect_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_connect {
            return Err(SessionError::ConnectFailed("out of range".to_string()));
        }
        self.log.lock().unwrap().connects += 1;
        let (tx, rx) = mpsc::unbounded_channel();
        Ok(MockLink {
            script: self.script.clone(),
            log: self.log.clone(),
            missing: self.missing,
            discovered: false,
            partial: Vec::new(),
            tx: Some(tx),
            rx,
        })
    }
}

pub struct MockLink {
    script: Script,
    log: Arc<Mutex<MockLog>>,
    missing: Option<MissingEndpoint>,
    discovered: bool,
    partial: Vec<u8>,
    tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

#[async_trait]
impl UartLink for MockLink {
    async fn discover(&mut self) -> Result<(), SessionError> {
        if let Some(endpoint) = self.missing {
            return Err(SessionError::ServiceDiscoveryFailed(endpoint));
        }
        self.discovered = true;
        Ok(())
    }

    async fn subscribe(&mut self) -> Result<(), SessionError> {
        Ok(())
    }

    fn is_writable(&self) -> bool {
        self.discovered && self.tx.is_some()
    }

    async fn write_packet(&mut self, packet: &[u8]) -> Result<(), SessionError> {
        self.log.lock().unwrap().packets.push(packet.to_vec());
        self.partial.extend_from_slice(packet);

        while let Some(end) = self.partial.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.partial.drain(..=end).collect();
            let text: String = raw[..raw.len() - 1].iter().map(|&b| char::from(b)).collect();
            let command = text
                .strip_prefix(CONTROL_PREFIX)
                .unwrap_or(&text)
                .to_string();
            self.log.lock().unwrap().commands.push(command.clone());

            match (self.script)(&command) {
                Reply::Fragments(fragments) => {
                    if let Some(tx) = &self.tx {
                        for fragment in fragments {
                            let _ = tx.send(fragment);
                        }
                    }
                }
                Reply::HangUp => self.tx = None,
            }
        }
        Ok(())
    }

    async fn next_fragment(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }

    async fn disconnect(&mut self) -> Result<(), SessionError> {
        self.log.lock().unwrap().disconnects += 1;
        self.tx = None;
        Ok(())
    }
}

/// Fixed server clock.
pub struct FixedClock {
    pub now_ms: f64,
    pub year: u32,
}

impl Default for FixedClock {
    fn default() -> Self {
        Self {
            now_ms: 1_717_236_000_000.0,
            year: 2024,
        }
    }
}

impl ServerClock for FixedClock {
    fn now_ms(&self) -> f64 {
        self.now_ms
    }

    fn current_year(&self) -> u32 {
        self.year
    }
}

/// In-memory device list and file sink.
#[derive(Default)]
pub struct MemoryStore {
    pub devices: Mutex<Vec<PersistedDevice>>,
    pub files: Mutex<Vec<TransferredFile>>,
    pub local: Mutex<Vec<LocalFile>>,
}

impl DeviceStore for MemoryStore {
    fn save_device(&self, device: &PersistedDevice) -> anyhow::Result<()> {
        let mut devices = self.devices.lock().unwrap();
        devices.retain(|d| d.device_id != device.device_id);
        devices.push(device.clone());
        Ok(())
    }

    fn load_devices(&self) -> anyhow::Result<Vec<PersistedDevice>> {
        Ok(self.devices.lock().unwrap().clone())
    }
}

impl FileSink for MemoryStore {
    fn write_file(&self, file: &TransferredFile) -> anyhow::Result<PathBuf> {
        self.files.lock().unwrap().push(file.clone());
        Ok(PathBuf::from(&file.name))
    }

    fn list_files(&self) -> anyhow::Result<Vec<LocalFile>> {
        Ok(self.local.lock().unwrap().clone())
    }
}
