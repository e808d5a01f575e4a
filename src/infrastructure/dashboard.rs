//! Dashboard bridge
//!
//! A local socket carrying JSON lines both ways. Every fleet event is
//! written to all attached clients; each client line is a request of the
//! form `{"device": "<id>|all", "cmd": "<name>", "msg": "..."}`.

use crate::domain::models::{DeviceTarget, FleetCommand, FleetEvent};
use anyhow::Result;
use interprocess::local_socket::{
    traits::ListenerExt, GenericNamespaced, ListenerOptions, Stream as LocalStream, ToNsName,
};
use interprocess::TryClone;
use serde::Deserialize;
use std::io::{BufRead, BufReader, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// What a dashboard client asked for.
#[derive(Debug, Clone, PartialEq)]
pub enum DashboardInput {
    /// A client attached and needs a full snapshot
    Attached,
    Request {
        target: DeviceTarget,
        command: FleetCommand,
    },
    /// Re-emit one field, or the whole snapshot when `component` is absent
    Info {
        target: DeviceTarget,
        component: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
struct DashboardRequest {
    device: String,
    cmd: String,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    component: Option<String>,
}

/// Parse one request line.
pub fn parse_request(line: &str) -> Result<DashboardInput, String> {
    let request: DashboardRequest =
        serde_json::from_str(line.trim()).map_err(|e| format!("malformed request: {}", e))?;
    let target = DeviceTarget::from(request.device.as_str());
    match request.cmd.as_str() {
        "getInfo" => Ok(DashboardInput::Info {
            target,
            component: None,
        }),
        "getInfoSingle" => {
            let component = request
                .component
                .or(request.msg)
                .filter(|c| !c.is_empty())
                .ok_or_else(|| "getInfoSingle requires a component".to_string())?;
            Ok(DashboardInput::Info {
                target,
                component: Some(component),
            })
        }
        cmd => Ok(DashboardInput::Request {
            target,
            command: FleetCommand::from_wire(cmd, request.msg.as_deref())?,
        }),
    }
}

/// Work for the writer thread, in the order it must happen.
enum Outbound {
    Attach(LocalStream),
    Line(String),
}

pub struct DashboardBridge {
    outbound: mpsc::UnboundedSender<Outbound>,
    clients: Arc<AtomicUsize>,
}

impl DashboardBridge {
    /// Listen on `name` and forward parsed requests to `inputs`. Socket
    /// writes happen on a dedicated thread so a stalled client never holds
    /// up the caller of [`publish`](Self::publish).
    pub fn start(name: &str, inputs: mpsc::UnboundedSender<DashboardInput>) -> Result<Self> {
        let socket_name = name.to_ns_name::<GenericNamespaced>()?;
        let listener = ListenerOptions::new().name(socket_name).create_sync()?;
        info!(socket = %name, "Dashboard bridge listening");

        let clients = Arc::new(AtomicUsize::new(0));
        let (outbound, pending) = mpsc::unbounded_channel();

        let count = clients.clone();
        std::thread::Builder::new()
            .name("dashboard-writer".into())
            .spawn(move || write_events(pending, &count))?;

        let attach_to = outbound.clone();
        std::thread::Builder::new()
            .name("dashboard-listener".into())
            .spawn(move || {
                for conn in listener.incoming().filter_map(|c| c.ok()) {
                    if let Err(e) = attach(conn, &attach_to, inputs.clone()) {
                        error!("Dashboard client error: {}", e);
                    }
                }
            })?;

        Ok(Self { outbound, clients })
    }

    pub fn client_count(&self) -> usize {
        self.clients.load(Ordering::Relaxed)
    }

    /// Queue one event for every client. Never blocks.
    pub fn publish(&self, event: &FleetEvent) {
        let line = match serde_json::to_string(event) {
            Ok(json) => json + "\n",
            Err(e) => {
                warn!(device = %event.device(), "Could not serialize event: {}", e);
                return;
            }
        };
        if self.outbound.send(Outbound::Line(line)).is_err() {
            warn!(device = %event.device(), "Dashboard writer stopped; event dropped");
        }
    }
}

/// Writer thread: owns the client streams and drops those that went away.
fn write_events(mut pending: mpsc::UnboundedReceiver<Outbound>, count: &AtomicUsize) {
    let mut clients: Vec<LocalStream> = Vec::new();
    while let Some(work) = pending.blocking_recv() {
        match work {
            Outbound::Attach(stream) => clients.push(stream),
            Outbound::Line(line) => clients.retain_mut(|client| {
                let written = client
                    .write_all(line.as_bytes())
                    .and_then(|_| client.flush());
                if let Err(e) = &written {
                    debug!("Dropping dashboard client: {}", e);
                }
                written.is_ok()
            }),
        }
        count.store(clients.len(), Ordering::Relaxed);
    }
}

fn attach(
    stream: LocalStream,
    outbound: &mpsc::UnboundedSender<Outbound>,
    inputs: mpsc::UnboundedSender<DashboardInput>,
) -> Result<()> {
    let reader = BufReader::new(stream.try_clone()?);
    outbound
        .send(Outbound::Attach(stream))
        .map_err(|_| anyhow::anyhow!("dashboard writer stopped"))?;
    info!("Dashboard client attached");
    if inputs.send(DashboardInput::Attached).is_err() {
        return Ok(());
    }

    std::thread::Builder::new()
        .name("dashboard-client".into())
        .spawn(move || read_requests(reader, inputs))?;
    Ok(())
}

fn read_requests(mut reader: BufReader<LocalStream>, inputs: mpsc::UnboundedSender<DashboardInput>) {
    let mut buffer = String::new();
    loop {
        buffer.clear();
        match reader.read_line(&mut buffer) {
            Ok(0) => break, // EOF
            Ok(_) if buffer.trim().is_empty() => continue,
            Ok(_) => match parse_request(&buffer) {
                Ok(input) => {
                    debug!(?input, "Dashboard request");
                    if inputs.send(input).is_err() {
                        break;
                    }
                }
                Err(e) => warn!(line = %buffer.trim(), "Rejected dashboard request: {}", e),
            },
            Err(e) => {
                error!("Dashboard read error: {}", e);
                break;
            }
        }
    }
    info!("Dashboard client detached");
}
