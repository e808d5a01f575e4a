use anyhow::Result;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use wearable_fleet::domain::fleet::lock;
use wearable_fleet::domain::models::DeviceTarget;
use wearable_fleet::domain::ports::SystemClock;
use wearable_fleet::domain::settings::SettingsService;
use wearable_fleet::infrastructure::bluetooth::connection::{
    default_adapter, BtleplugConnector, UartEndpoints,
};
use wearable_fleet::infrastructure::bluetooth::scanner::BleScanner;
use wearable_fleet::infrastructure::bluetooth::{FleetService, ServiceParts};
use wearable_fleet::infrastructure::dashboard::{DashboardBridge, DashboardInput};
use wearable_fleet::infrastructure::logging::init_logger;
use wearable_fleet::infrastructure::storage::FlatFileStore;

#[tokio::main]
async fn main() -> Result<()> {
    let settings = SettingsService::new()?.get().clone();
    let _log_guard = init_logger(&settings.log_settings)?;
    info!("Starting wearable fleet manager");

    let store = Arc::new(FlatFileStore::new(
        &settings.watch_list_dir,
        &settings.transferred_data_dir,
    )?);
    let adapter = default_adapter().await?;
    let (event_tx, mut events) = mpsc::unbounded_channel();

    let service = FleetService::new(
        settings.clone(),
        ServiceParts {
            connector: BtleplugConnector::new(adapter.clone(), UartEndpoints::from_settings(&settings)),
            scanner: Box::new(BleScanner::new(adapter)),
            store: store.clone(),
            sink: store,
            clock: Arc::new(SystemClock),
        },
        event_tx,
    );
    if let Err(e) = service.restore_known() {
        warn!("Could not restore known devices: {:#}", e);
    }

    let (input_tx, mut inputs) = mpsc::unbounded_channel();
    let bridge = DashboardBridge::start(&settings.dashboard_socket, input_tx)?;
    service.start_scanning().await?;

    loop {
        tokio::select! {
            Some(event) = events.recv() => bridge.publish(&event),
            Some(input) = inputs.recv() => handle_input(&service, input),
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    service.stop_scanning().await?;
    Ok(())
}

fn handle_input(service: &FleetService<BtleplugConnector>, input: DashboardInput) {
    match input {
        DashboardInput::Attached => service.announce_all(),
        DashboardInput::Request { target, command } => {
            // Outcomes are logged and surfaced as events by the service
            drop(service.dispatch(target, command));
        }
        DashboardInput::Info { target, component } => {
            let devices = match target {
                DeviceTarget::All => lock(service.registry()).device_ids(),
                DeviceTarget::One(device) => vec![device],
            };
            for device in devices {
                service.announce(&device, component.as_deref());
            }
        }
    }
}
