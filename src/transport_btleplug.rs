//! btleplug-backed DFU transport.
//!
//! Scans for the target by advertised name or BLE address at
//! construction time; connection, discovery and write completion are
//! reported back to the engine as [`TransportEvent`]s, notifications on
//! the progress characteristic are forwarded by a background task.

use crate::transport::dfu_uuids;
use crate::transport::{DfuTransport, EventReceiver, EventSender, TransportError, TransportEvent};

use async_trait::async_trait;
use btleplug::api::BDAddr;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Peripheral};
use futures::stream::StreamExt;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// btleplug does not expose the negotiated MTU; report the value every
/// recent controller negotiates.
// TODO fix once btleplug supports MTU lookup
const FALLBACK_MTU: u32 = 244;

const WRITE_TIMEOUT: std::time::Duration = std::time::Duration::from_millis(500);

async fn timeout<F: std::future::Future>(future: F) -> Result<F::Output, tokio::time::error::Elapsed> {
    tokio::time::timeout(WRITE_TIMEOUT, future).await
}

fn find_characteristic(
    peripheral: &Peripheral,
    uuid: uuid::Uuid,
) -> Result<Characteristic, TransportError> {
    for characteristic in peripheral.characteristics() {
        if uuid == characteristic.uuid {
            return Ok(characteristic);
        }
    }
    Err(TransportError::CharacteristicNotFound(uuid))
}

async fn find_peripheral(
    central: &Adapter,
    name: &str,
    addr: Option<BDAddr>,
) -> Result<Peripheral, TransportError> {
    info!(name, ?addr, "scanning for DFU target");
    central.start_scan(ScanFilter::default()).await?;
    let mut events = central.events().await?;
    while let Some(event) = events.next().await {
        if let CentralEvent::DeviceDiscovered(id) = event {
            let peripheral = central.peripheral(&id).await?;
            let Some(props) = peripheral.properties().await? else {
                continue;
            };
            let matched = addr.map_or(false, |a| a == props.address)
                || (!name.is_empty() && props.local_name.as_deref() == Some(name));
            if matched {
                info!(name = ?props.local_name, addr = %props.address, "found DFU target");
                central.stop_scan().await?;
                return Ok(peripheral);
            }
        }
    }
    Err(TransportError::DeviceNotFound)
}

struct GattPoints {
    control: Characteristic,
    data: Characteristic,
    progress: Characteristic,
}

pub struct DfuTransportBtleplug {
    central: Adapter,
    peripheral: Peripheral,
    points: Mutex<Option<GattPoints>>,
    events: EventSender,
}

impl DfuTransportBtleplug {
    /// Scan for the target and bind to it. The returned receiver
    /// carries all asynchronous transport events for the session.
    pub async fn new(
        name: &str,
        addr: Option<BDAddr>,
    ) -> Result<(Self, EventReceiver), TransportError> {
        let manager = btleplug::platform::Manager::new().await?;
        let adapters = manager.adapters().await?;
        let central = adapters.into_iter().next().ok_or(TransportError::NoAdapter)?;
        let peripheral = find_peripheral(&central, name, addr).await?;
        let (events, receiver) = mpsc::unbounded_channel();
        Ok((
            DfuTransportBtleplug {
                central,
                peripheral,
                points: Mutex::new(None),
                events,
            },
            receiver,
        ))
    }

    fn point(
        &self,
        select: fn(&GattPoints) -> &Characteristic,
    ) -> Result<Characteristic, TransportError> {
        let points = self.points.lock().unwrap();
        points
            .as_ref()
            .map(|p| select(p).clone())
            .ok_or(TransportError::NotDiscovered)
    }

    async fn write(
        &self,
        characteristic: &Characteristic,
        bytes: &[u8],
        write_type: WriteType,
    ) -> Result<(), TransportError> {
        let written = timeout(self.peripheral.write(characteristic, bytes, write_type))
            .await
            .map_err(|_| TransportError::WriteTimeout)?;
        written?;
        Ok(())
    }

    fn spawn_disconnect_watcher(&self) {
        let central = self.central.clone();
        let id = self.peripheral.id();
        let events = self.events.clone();
        tokio::spawn(async move {
            let mut stream = match central.events().await {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = events.send(TransportEvent::Error(e.to_string()));
                    return;
                }
            };
            while let Some(event) = stream.next().await {
                if let CentralEvent::DeviceDisconnected(disconnected) = event {
                    if disconnected == id {
                        let _ = events.send(TransportEvent::Disconnected);
                        break;
                    }
                }
            }
        });
    }

    async fn spawn_notification_forwarder(&self) -> Result<(), TransportError> {
        let mut notifications = self.peripheral.notifications().await?;
        let events = self.events.clone();
        tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid == dfu_uuids::PROGRESS {
                    let _ = events.send(TransportEvent::Notification(notification.value));
                }
            }
        });
        Ok(())
    }
}

#[async_trait]
impl DfuTransport for DfuTransportBtleplug {
    async fn connect(
        &self,
        _auto_reconnect: bool,
        high_priority: bool,
    ) -> Result<(), TransportError> {
        self.peripheral.connect().await?;
        if high_priority {
            debug!("high-priority connection parameters not supported by backend");
        }
        self.spawn_disconnect_watcher();
        let _ = self.events.send(TransportEvent::Connected);
        let _ = self.events.send(TransportEvent::MtuChanged(FALLBACK_MTU));
        Ok(())
    }

    async fn discover_services(&self) -> Result<(), TransportError> {
        self.peripheral.discover_services().await?;
        let control = find_characteristic(&self.peripheral, dfu_uuids::CTRL)?;
        let data = find_characteristic(&self.peripheral, dfu_uuids::DATA)?;
        let progress = find_characteristic(&self.peripheral, dfu_uuids::PROGRESS)?;
        *self.points.lock().unwrap() = Some(GattPoints {
            control,
            data,
            progress,
        });
        let _ = self.events.send(TransportEvent::ServicesDiscovered);
        Ok(())
    }

    async fn set_progress_notifications(&self, enabled: bool) -> Result<(), TransportError> {
        let progress = self.point(|p| &p.progress)?;
        if enabled {
            self.peripheral.subscribe(&progress).await?;
            self.spawn_notification_forwarder().await?;
        } else {
            self.peripheral.unsubscribe(&progress).await?;
        }
        Ok(())
    }

    async fn write_ctrl(&self, bytes: &[u8]) -> Result<(), TransportError> {
        let control = self.point(|p| &p.control)?;
        self.write(&control, bytes, WriteType::WithResponse).await?;
        let _ = self.events.send(TransportEvent::WriteCompleted);
        Ok(())
    }

    async fn write_data(&self, bytes: &[u8]) -> Result<(), TransportError> {
        let data = self.point(|p| &p.data)?;
        self.write(&data, bytes, WriteType::WithoutResponse).await
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.peripheral.disconnect().await?;
        Ok(())
    }
}
