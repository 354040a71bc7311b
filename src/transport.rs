//! DFU transport interface and GATT characteristic identities.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// OTA DFU characteristic UUIDs, three endpoints under the bootloader
/// service advertised by the device.
pub mod dfu_uuids {
    /// Control channel: 8-byte command packets, write with response.
    pub const CTRL: uuid::Uuid = uuid::Uuid::from_u128(0x95301001_963F_46B1_B801_0B23E8904835);
    /// Data channel: init vectors, address-prefixed chunks and digests,
    /// write without response.
    pub const DATA: uuid::Uuid = uuid::Uuid::from_u128(0x95301002_963F_46B1_B801_0B23E8904835);
    /// Progress channel: device notifications (resync, digest failure).
    pub const PROGRESS: uuid::Uuid = uuid::Uuid::from_u128(0x95301003_963F_46B1_B801_0B23E8904835);
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no BLE adapter available")]
    NoAdapter,
    #[error("BLE peripheral not found")]
    DeviceNotFound,
    #[error("characteristic {0} not found")]
    CharacteristicNotFound(uuid::Uuid),
    #[error("services not discovered")]
    NotDiscovered,
    #[error("characteristic write timed out")]
    WriteTimeout,
    #[error(transparent)]
    Ble(#[from] btleplug::Error),
}

/// Asynchronous events delivered by a transport on its own tasks,
/// consumed by the protocol engine's event pump.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Connected,
    ServicesDiscovered,
    Disconnected,
    /// A control-channel write was acknowledged.
    WriteCompleted,
    /// Raw payload received on the progress characteristic.
    Notification(Vec<u8>),
    MtuChanged(u32),
    /// Transport-level failure reported out-of-band.
    Error(String),
}

pub type EventSender = mpsc::UnboundedSender<TransportEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// OTA DFU transport interface.
///
/// Completion of connection, discovery and control writes is reported
/// both by the returned future and as [`TransportEvent`]s on the event
/// channel handed out at construction time; the engine drives its
/// flow-control window from the events alone.
#[async_trait]
pub trait DfuTransport: Send + Sync {
    /// Connect to the bound peripheral. `auto_reconnect` and
    /// `high_priority` are hints; backends without the corresponding
    /// API ignore them.
    async fn connect(&self, auto_reconnect: bool, high_priority: bool)
        -> Result<(), TransportError>;
    /// Discover GATT services and resolve the DFU characteristics.
    async fn discover_services(&self) -> Result<(), TransportError>;
    /// Enable or disable notifications on the progress characteristic.
    async fn set_progress_notifications(&self, enabled: bool) -> Result<(), TransportError>;
    /// Write to the control characteristic, acknowledgement required.
    async fn write_ctrl(&self, bytes: &[u8]) -> Result<(), TransportError>;
    /// Write to the data characteristic, no acknowledgement.
    async fn write_data(&self, bytes: &[u8]) -> Result<(), TransportError>;
    /// Request disconnection from the peripheral.
    async fn disconnect(&self) -> Result<(), TransportError>;
}
