//! OTA DFU transfer protocol engine.
//!
//! One worker task drives the session sequentially: RESTART, then per
//! block an IV, a DATA announcement, address-prefixed chunks with PING
//! checkpoints, and a DIGEST, then DONE and RESET. Control commands
//! consume flow-control credits that the transport's write-completion
//! events return; device notifications steer resynchronization and
//! abort handling through shared state mutated by the event pump.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use num_enum::{IntoPrimitive, TryFromPrimitive};
use thiserror::Error;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::firmware::{BlockHeader, FirmwareError, FirmwareFile, IV_LEN};
use crate::sink::ResultSink;
use crate::transport::{DfuTransport, EventReceiver, TransportError, TransportEvent};

/// Largest data chunk carried in one data-channel write.
pub const MAX_CHUNK: usize = 64;
/// A PING is sent whenever the destination address crosses one of these
/// boundaries, same as the device's flash page size.
const CHUNK_ALIGNMENT: u32 = 0x800;
/// Control commands allowed in flight without acknowledgement.
const MAX_IN_FLIGHT: usize = 3;
/// Rewinds allowed before the session gives up.
const MAX_RESYNCS: u32 = 20;
/// Control packet length: cmd u16, len u16, addr u32, little-endian.
pub const CTRL_PKT_SIZE: usize = 8;

const CREDIT_TIMEOUT: Duration = Duration::from_secs(10);
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// DFU control commands.
#[derive(Debug, Copy, Clone, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u16)]
pub enum Command {
    /// Reset the device's DFU state, data counts etc.
    Restart = 1,
    /// Block data follows on the data channel.
    Data = 2,
    /// Init vector follows on the data channel.
    Iv = 3,
    /// Transmission complete.
    Done = 4,
    /// Reset the device.
    Reset = 5,
    /// SHA-256 digest follows on the data channel.
    Digest = 6,
    /// Ask the device to report its absorbed position.
    Ping = 7,
}

/// Opcodes delivered on the progress characteristic.
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive)]
#[repr(u8)]
enum ProgressOpcode {
    Resync = 1,
    DigestFailed = 2,
}

#[derive(Debug, Error)]
pub enum DfuError {
    #[error(transparent)]
    Firmware(#[from] FirmwareError),
    #[error("i/o error reading firmware: {0}")]
    Io(#[from] std::io::Error),
    #[error("timed out waiting for a flow-control credit")]
    CreditTimeout,
    #[error("negotiated MTU {mtu} is below the required {required}")]
    InsufficientMtu { mtu: u32, required: u32 },
    #[error("device reported digest verification failure")]
    DigestFailed,
    #[error("resync limit exceeded after {0} rewinds")]
    ResyncExhausted(u32),
    #[error("connection error: {0}")]
    Connection(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl DfuError {
    /// Failure category handed to the result sink.
    pub fn category(&self) -> &'static str {
        match self {
            DfuError::Firmware(FirmwareError::BadMagic(_))
            | DfuError::Firmware(FirmwareError::ZeroBlocks)
            | DfuError::Firmware(FirmwareError::TooLarge) => "format",
            DfuError::Firmware(_) | DfuError::Io(_) => "io",
            DfuError::CreditTimeout => "timeout",
            DfuError::InsufficientMtu { .. } => "mtu",
            DfuError::DigestFailed => "verification",
            DfuError::ResyncExhausted(_) => "resync",
            DfuError::Connection(_) | DfuError::Transport(_) => "connection",
        }
    }
}

/// Session states. `Disconnecting` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Connecting,
    Writing,
    Ending,
    Disconnecting,
}

/// Encode an 8-byte control packet.
fn control_packet(cmd: Command, len: u16, addr: u32) -> [u8; CTRL_PKT_SIZE] {
    let mut packet = [0u8; CTRL_PKT_SIZE];
    packet[0..2].copy_from_slice(&u16::from(cmd).to_le_bytes());
    packet[2..4].copy_from_slice(&len.to_le_bytes());
    packet[4..8].copy_from_slice(&addr.to_le_bytes());
    packet
}

struct ResyncState {
    /// Device-reported absorbed address, reset to the block end after
    /// every rewind so the next comparison is against fresh data.
    target: u32,
    rewinds: u32,
}

/// State shared between the engine task and the event pump. Everything
/// else in the session is owned by the engine alone.
struct Shared {
    credits: Semaphore,
    resync: Mutex<ResyncState>,
    state: Mutex<State>,
    mtu: AtomicU32,
    /// First fatal error wins; the flag wakes the engine.
    abort: Mutex<Option<DfuError>>,
    abort_flag: watch::Sender<bool>,
}

impl Shared {
    fn state(&self) -> State {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, state: State) {
        *self.state.lock().unwrap() = state;
    }

    fn set_resync_target(&self, target: u32) {
        self.resync.lock().unwrap().target = target;
    }

    fn abort(&self, error: DfuError) {
        let mut slot = self.abort.lock().unwrap();
        if slot.is_none() {
            *slot = Some(error);
        }
        drop(slot);
        self.abort_flag.send_replace(true);
    }

    fn take_abort(&self) -> DfuError {
        self.abort
            .lock()
            .unwrap()
            .take()
            .unwrap_or_else(|| DfuError::Connection("session aborted".into()))
    }

    /// Compare-and-adjust step of the resync algorithm, executed with
    /// the lock held. Returns the chunk-aligned rewind address when the
    /// device is behind `addr`. A reported address outside the block,
    /// stale or malformed, rewinds no further back than `block_start`.
    fn check_resync(
        &self,
        addr: u32,
        block_start: u32,
        block_end: u32,
    ) -> Result<Option<u32>, DfuError> {
        let mut resync = self.resync.lock().unwrap();
        if resync.target >= addr {
            return Ok(None);
        }
        resync.rewinds += 1;
        if resync.rewinds > MAX_RESYNCS {
            return Err(DfuError::ResyncExhausted(resync.rewinds));
        }
        let target = (resync.target & !(MAX_CHUNK as u32 - 1)).max(block_start);
        warn!(
            from = format_args!("{addr:#x}"),
            to = format_args!("{target:#x}"),
            rewinds = resync.rewinds,
            "device requested resync"
        );
        resync.target = block_end;
        Ok(Some(target))
    }

    fn handle_notification(&self, payload: &[u8]) {
        let Some(&opcode) = payload.first() else {
            return;
        };
        match ProgressOpcode::try_from(opcode) {
            Ok(ProgressOpcode::Resync) if payload.len() >= 5 => {
                let addr = u32::from_le_bytes([payload[1], payload[2], payload[3], payload[4]]);
                debug!(addr = format_args!("{addr:#x}"), "resync notification");
                self.set_resync_target(addr);
            }
            Ok(ProgressOpcode::DigestFailed) => {
                self.abort(DfuError::DigestFailed);
            }
            _ => debug!(opcode, "ignoring unknown progress opcode"),
        }
    }
}

/// Control-channel access bundled with the credit window: every command
/// acquires one credit before the write.
struct DfuTarget<'a, T: ?Sized> {
    transport: &'a T,
    shared: Arc<Shared>,
    abort_rx: watch::Receiver<bool>,
}

impl<T: DfuTransport + ?Sized> DfuTarget<'_, T> {
    /// Bail out if the event pump has flagged an abort.
    fn checkpoint(&self) -> Result<(), DfuError> {
        if *self.abort_rx.borrow() {
            Err(self.shared.take_abort())
        } else {
            Ok(())
        }
    }

    async fn acquire(&mut self, n: u32) -> Result<(), DfuError> {
        self.checkpoint()?;
        tokio::select! {
            biased;
            _ = self.abort_rx.changed() => Err(self.shared.take_abort()),
            acquired = tokio::time::timeout(CREDIT_TIMEOUT, self.shared.credits.acquire_many(n)) => {
                match acquired {
                    Ok(Ok(permits)) => {
                        // consumed for good; write completions mint new ones
                        permits.forget();
                        Ok(())
                    }
                    Ok(Err(_)) => Err(DfuError::Connection("credit pool closed".into())),
                    Err(_) => Err(DfuError::CreditTimeout),
                }
            }
        }
    }

    async fn send_command(&mut self, cmd: Command, len: u16, addr: u32) -> Result<(), DfuError> {
        self.acquire(1).await?;
        trace!(?cmd, len, addr = format_args!("{addr:#x}"), "control write");
        self.transport
            .write_ctrl(&control_packet(cmd, len, addr))
            .await?;
        Ok(())
    }

    async fn write_data(&self, bytes: &[u8]) -> Result<(), DfuError> {
        self.transport.write_data(bytes).await?;
        Ok(())
    }
}

/// One firmware transfer session: owns the container handle and the
/// cursor of the block in flight, borrows the transport and the sink.
pub struct DfuSession<'a, T: ?Sized, S> {
    target: DfuTarget<'a, T>,
    firmware: FirmwareFile,
    sink: &'a S,
    events: Option<EventReceiver>,
    total_sent: u32,
    progress: u32,
}

impl<'a, T, S> DfuSession<'a, T, S>
where
    T: DfuTransport + ?Sized,
    S: ResultSink,
{
    pub fn new(transport: &'a T, events: EventReceiver, firmware: FirmwareFile, sink: &'a S) -> Self {
        let (abort_tx, abort_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            credits: Semaphore::new(0),
            resync: Mutex::new(ResyncState {
                target: 0,
                rewinds: 0,
            }),
            state: Mutex::new(State::Idle),
            mtu: AtomicU32::new(0),
            abort: Mutex::new(None),
            abort_flag: abort_tx,
        });
        DfuSession {
            target: DfuTarget {
                transport,
                shared,
                abort_rx,
            },
            firmware,
            sink,
            events: Some(events),
            total_sent: 0,
            progress: 0,
        }
    }

    /// Run the session to completion. The final result is always
    /// reported to the sink and teardown always runs, whichever exit
    /// path is taken.
    pub async fn run(mut self) -> Result<u32, DfuError> {
        let events = self.events.take().expect("event receiver");
        let pump = spawn_event_pump(events, self.target.shared.clone());

        let result = self.transfer().await;
        self.teardown().await;
        pump.abort();

        match &result {
            Ok(total_bytes) => {
                info!(total_bytes, "firmware transfer complete");
                self.sink.report_success(*total_bytes);
            }
            Err(e) => {
                warn!(category = e.category(), error = %e, "firmware transfer failed");
                self.sink.report_failure(e.category(), &e.to_string());
            }
        }
        result
    }

    async fn transfer(&mut self) -> Result<u32, DfuError> {
        self.target.shared.set_state(State::Connecting);
        self.sink.report_progress(0);

        self.target.transport.connect(true, true).await?;
        self.target.transport.discover_services().await?;
        self.target.transport.set_progress_notifications(true).await?;

        let total_bytes = self.firmware.image().total_bytes;
        let blocks = self.firmware.image().blocks.clone();
        info!(
            blocks = blocks.len(),
            total_bytes, "starting firmware transfer"
        );

        self.target.send_command(Command::Restart, 0, 0).await?;
        self.check_mtu()?;

        for header in &blocks {
            self.write_block(header, total_bytes).await?;
        }

        self.target.shared.set_state(State::Ending);
        self.target.send_command(Command::Done, 0, 0).await?;
        self.target.send_command(Command::Reset, 0, 0).await?;
        // drain the window; the device never replies to RESET
        self.target.acquire(MAX_IN_FLIGHT as u32).await?;
        self.target.shared.set_state(State::Disconnecting);

        Ok(total_bytes)
    }

    async fn write_block(&mut self, header: &BlockHeader, total_bytes: u32) -> Result<(), DfuError> {
        self.target.checkpoint()?;
        let length = header.payload_len();
        let block_addr = header.addr;
        debug!(
            addr = format_args!("{block_addr:#x}"),
            length, "writing block"
        );

        self.target
            .send_command(Command::Iv, IV_LEN as u16, 0)
            .await?;
        self.target.write_data(&header.init_vector).await?;
        self.target
            .send_command(Command::Data, length as u16, block_addr)
            .await?;
        self.target.shared.set_resync_target(block_addr + length);

        let mut cursor = self.firmware.start_block(header)?;
        let mut count: u32 = 0;
        let mut addr = block_addr;
        let mut region = addr / CHUNK_ALIGNMENT;
        while count != length {
            self.target.checkpoint()?;
            let balance = (length - count).min(MAX_CHUNK as u32);
            let mut buffer = vec![0u8; 4 + balance as usize];
            buffer[..4].copy_from_slice(&addr.to_le_bytes());
            cursor.seek(count)?;
            cursor.read(&mut buffer[4..])?;
            self.target.write_data(&buffer).await?;
            count += balance;
            addr += balance;
            self.total_sent += balance;

            // let the device report its absorbed position at the end of
            // the block and on every flash page boundary
            if count == length || addr / CHUNK_ALIGNMENT != region {
                region = addr / CHUNK_ALIGNMENT;
                self.target
                    .send_command(Command::Ping, count as u16, 0)
                    .await?;
            }

            let pct = (self.total_sent as u64 * 100 / total_bytes as u64) as u32;
            if pct > self.progress {
                self.progress = pct;
                self.sink.report_progress(pct);
            }

            if let Some(rewound) = self
                .target
                .shared
                .check_resync(addr, block_addr, block_addr + length)?
            {
                self.total_sent -= addr - rewound;
                addr = rewound;
                count = addr - block_addr;
                region = addr / CHUNK_ALIGNMENT;
            }
        }
        drop(cursor);

        self.target
            .send_command(Command::Digest, length as u16, block_addr)
            .await?;
        self.target.write_data(&header.digest).await?;
        debug!(addr = format_args!("{block_addr:#x}"), "block complete");
        Ok(())
    }

    /// The device needs one chunk plus its address prefix and the ATT
    /// write header to fit in a single write.
    fn check_mtu(&self) -> Result<(), DfuError> {
        let required = (MAX_CHUNK + 4 + 3) as u32;
        let mtu = self.target.shared.mtu.load(Ordering::Relaxed);
        if mtu == 0 {
            warn!("transport did not report an MTU, continuing");
        } else if mtu < required {
            return Err(DfuError::InsufficientMtu { mtu, required });
        }
        Ok(())
    }

    async fn teardown(&mut self) {
        self.target.shared.set_state(State::Disconnecting);
        self.firmware.close();
        match tokio::time::timeout(DISCONNECT_TIMEOUT, self.target.transport.disconnect()).await {
            Ok(Ok(())) => debug!("disconnected"),
            Ok(Err(e)) => warn!(error = %e, "disconnect request failed"),
            Err(_) => warn!("disconnect request timed out"),
        }
    }
}

/// Consume transport events and fold them into the shared state. Runs
/// on its own task so the engine only ever blocks on the credit window.
fn spawn_event_pump(mut events: EventReceiver, shared: Arc<Shared>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::Connected => debug!("transport connected"),
                TransportEvent::ServicesDiscovered => {
                    debug!("services discovered, opening credit window");
                    shared.set_state(State::Writing);
                    shared.credits.add_permits(MAX_IN_FLIGHT);
                }
                TransportEvent::WriteCompleted => {
                    shared.credits.add_permits(1);
                }
                TransportEvent::Notification(payload) => shared.handle_notification(&payload),
                TransportEvent::MtuChanged(mtu) => {
                    debug!(mtu, "mtu changed");
                    shared.mtu.store(mtu, Ordering::Relaxed);
                }
                TransportEvent::Disconnected => {
                    if shared.state() != State::Disconnecting {
                        warn!("unexpected disconnect");
                        shared.abort(DfuError::Connection("unexpected disconnect".into()));
                    }
                }
                TransportEvent::Error(message) => {
                    shared.abort(DfuError::Connection(message));
                }
            }
        }
    })
}
