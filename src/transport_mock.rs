//! Scriptable mock transport for exercising the protocol engine.
//!
//! Captures every characteristic write, acknowledges control writes and
//! completes discovery immediately unless told otherwise, and can inject
//! transport events after chosen data writes to simulate device
//! notifications, disconnects and errors mid-transfer.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::transport::{DfuTransport, EventReceiver, EventSender, TransportError, TransportEvent};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockWrite {
    Ctrl(Vec<u8>),
    Data(Vec<u8>),
}

impl MockWrite {
    pub fn bytes(&self) -> &[u8] {
        match self {
            MockWrite::Ctrl(bytes) | MockWrite::Data(bytes) => bytes,
        }
    }
}

#[derive(Default)]
struct Inner {
    writes: Vec<MockWrite>,
    data_write_count: usize,
    disconnect_requested: bool,
    inject_after_data: HashMap<usize, Vec<TransportEvent>>,
    inject_every_data: Option<TransportEvent>,
}

pub struct MockTransport {
    events: EventSender,
    inner: Mutex<Inner>,
    config: Mutex<Config>,
}

struct Config {
    ack_ctrl: bool,
    complete_discovery: bool,
    mtu: Option<u32>,
}

impl MockTransport {
    pub fn new() -> (Self, EventReceiver) {
        let (events, receiver) = mpsc::unbounded_channel();
        let mock = MockTransport {
            events,
            inner: Mutex::new(Inner::default()),
            config: Mutex::new(Config {
                ack_ctrl: true,
                complete_discovery: true,
                mtu: Some(247),
            }),
        };
        (mock, receiver)
    }

    /// Acknowledge control writes with a `WriteCompleted` event
    /// (default true).
    pub fn set_ack_ctrl(&self, ack: bool) {
        self.config.lock().unwrap().ack_ctrl = ack;
    }

    /// Emit `ServicesDiscovered` when discovery is requested
    /// (default true).
    pub fn set_complete_discovery(&self, complete: bool) {
        self.config.lock().unwrap().complete_discovery = complete;
    }

    /// MTU reported on connect; `None` reports nothing (default 247).
    pub fn set_mtu(&self, mtu: Option<u32>) {
        self.config.lock().unwrap().mtu = mtu;
    }

    /// Inject `event` right after the `index`-th data-channel write
    /// (0-based, counting all data writes including init vectors).
    pub fn inject_after_data_write(&self, index: usize, event: TransportEvent) {
        self.inner
            .lock()
            .unwrap()
            .inject_after_data
            .entry(index)
            .or_default()
            .push(event);
    }

    /// Inject a copy of `event` after every data-channel write.
    pub fn inject_after_every_data_write(&self, event: TransportEvent) {
        self.inner.lock().unwrap().inject_every_data = Some(event);
    }

    /// All writes, control and data interleaved in request order.
    pub fn writes(&self) -> Vec<MockWrite> {
        self.inner.lock().unwrap().writes.clone()
    }

    pub fn ctrl_writes(&self) -> Vec<Vec<u8>> {
        self.inner
            .lock()
            .unwrap()
            .writes
            .iter()
            .filter_map(|w| match w {
                MockWrite::Ctrl(bytes) => Some(bytes.clone()),
                MockWrite::Data(_) => None,
            })
            .collect()
    }

    pub fn data_writes(&self) -> Vec<Vec<u8>> {
        self.inner
            .lock()
            .unwrap()
            .writes
            .iter()
            .filter_map(|w| match w {
                MockWrite::Data(bytes) => Some(bytes.clone()),
                MockWrite::Ctrl(_) => None,
            })
            .collect()
    }

    pub fn disconnect_requested(&self) -> bool {
        self.inner.lock().unwrap().disconnect_requested
    }

    fn send(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }
}

/// Give the engine's event pump a chance to drain whatever the mock
/// just emitted before the caller resumes.
async fn settle() {
    for _ in 0..4 {
        tokio::task::yield_now().await;
    }
}

#[async_trait]
impl DfuTransport for MockTransport {
    async fn connect(
        &self,
        _auto_reconnect: bool,
        _high_priority: bool,
    ) -> Result<(), TransportError> {
        let mtu = self.config.lock().unwrap().mtu;
        self.send(TransportEvent::Connected);
        if let Some(mtu) = mtu {
            self.send(TransportEvent::MtuChanged(mtu));
        }
        settle().await;
        Ok(())
    }

    async fn discover_services(&self) -> Result<(), TransportError> {
        if self.config.lock().unwrap().complete_discovery {
            self.send(TransportEvent::ServicesDiscovered);
        }
        settle().await;
        Ok(())
    }

    async fn set_progress_notifications(&self, _enabled: bool) -> Result<(), TransportError> {
        Ok(())
    }

    async fn write_ctrl(&self, bytes: &[u8]) -> Result<(), TransportError> {
        self.inner
            .lock()
            .unwrap()
            .writes
            .push(MockWrite::Ctrl(bytes.to_vec()));
        if self.config.lock().unwrap().ack_ctrl {
            self.send(TransportEvent::WriteCompleted);
        }
        settle().await;
        Ok(())
    }

    async fn write_data(&self, bytes: &[u8]) -> Result<(), TransportError> {
        let injections = {
            let mut inner = self.inner.lock().unwrap();
            inner.writes.push(MockWrite::Data(bytes.to_vec()));
            let index = inner.data_write_count;
            inner.data_write_count += 1;
            let mut injections = inner.inject_after_data.remove(&index).unwrap_or_default();
            if let Some(event) = &inner.inject_every_data {
                injections.push(event.clone());
            }
            injections
        };
        for event in injections {
            self.send(event);
        }
        settle().await;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.inner.lock().unwrap().disconnect_requested = true;
        self.send(TransportEvent::Disconnected);
        settle().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_writes_in_order() {
        let (mock, _events) = MockTransport::new();
        mock.write_ctrl(&[1, 2]).await.unwrap();
        mock.write_data(&[3, 4, 5]).await.unwrap();
        assert_eq!(
            mock.writes(),
            vec![MockWrite::Ctrl(vec![1, 2]), MockWrite::Data(vec![3, 4, 5])]
        );
        assert_eq!(mock.ctrl_writes(), vec![vec![1, 2]]);
        assert_eq!(mock.data_writes(), vec![vec![3, 4, 5]]);
    }

    #[tokio::test]
    async fn injects_scripted_events() {
        let (mock, mut events) = MockTransport::new();
        mock.set_ack_ctrl(false);
        mock.inject_after_data_write(1, TransportEvent::Notification(vec![2]));
        mock.write_data(&[0]).await.unwrap();
        mock.write_data(&[1]).await.unwrap();
        assert!(matches!(
            events.try_recv(),
            Ok(TransportEvent::Notification(_))
        ));
        assert!(events.try_recv().is_err());
    }
}
