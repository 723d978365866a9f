//! Scripted hub transport for testing.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};

use super::traits::{HubDescriptor, HubScanner, HubTransport, NotificationStream, TransportError};
use crate::device::DeviceKind;
use crate::protocol::{Command, CommandKind, Endpoint, FrameCodec, Message};

#[derive(Default)]
struct MockState {
    /// Captured writes.
    writes: Vec<(Endpoint, Vec<u8>)>,
    /// Every write call, failed ones included.
    attempts: usize,
    fail_next: usize,
    auto_ack: bool,
    write_delay: Option<Duration>,
}

/// Mock transport that records writes and injects notifications.
///
/// With auto-ack enabled it answers correlated commands like a hub would:
/// a `CommandAck` for each, plus a `PortInfo` after a port setup.
pub struct MockTransport {
    address: String,
    codec: FrameCodec,
    state: Mutex<MockState>,
    sender: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    receiver: Mutex<Option<NotificationStream>>,
    connected: AtomicBool,
    written: Notify,
}

impl MockTransport {
    pub fn new(address: impl Into<String>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            address: address.into(),
            codec: FrameCodec::default(),
            state: Mutex::new(MockState::default()),
            sender: Mutex::new(Some(tx)),
            receiver: Mutex::new(Some(rx)),
            connected: AtomicBool::new(true),
            written: Notify::new(),
        }
    }

    /// Get all captured writes.
    pub fn writes(&self) -> Vec<(Endpoint, Vec<u8>)> {
        self.state.lock().writes.clone()
    }

    /// Captured writes decoded back into commands.
    pub fn commands(&self) -> Vec<Command> {
        self.writes()
            .iter()
            .filter_map(|(_, frame)| self.codec.decode_command(frame).ok())
            .collect()
    }

    /// Clear captured writes.
    pub fn clear_writes(&self) {
        self.state.lock().writes.clear();
    }

    pub fn write_attempts(&self) -> usize {
        self.state.lock().attempts
    }

    /// Make the next `count` writes fail.
    pub fn fail_next_writes(&self, count: usize) {
        self.state.lock().fail_next = count;
    }

    pub fn set_auto_ack(&self, enabled: bool) {
        self.state.lock().auto_ack = enabled;
    }

    /// Delay every write by `delay`.
    pub fn set_write_delay(&self, delay: Option<Duration>) {
        self.state.lock().write_delay = delay;
    }

    /// Push raw bytes onto the notification stream.
    pub fn inject(&self, bytes: &[u8]) {
        if let Some(tx) = self.sender.lock().as_ref() {
            let _ = tx.send(bytes.to_vec());
        }
    }

    /// Encode `message` as the hub would and push it.
    pub fn inject_message(&self, message: &Message) {
        match self.codec.encode_message(message) {
            Ok(frame) => self.inject(&frame),
            Err(e) => tracing::error!(error = %e, "Mock could not encode message"),
        }
    }

    pub fn attach(&self, port: u8, kind: DeviceKind) {
        self.inject_message(&Message::PortAttached { port, kind });
    }

    pub fn detach(&self, port: u8) {
        self.inject_message(&Message::PortDetached { port });
    }

    pub fn port_info(&self, port: u8, mode: u8, format: u8) {
        self.inject_message(&Message::PortInfo { port, mode, format });
    }

    pub fn sensor(&self, port: u8, payload: &[u8]) {
        self.inject_message(&Message::SensorValue {
            port,
            payload: payload.to_vec(),
        });
    }

    pub fn ack(&self, port: u8, correlation: u8) {
        self.inject_message(&Message::CommandAck { port, correlation });
    }

    pub fn error(&self, port: u8, correlation: u8, code: u8) {
        self.inject_message(&Message::Error {
            port,
            correlation,
            code,
        });
    }

    /// Simulate link loss: writes fail and the notification stream ends.
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.sender.lock().take();
    }

    /// Wait until at least `count` writes were captured.
    pub async fn wait_for_writes(&self, count: usize) -> Vec<(Endpoint, Vec<u8>)> {
        loop {
            let notified = self.written.notified();
            {
                let state = self.state.lock();
                if state.writes.len() >= count {
                    return state.writes.clone();
                }
            }
            notified.await;
        }
    }

    fn answer(&self, data: &[u8]) {
        let Ok(command) = self.codec.decode_command(data) else {
            return;
        };
        let Some(correlation) = command.correlation() else {
            return;
        };
        let port = command.port();
        if let CommandKind::PortSetup { mode, format, .. } = command.kind() {
            self.port_info(port, *mode, *format);
        }
        self.ack(port, correlation);
    }
}

#[async_trait]
impl HubTransport for MockTransport {
    async fn write(&self, endpoint: Endpoint, data: &[u8]) -> Result<(), TransportError> {
        let delay = self.state.lock().write_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }

        let auto_ack = {
            let mut state = self.state.lock();
            state.attempts += 1;
            if state.fail_next > 0 {
                state.fail_next -= 1;
                return Err(TransportError::WriteFailed("injected failure".into()));
            }
            state.writes.push((endpoint, data.to_vec()));
            state.auto_ack
        };
        self.written.notify_waiters();

        if auto_ack {
            self.answer(data);
        }
        Ok(())
    }

    fn notifications(&self) -> Result<NotificationStream, TransportError> {
        self.receiver.lock().take().ok_or(TransportError::StreamTaken)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn address(&self) -> String {
        self.address.clone()
    }
}

/// Scanner over a fixed set of mock hubs.
#[derive(Default)]
pub struct MockScanner {
    hubs: Mutex<Vec<(HubDescriptor, Arc<MockTransport>)>>,
}

impl MockScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advertise a hub named `name`; returns its transport for scripting.
    pub fn add_hub(&self, address: &str, name: &str) -> Arc<MockTransport> {
        let transport = Arc::new(MockTransport::new(address));
        self.hubs.lock().push((
            HubDescriptor {
                address: address.to_string(),
                name: name.to_string(),
            },
            transport.clone(),
        ));
        transport
    }
}

#[async_trait]
impl HubScanner for MockScanner {
    async fn scan(&self, _timeout: Duration) -> Result<Vec<HubDescriptor>, TransportError> {
        Ok(self.hubs.lock().iter().map(|(d, _)| d.clone()).collect())
    }

    async fn connect(&self, hub: &HubDescriptor) -> Result<Arc<dyn HubTransport>, TransportError> {
        let found = self
            .hubs
            .lock()
            .iter()
            .find(|(d, _)| d.address == hub.address)
            .map(|(_, t)| t.clone());
        match found {
            Some(transport) => Ok(transport),
            None => Err(TransportError::ConnectFailed {
                address: hub.address.clone(),
                message: "unknown hub".into(),
            }),
        }
    }
}
