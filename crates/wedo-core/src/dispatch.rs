//! Command dispatch and acknowledgement correlation.
//!
//! One writer task per hub drains a FIFO of encoded frames and performs
//! exactly one transport write at a time. Correlated opcodes get a one-byte
//! identifier that is registered before the frame is queued, so an ack can
//! never arrive for an identifier the table does not know yet.
//!
//! Identifiers that timed out or whose caller went away are parked in a
//! quarantine ring and not reissued until they fall out of it, as are those
//! of failed writes. An ack that arrives for a quarantined identifier is
//! reported as late and dropped.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use crate::config::HubConfig;
use crate::events::{HubEvent, HubObserver, PacketDirection};
use crate::port::PortState;
use crate::protocol::codec::HexBytes;
use crate::protocol::{AckPolicy, Command, EncodeError, Endpoint, FrameCodec, Opcode};
use crate::transport::{HubTransport, TransportError};

/// Recently retired identifiers kept out of circulation.
pub const RETIRED_CAPACITY: usize = 32;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Port {port} is not ready ({state})")]
    PortNotReady { port: u8, state: PortState },

    #[error("Device on port {port} was detached")]
    DeviceDetached { port: u8 },

    #[error("No acknowledgement for {opcode} seq={correlation} within {timeout_ms}ms")]
    Timeout {
        opcode: Opcode,
        correlation: u8,
        timeout_ms: u64,
    },

    #[error("Transport failure after {attempts} attempt(s): {message}")]
    TransportFailure { attempts: u32, message: String },

    #[error("Hub rejected {opcode} seq={correlation}: {name} (0x{code:02X})")]
    Rejected {
        opcode: Opcode,
        correlation: u8,
        code: u8,
        name: &'static str,
    },

    #[error("Hub disconnected")]
    HubDisconnected,

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("All correlation identifiers are in use")]
    CorrelationExhausted,
}

impl From<EncodeError> for DispatchError {
    fn from(e: EncodeError) -> Self {
        match e {
            EncodeError::UnsupportedOpcode { .. }
            | EncodeError::UnsupportedMessage { .. }
            | EncodeError::MissingCorrelation(_) => DispatchError::Unsupported(e.to_string()),
            other => DispatchError::InvalidParameter(other.to_string()),
        }
    }
}

/// Positive outcome of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub port: u8,
    pub opcode: Opcode,
    /// `None` for fire-and-forget opcodes, which resolve on write.
    pub correlation: Option<u8>,
}

impl fmt::Display for Ack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} port={}", self.opcode, self.port)?;
        if let Some(id) = self.correlation {
            write!(f, " seq={}", id)?;
        }
        Ok(())
    }
}

/// What happened to an inbound ack or error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    Resolved,
    Late,
    Unknown,
}

struct PendingAck {
    port: u8,
    opcode: Opcode,
    reply: oneshot::Sender<Result<Ack, DispatchError>>,
}

struct CorrelationTable {
    next: u8,
    pending: HashMap<u8, PendingAck>,
    retired: VecDeque<u8>,
    closed: bool,
}

impl CorrelationTable {
    fn new() -> Self {
        Self {
            next: 1,
            pending: HashMap::new(),
            retired: VecDeque::with_capacity(RETIRED_CAPACITY),
            closed: false,
        }
    }

    fn allocate(&mut self) -> Option<u8> {
        for _ in 0..=u8::MAX {
            let id = self.next;
            self.next = self.next.wrapping_add(1);
            if !self.pending.contains_key(&id) && !self.retired.contains(&id) {
                return Some(id);
            }
        }
        None
    }

    /// Move a still-pending identifier into quarantine.
    fn retire(&mut self, id: u8) -> bool {
        if self.pending.remove(&id).is_none() {
            return false;
        }
        if self.retired.len() == RETIRED_CAPACITY {
            self.retired.pop_front();
        }
        self.retired.push_back(id);
        true
    }
}

struct WriteRequest {
    endpoint: Endpoint,
    frame: Vec<u8>,
    label: String,
    correlation: Option<u8>,
    written: oneshot::Sender<Result<(), DispatchError>>,
}

/// A command that has been accepted and queued.
///
/// Await [`Submission::resolve`] for the outcome. Dropping it before the
/// write takes it off the queue; dropping it after retires its identifier.
pub struct Submission {
    port: u8,
    opcode: Opcode,
    correlation: Option<u8>,
    ack_timeout: Duration,
    written: oneshot::Receiver<Result<(), DispatchError>>,
    ack: Option<oneshot::Receiver<Result<Ack, DispatchError>>>,
    table: Arc<Mutex<CorrelationTable>>,
}

impl Submission {
    pub fn port(&self) -> u8 {
        self.port
    }

    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    pub fn correlation(&self) -> Option<u8> {
        self.correlation
    }

    /// Wait for the write, then (for correlated opcodes) the ack.
    ///
    /// The ack timeout starts once the frame is on the wire, so time spent
    /// queued behind other writes does not count against it.
    pub async fn resolve(mut self) -> Result<Ack, DispatchError> {
        match (&mut self.written).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(DispatchError::HubDisconnected),
        }

        let Some(mut ack) = self.ack.take() else {
            return Ok(Ack {
                port: self.port,
                opcode: self.opcode,
                correlation: None,
            });
        };

        match tokio::time::timeout(self.ack_timeout, &mut ack).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(DispatchError::HubDisconnected),
            Err(_) => {
                let correlation = self.correlation.unwrap_or_default();
                if !self.table.lock().retire(correlation) {
                    // Settled between the deadline and the lock.
                    if let Ok(result) = ack.try_recv() {
                        return result;
                    }
                }
                warn!(
                    port = self.port,
                    opcode = %self.opcode,
                    seq = correlation,
                    "Acknowledgement timed out"
                );
                Err(DispatchError::Timeout {
                    opcode: self.opcode,
                    correlation,
                    timeout_ms: self.ack_timeout.as_millis() as u64,
                })
            }
        }
    }
}

impl Drop for Submission {
    fn drop(&mut self) {
        if let Some(id) = self.correlation {
            if self.table.lock().retire(id) {
                debug!(port = self.port, seq = id, "Abandoned command, identifier retired");
            }
        }
    }
}

/// Single-writer command pipeline for one hub.
pub struct CommandDispatcher {
    codec: FrameCodec,
    ack_timeout: Duration,
    table: Arc<Mutex<CorrelationTable>>,
    writes: mpsc::UnboundedSender<WriteRequest>,
    cancel: CancellationToken,
    events: Arc<dyn HubObserver>,
}

impl CommandDispatcher {
    /// Create the dispatcher and spawn its writer task.
    ///
    /// Must be called inside a tokio runtime. The writer stops when `cancel`
    /// fires or [`CommandDispatcher::fail_all`] is called.
    pub fn spawn(
        transport: Arc<dyn HubTransport>,
        codec: FrameCodec,
        config: &HubConfig,
        events: Arc<dyn HubObserver>,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let table = Arc::new(Mutex::new(CorrelationTable::new()));
        let writer = Writer {
            transport,
            config: config.clone(),
            table: table.clone(),
            events: events.clone(),
        };
        tokio::spawn(writer.run(rx, cancel.clone()));

        Self {
            codec,
            ack_timeout: config.ack_timeout(),
            table,
            writes: tx,
            cancel,
            events,
        }
    }

    pub fn codec(&self) -> FrameCodec {
        self.codec
    }

    /// Validate, correlate, encode and queue `command`.
    ///
    /// Never awaits. The returned [`Submission`] resolves to the outcome.
    pub fn submit(&self, command: Command) -> Result<Submission, DispatchError> {
        let opcode = command.opcode();
        let port = command.port();
        let (policy, endpoint) = match (self.codec.ack_policy(opcode), self.codec.endpoint(opcode)) {
            (Some(policy), Some(endpoint)) => (policy, endpoint),
            _ => {
                return Err(DispatchError::Unsupported(format!(
                    "opcode {} is not in protocol table {}",
                    opcode,
                    self.codec.table().name
                )));
            }
        };
        self.codec.validate(&command)?;

        let mut table = self.table.lock();
        if table.closed {
            return Err(DispatchError::HubDisconnected);
        }

        let (command, ack) = match policy {
            AckPolicy::Correlated => {
                let id = table.allocate().ok_or(DispatchError::CorrelationExhausted)?;
                let (reply, rx) = oneshot::channel();
                table.pending.insert(
                    id,
                    PendingAck {
                        port,
                        opcode,
                        reply,
                    },
                );
                (command.with_correlation(id), Some(rx))
            }
            AckPolicy::FireAndForget => (command, None),
        };
        let correlation = command.correlation();

        let frame = match self.codec.encode(&command) {
            Ok(frame) => frame,
            Err(e) => {
                if let Some(id) = correlation {
                    table.pending.remove(&id);
                }
                return Err(e.into());
            }
        };

        let (written_tx, written_rx) = oneshot::channel();
        let request = WriteRequest {
            endpoint,
            frame,
            label: command.to_string(),
            correlation,
            written: written_tx,
        };
        // Queued while the table is locked, so identifier order is write order.
        if self.writes.send(request).is_err() {
            if let Some(id) = correlation {
                table.pending.remove(&id);
            }
            return Err(DispatchError::HubDisconnected);
        }
        drop(table);

        trace!(cmd = %command, "Command queued");
        Ok(Submission {
            port,
            opcode,
            correlation,
            ack_timeout: self.ack_timeout,
            written: written_rx,
            ack,
            table: self.table.clone(),
        })
    }

    /// Submit and wait for the outcome.
    #[instrument(skip(self, command), fields(cmd = %command))]
    pub async fn send(&self, command: Command) -> Result<Ack, DispatchError> {
        self.submit(command)?.resolve().await
    }

    /// `CommandAck` received.
    pub fn resolve_ack(&self, port: u8, correlation: u8) -> AckOutcome {
        let outcome = {
            let mut table = self.table.lock();
            match table.pending.remove(&correlation) {
                Some(pending) => {
                    let ack = Ack {
                        port: pending.port,
                        opcode: pending.opcode,
                        correlation: Some(correlation),
                    };
                    let _ = pending.reply.send(Ok(ack));
                    Ok(ack)
                }
                None if table.retired.contains(&correlation) => Err(AckOutcome::Late),
                None => Err(AckOutcome::Unknown),
            }
        };

        match outcome {
            Ok(ack) => {
                debug!(ack = %ack, "Command acknowledged");
                self.events.on_event(&HubEvent::AckReceived {
                    port: ack.port,
                    opcode: ack.opcode,
                    correlation,
                });
                AckOutcome::Resolved
            }
            Err(AckOutcome::Late) => {
                debug!(port, seq = correlation, "Late acknowledgement discarded");
                self.events
                    .on_event(&HubEvent::LateAck { port, correlation });
                AckOutcome::Late
            }
            Err(other) => {
                warn!(port, seq = correlation, "Acknowledgement for unknown identifier");
                other
            }
        }
    }

    /// `Error` received: the command with `correlation` was rejected.
    pub fn resolve_error(&self, port: u8, correlation: u8, code: u8) -> AckOutcome {
        let name = self.codec.table().error_name(code);
        let outcome = {
            let mut table = self.table.lock();
            match table.pending.remove(&correlation) {
                Some(pending) => {
                    let _ = pending.reply.send(Err(DispatchError::Rejected {
                        opcode: pending.opcode,
                        correlation,
                        code,
                        name,
                    }));
                    AckOutcome::Resolved
                }
                None if table.retired.contains(&correlation) => AckOutcome::Late,
                None => AckOutcome::Unknown,
            }
        };

        warn!(port, seq = correlation, code = %format!("0x{:02X}", code), error = name, "Command rejected");
        self.events.on_event(&HubEvent::CommandRejected {
            port,
            correlation,
            code,
        });
        outcome
    }

    /// Number of commands waiting for an ack.
    pub fn pending(&self) -> usize {
        self.table.lock().pending.len()
    }

    /// Hub gone: fail everything in flight and refuse new work.
    pub fn fail_all(&self) {
        let pending: Vec<PendingAck> = {
            let mut table = self.table.lock();
            table.closed = true;
            table.pending.drain().map(|(_, p)| p).collect()
        };
        if !pending.is_empty() {
            info!(count = pending.len(), "Failing pending commands");
        }
        for p in pending {
            let _ = p.reply.send(Err(DispatchError::HubDisconnected));
        }
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.table.lock().closed
    }
}

struct Writer {
    transport: Arc<dyn HubTransport>,
    config: HubConfig,
    table: Arc<Mutex<CorrelationTable>>,
    events: Arc<dyn HubObserver>,
}

impl Writer {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<WriteRequest>, cancel: CancellationToken) {
        loop {
            let request = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                request = rx.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
            };

            if request.written.is_closed() {
                trace!(cmd = %request.label, "Caller gone, write skipped");
                continue;
            }

            let result = self.write_with_retry(&request).await;
            match &result {
                Ok(()) => {
                    self.events.on_event(&HubEvent::Packet {
                        direction: PacketDirection::Tx,
                        label: request.label.clone(),
                        length: request.frame.len(),
                        data: Some(request.frame.clone()),
                    });
                }
                Err(e) => {
                    warn!(cmd = %request.label, error = %e, "Write failed");
                    // A timed-out write may still have reached the hub.
                    if let Some(id) = request.correlation {
                        self.table.lock().retire(id);
                    }
                }
            }
            let _ = request.written.send(result);
        }

        rx.close();
        while let Ok(request) = rx.try_recv() {
            if let Some(id) = request.correlation {
                self.table.lock().retire(id);
            }
            let _ = request.written.send(Err(DispatchError::HubDisconnected));
        }
        debug!("Writer stopped");
    }

    async fn write_with_retry(&self, request: &WriteRequest) -> Result<(), DispatchError> {
        let mut attempt: u32 = 0;
        loop {
            let result = match tokio::time::timeout(
                self.config.write_timeout(),
                self.transport.write(request.endpoint, &request.frame),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout {
                    timeout_ms: self.config.write_timeout_ms,
                }),
            };

            match result {
                Ok(()) => {
                    trace!(cmd = %request.label, frame = %HexBytes(&request.frame), "Frame written");
                    return Ok(());
                }
                Err(TransportError::Disconnected) => return Err(DispatchError::HubDisconnected),
                Err(e) if attempt < self.config.write_retries => {
                    let backoff = self.config.retry_backoff(attempt);
                    warn!(
                        cmd = %request.label,
                        attempt = attempt + 1,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Write failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(DispatchError::TransportFailure {
                        attempts: attempt + 1,
                        message: e.to_string(),
                    });
                }
            }
        }
    }
}
