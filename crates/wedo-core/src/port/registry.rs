//! Per-hub port table.
//!
//! All state sits behind one `parking_lot::Mutex`; every method is
//! synchronous and returns before anything awaits. Lifecycle events are
//! collected while the lock is held and reported after it is released.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};

use super::state::{PortInfo, PortState};
use crate::config::QueueMode;
use crate::device::{Device, DeviceKind, Value};
use crate::dispatch::{DispatchError, Submission};
use crate::events::{HubEvent, HubObserver};
use crate::protocol::{Command, ProtocolTable};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Port {0} does not exist")]
    UnknownPort(u8),
    #[error("Port {port} is not ready ({state})")]
    PortNotReady { port: u8, state: PortState },
    #[error("Device on port {port} was detached")]
    DeviceDetached { port: u8 },
    #[error("Port {port} already has a device bound")]
    AlreadyBound { port: u8 },
    #[error("Port {port} holds kind {actual}, expected {expected}")]
    KindMismatch {
        port: u8,
        expected: DeviceKind,
        actual: DeviceKind,
    },
}

impl From<RegistryError> for DispatchError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::UnknownPort(port) => {
                DispatchError::InvalidParameter(format!("port {} does not exist", port))
            }
            RegistryError::PortNotReady { port, state } => {
                DispatchError::PortNotReady { port, state }
            }
            RegistryError::DeviceDetached { port } => DispatchError::DeviceDetached { port },
            other => DispatchError::Unsupported(other.to_string()),
        }
    }
}

/// Command parked until its port finishes attaching.
pub struct QueuedCommand {
    pub command: Command,
    pub reply: oneshot::Sender<Result<Submission, DispatchError>>,
}

impl QueuedCommand {
    pub fn new(command: Command) -> (Self, oneshot::Receiver<Result<Submission, DispatchError>>) {
        let (reply, rx) = oneshot::channel();
        (Self { command, reply }, rx)
    }

    fn fail(self, error: DispatchError) {
        // The caller may have given up already.
        let _ = self.reply.send(Err(error));
    }
}

/// Result of [`PortRegistry::admit`].
pub enum Admission {
    /// Port was attached, the command went straight to the dispatcher.
    Submitted(Submission),
    /// Port is still attaching; the receiver yields the submission once the
    /// queue is flushed, or the reason it never will be.
    Queued(oneshot::Receiver<Result<Submission, DispatchError>>),
}

#[derive(Default)]
struct Port {
    state: PortState,
    value: Option<Value>,
    info: Option<PortInfo>,
    binding: Option<Device>,
    queue: VecDeque<QueuedCommand>,
}

type Transition = (u8, PortState, PortState);

pub struct PortRegistry {
    table: &'static ProtocolTable,
    ports: Mutex<Vec<Port>>,
    /// Set by teardown while `ports` is locked; nothing is admitted after.
    closed: AtomicBool,
    events: Arc<dyn HubObserver>,
}

impl PortRegistry {
    pub fn new(table: &'static ProtocolTable, events: Arc<dyn HubObserver>) -> Self {
        let ports = (0..table.port_count).map(|_| Port::default()).collect();
        Self {
            table,
            ports: Mutex::new(ports),
            closed: AtomicBool::new(false),
            events,
        }
    }

    pub fn port_count(&self) -> u8 {
        self.table.port_count
    }

    /// Run `f` under the lock, then report the transitions it recorded.
    fn with_ports<R>(&self, f: impl FnOnce(&mut [Port], &mut Vec<Transition>) -> R) -> R {
        let mut changes = Vec::new();
        let result = {
            let mut ports = self.ports.lock();
            f(&mut ports, &mut changes)
        };
        for (port, from, to) in changes {
            self.events
                .on_event(&HubEvent::PortStateChanged { port, from, to });
        }
        result
    }

    fn check_port(&self, port: u8) -> Result<usize, RegistryError> {
        if self.table.is_port(port) {
            Ok(usize::from(port))
        } else {
            Err(RegistryError::UnknownPort(port))
        }
    }

    pub fn get(&self, port: u8) -> Result<PortState, RegistryError> {
        let idx = self.check_port(port)?;
        Ok(self.ports.lock()[idx].state)
    }

    pub fn info(&self, port: u8) -> Option<PortInfo> {
        let idx = self.check_port(port).ok()?;
        self.ports.lock()[idx].info
    }

    pub fn binding(&self, port: u8) -> Option<Device> {
        let idx = self.check_port(port).ok()?;
        self.ports.lock()[idx].binding.clone()
    }

    pub fn queued(&self, port: u8) -> usize {
        self.check_port(port)
            .map(|idx| self.ports.lock()[idx].queue.len())
            .unwrap_or(0)
    }

    /// `PortAttached` received. A port that is not empty is detached first.
    ///
    /// Returns `true` when a device bound to the port lost its binding, so
    /// anything keyed on that device must be dropped too.
    pub fn on_attach(&self, port: u8, kind: DeviceKind) -> Result<bool, RegistryError> {
        let idx = self.check_port(port)?;
        let unbound = self.with_ports(|ports, changes| {
            let slot = &mut ports[idx];
            let was_bound = slot.binding.is_some();
            if !slot.state.is_empty() {
                warn!(port, old = %slot.state, new = %kind, "Attach on occupied port, detaching first");
                detach(port, slot, changes, DispatchError::DeviceDetached { port });
            }

            // A device bound ahead of time only survives if the kind matches.
            if let Some(pending) = &slot.binding {
                if pending.kind() != kind {
                    warn!(port, expected = %pending.kind(), actual = %kind, "Pending device kind mismatch");
                    slot.binding = None;
                    for queued in slot.queue.drain(..) {
                        queued.fail(DispatchError::DeviceDetached { port });
                    }
                }
            }

            set_state(port, slot, PortState::Attaching { kind }, changes);
            info!(port, kind = %kind, name = self.table.device_name(kind), "Port attaching");
            was_bound && slot.binding.is_none()
        });
        Ok(unbound)
    }

    /// Finish attaching and flush queued commands through `submit`.
    ///
    /// Returns how many queued commands were flushed.
    pub fn mark_attached<F>(&self, port: u8, submit: F) -> Result<usize, RegistryError>
    where
        F: FnMut(Command) -> Result<Submission, DispatchError>,
    {
        let idx = self.check_port(port)?;
        self.with_ports(|ports, changes| {
            let slot = &mut ports[idx];
            match slot.state {
                PortState::Attaching { kind } => {
                    set_state(port, slot, PortState::Attached { kind }, changes);
                    Ok(flush(port, slot, submit))
                }
                PortState::Attached { .. } => Ok(0),
                state => Err(RegistryError::PortNotReady { port, state }),
            }
        })
    }

    /// `PortInfo` received. Completes a pending attach; on an attached port
    /// it only refreshes the cached info.
    ///
    /// Returns `Some(flushed)` when the port became attached.
    pub fn on_info<F>(
        &self,
        port: u8,
        info: PortInfo,
        submit: F,
    ) -> Result<Option<usize>, RegistryError>
    where
        F: FnMut(Command) -> Result<Submission, DispatchError>,
    {
        let idx = self.check_port(port)?;
        self.with_ports(|ports, changes| {
            let slot = &mut ports[idx];
            match slot.state {
                PortState::Attaching { kind } => {
                    slot.info = Some(info);
                    set_state(port, slot, PortState::Attached { kind }, changes);
                    Ok(Some(flush(port, slot, submit)))
                }
                PortState::Attached { .. } => {
                    slot.info = Some(info);
                    Ok(None)
                }
                state => Err(RegistryError::PortNotReady { port, state }),
            }
        })
    }

    /// `PortDetached` received. Queued callers get `DeviceDetached`.
    ///
    /// Returns `false` if the port was already empty.
    pub fn on_detach(&self, port: u8) -> Result<bool, RegistryError> {
        let idx = self.check_port(port)?;
        Ok(self.with_ports(|ports, changes| {
            let slot = &mut ports[idx];
            if slot.state.is_empty() {
                debug!(port, "Detach on empty port ignored");
                return false;
            }
            detach(port, slot, changes, DispatchError::DeviceDetached { port });
            true
        }))
    }

    /// Bind `device` to its port.
    ///
    /// With [`QueueMode::Queue`] a device may be bound before its port is
    /// attached; with [`QueueMode::FailFast`] the port must be attached.
    pub fn bind(&self, device: &Device, mode: QueueMode) -> Result<(), RegistryError> {
        let port = device.port();
        let idx = self.check_port(port)?;
        let mut ports = self.ports.lock();
        let slot = &mut ports[idx];
        bind_slot(port, slot, device, mode)
    }

    /// Device bound to an attached port, binding a new one if needed.
    pub fn device_for(&self, port: u8) -> Result<Device, RegistryError> {
        let idx = self.check_port(port)?;
        let mut ports = self.ports.lock();
        let slot = &mut ports[idx];
        let PortState::Attached { kind } = slot.state else {
            return Err(RegistryError::PortNotReady {
                port,
                state: slot.state,
            });
        };
        if let Some(device) = &slot.binding {
            return Ok(device.clone());
        }
        let device = Device::new(port, kind, self.table.capabilities(kind));
        slot.binding = Some(device.clone());
        debug!(port, device = %device.id(), kind = %kind, "Device bound");
        Ok(device)
    }

    /// Bind a device for `kind` ahead of the attach (or to the attached port
    /// when it already matches).
    pub fn expect(&self, port: u8, kind: DeviceKind, mode: QueueMode) -> Result<Device, RegistryError> {
        let idx = self.check_port(port)?;
        let mut ports = self.ports.lock();
        let slot = &mut ports[idx];
        if let Some(device) = &slot.binding {
            if device.kind() == kind {
                return Ok(device.clone());
            }
            return Err(RegistryError::AlreadyBound { port });
        }
        let device = Device::new(port, kind, self.table.capabilities(kind));
        bind_slot(port, slot, &device, mode)?;
        Ok(device)
    }

    /// Check that `device` is still the one bound to its port.
    pub fn check_bound(&self, device: &Device) -> Result<PortState, RegistryError> {
        let port = device.port();
        let idx = self.check_port(port)?;
        let ports = self.ports.lock();
        let slot = &ports[idx];
        match &slot.binding {
            Some(bound) if bound.id() == device.id() => Ok(slot.state),
            _ => Err(RegistryError::DeviceDetached { port }),
        }
    }

    /// Submit `command` for `device` if its port is attached, otherwise queue
    /// it (or fail, per `mode`).
    ///
    /// Submission happens under the registry lock so a command admitted now
    /// can never overtake commands flushed by a concurrent attach.
    pub fn admit<F>(
        &self,
        device: &Device,
        command: Command,
        mode: QueueMode,
        submit: F,
    ) -> Result<Admission, DispatchError>
    where
        F: FnOnce(Command) -> Result<Submission, DispatchError>,
    {
        let port = device.port();
        let idx = self.check_port(port)?;
        let mut ports = self.ports.lock();
        if self.closed.load(Ordering::SeqCst) {
            return Err(DispatchError::HubDisconnected);
        }
        let slot = &mut ports[idx];

        match &slot.binding {
            Some(bound) if bound.id() == device.id() => {}
            _ => return Err(DispatchError::DeviceDetached { port }),
        }

        match (slot.state, mode) {
            (PortState::Attached { .. }, _) => submit(command).map(Admission::Submitted),
            (PortState::Empty | PortState::Attaching { .. }, QueueMode::Queue) => {
                let (queued, rx) = QueuedCommand::new(command);
                slot.queue.push_back(queued);
                debug!(port, queued = slot.queue.len(), "Command queued until attach");
                Ok(Admission::Queued(rx))
            }
            (state, _) => Err(DispatchError::PortNotReady { port, state }),
        }
    }

    /// Park a command on a port that is not yet attached.
    pub fn enqueue(&self, port: u8, queued: QueuedCommand) -> Result<(), RegistryError> {
        let idx = self.check_port(port)?;
        let mut ports = self.ports.lock();
        let slot = &mut ports[idx];
        match slot.state {
            PortState::Empty | PortState::Attaching { .. } => {
                slot.queue.push_back(queued);
                Ok(())
            }
            state => Err(RegistryError::PortNotReady { port, state }),
        }
    }

    /// Hub lost: every port reverts to `Empty`, queued callers get
    /// `HubDisconnected`, pending devices are unbound.
    ///
    /// Returns how many ports were occupied.
    pub fn teardown(&self) -> usize {
        self.with_ports(|ports, changes| {
            self.closed.store(true, Ordering::SeqCst);
            let mut occupied = 0;
            for (idx, slot) in ports.iter_mut().enumerate() {
                let port = idx as u8;
                if slot.state.is_empty() {
                    slot.binding = None;
                    for queued in slot.queue.drain(..) {
                        queued.fail(DispatchError::HubDisconnected);
                    }
                    continue;
                }
                occupied += 1;
                detach(port, slot, changes, DispatchError::HubDisconnected);
            }
            occupied
        })
    }

    pub fn set_value(&self, port: u8, value: Value) {
        if let Ok(idx) = self.check_port(port) {
            self.ports.lock()[idx].value = Some(value);
        }
    }

    /// Last value seen on `port`, if any.
    pub fn value(&self, port: u8) -> Option<Value> {
        let idx = self.check_port(port).ok()?;
        self.ports.lock()[idx].value.clone()
    }
}

fn set_state(port: u8, slot: &mut Port, next: PortState, changes: &mut Vec<Transition>) {
    debug_assert!(
        slot.state.can_transition_to(&next),
        "illegal transition {} -> {}",
        slot.state,
        next
    );
    changes.push((port, slot.state, next));
    slot.state = next;
}

fn detach(port: u8, slot: &mut Port, changes: &mut Vec<Transition>, error: DispatchError) {
    if let Some(kind) = slot.state.kind() {
        set_state(port, slot, PortState::Detaching { kind }, changes);
    }
    let discarded = slot.queue.len();
    for queued in slot.queue.drain(..) {
        queued.fail(error.clone());
    }
    if let Some(device) = slot.binding.take() {
        debug!(port, device = %device.id(), "Device unbound");
    }
    slot.value = None;
    slot.info = None;
    set_state(port, slot, PortState::Empty, changes);
    info!(port, discarded, "Port detached");
}

fn flush<F>(port: u8, slot: &mut Port, mut submit: F) -> usize
where
    F: FnMut(Command) -> Result<Submission, DispatchError>,
{
    let mut count = 0;
    for queued in slot.queue.drain(..) {
        // The caller stopped waiting; nothing to submit for.
        if queued.reply.is_closed() {
            trace!(port, cmd = %queued.command, "Queued command abandoned");
            continue;
        }
        let result = submit(queued.command);
        let _ = queued.reply.send(result);
        count += 1;
    }
    if count > 0 {
        debug!(port, count, "Flushed queued commands");
    }
    count
}

fn bind_slot(
    port: u8,
    slot: &mut Port,
    device: &Device,
    mode: QueueMode,
) -> Result<(), RegistryError> {
    if let Some(bound) = &slot.binding {
        if bound.id() == device.id() {
            return Ok(());
        }
        return Err(RegistryError::AlreadyBound { port });
    }
    match (slot.state, mode) {
        (PortState::Attached { .. }, _)
        | (PortState::Empty | PortState::Attaching { .. }, QueueMode::Queue) => {
            if let Some(actual) = slot.state.kind() {
                if actual != device.kind() {
                    return Err(RegistryError::KindMismatch {
                        port,
                        expected: device.kind(),
                        actual,
                    });
                }
            }
            slot.binding = Some(device.clone());
            debug!(port, device = %device.id(), "Device bound");
            Ok(())
        }
        (state, _) => Err(RegistryError::PortNotReady { port, state }),
    }
}
