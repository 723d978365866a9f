//! Hub - per-hub engine and caller API.
//!
//! A [`Hub`] owns the port table, the command dispatcher and the value
//! observers for one connected hub. [`Hub::run`] is the reader loop: it
//! pumps the transport's notification stream through the codec and router
//! until the hub goes away or is shut down.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::BytesMut;
use tokio_util::codec::Decoder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::HubConfig;
use crate::device::{Capabilities, Device, DeviceKind, SetupProfile, Value};
use crate::devices::{DistanceSensor, Led, Motor, TiltSensor};
use crate::dispatch::{Ack, CommandDispatcher, DispatchError};
use crate::events::{HubEvent, HubObserver, LogLevel, PacketDirection, TracingObserver};
use crate::port::{Admission, PortRegistry, PortState, RegistryError};
use crate::protocol::{Command, CommandKind, DecodeError, FrameCodec, Message, ProtocolTable};
use crate::router::{NotificationRouter, RouteOutcome, Subscription, ValueObservers};
use crate::transport::{HubTransport, TransportError};

/// Why [`Hub::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunExit {
    /// The notification stream ended.
    Disconnected,
    /// [`Hub::shutdown`] was called.
    Cancelled,
}

struct HubShared {
    id: String,
    name: String,
    transport: Arc<dyn HubTransport>,
    codec: FrameCodec,
    config: HubConfig,
    registry: PortRegistry,
    dispatcher: CommandDispatcher,
    observers: Arc<ValueObservers>,
    events: Arc<dyn HubObserver>,
    cancel: CancellationToken,
    torn_down: AtomicBool,
}

impl HubShared {
    fn router(&self) -> NotificationRouter<'_> {
        NotificationRouter {
            registry: &self.registry,
            dispatcher: &self.dispatcher,
            observers: &self.observers,
            events: self.events.as_ref(),
            table: self.codec.table(),
            auto_setup: self.config.auto_setup,
        }
    }

    fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.events.on_event(&HubEvent::Log {
            level,
            message: message.into(),
        });
    }

    /// Revert every port to `Empty` and fail outstanding work. Idempotent.
    fn teardown(&self, reason: &str) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let occupied = self.registry.teardown();
        self.dispatcher.fail_all();
        for port in 0..self.registry.port_count() {
            self.observers.remove_port(port);
        }
        info!(hub = %self.id, reason, occupied, "Hub torn down");
        self.events.on_event(&HubEvent::Disconnected {
            hub: self.id.clone(),
            reason: reason.to_string(),
        });
    }
}

/// Runs teardown however [`Hub::run`] ends, including when its future is
/// dropped mid-await.
struct TeardownGuard<'a> {
    shared: &'a HubShared,
    reason: &'static str,
}

impl Drop for TeardownGuard<'_> {
    fn drop(&mut self) {
        self.shared.teardown(self.reason);
    }
}

/// Handle to one connected hub. Cheap to clone.
#[derive(Clone)]
pub struct Hub {
    shared: Arc<HubShared>,
}

impl Hub {
    /// Wrap an open transport, logging events through tracing.
    ///
    /// Must be called inside a tokio runtime: the command writer task is
    /// spawned here.
    pub fn connect(
        transport: Arc<dyn HubTransport>,
        name: &str,
        config: HubConfig,
    ) -> Result<Self, TransportError> {
        Self::connect_with_observer(transport, name, config, Arc::new(TracingObserver))
    }

    pub fn connect_with_observer(
        transport: Arc<dyn HubTransport>,
        name: &str,
        config: HubConfig,
        events: Arc<dyn HubObserver>,
    ) -> Result<Self, TransportError> {
        if !transport.is_connected() {
            return Err(TransportError::Disconnected);
        }

        let codec = FrameCodec::default();
        let cancel = CancellationToken::new();
        let dispatcher = CommandDispatcher::spawn(
            transport.clone(),
            codec,
            &config,
            events.clone(),
            cancel.child_token(),
        );
        let id = transport.address();
        let shared = HubShared {
            id: id.clone(),
            name: name.to_string(),
            transport,
            codec,
            registry: PortRegistry::new(codec.table(), events.clone()),
            dispatcher,
            observers: Arc::new(ValueObservers::new()),
            events,
            cancel,
            config,
            torn_down: AtomicBool::new(false),
        };

        info!(hub = %id, name, "Hub connected");
        shared.events.on_event(&HubEvent::Connected { hub: id });
        Ok(Self {
            shared: Arc::new(shared),
        })
    }

    /// Radio address of the hub.
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    /// Advertised name.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn config(&self) -> &HubConfig {
        &self.shared.config
    }

    pub fn table(&self) -> &'static ProtocolTable {
        self.shared.codec.table()
    }

    pub fn is_connected(&self) -> bool {
        !self.shared.torn_down.load(Ordering::SeqCst) && self.shared.transport.is_connected()
    }

    /// Pump notifications until the stream ends or [`Hub::shutdown`].
    ///
    /// Can only run once per hub: the notification stream is not
    /// restartable. Whatever the exit, every port ends `Empty` and pending
    /// commands fail with `HubDisconnected`.
    #[instrument(skip(self), fields(hub = %self.shared.id))]
    pub async fn run(&self) -> Result<RunExit, TransportError> {
        let mut stream = self.shared.transport.notifications()?;
        let mut guard = TeardownGuard {
            shared: &self.shared,
            reason: "run dropped",
        };

        let mut codec = self.shared.codec;
        let mut buf = BytesMut::with_capacity(256);
        info!("Reader started");

        let exit = loop {
            tokio::select! {
                biased;
                _ = self.shared.cancel.cancelled() => break RunExit::Cancelled,
                chunk = stream.recv() => match chunk {
                    Some(chunk) => {
                        self.shared.events.on_event(&HubEvent::Packet {
                            direction: PacketDirection::Rx,
                            label: "notification".into(),
                            length: chunk.len(),
                            data: Some(chunk.clone()),
                        });
                        buf.extend_from_slice(&chunk);
                        self.drain(&mut codec, &mut buf);
                    }
                    None => break RunExit::Disconnected,
                },
            }
        };

        guard.reason = match exit {
            RunExit::Disconnected => "notification stream ended",
            RunExit::Cancelled => "shutdown",
        };
        info!(?exit, "Reader stopped");
        Ok(exit)
    }

    /// Decode and route every complete frame in `buf`.
    fn drain(&self, codec: &mut FrameCodec, buf: &mut BytesMut) {
        loop {
            match Decoder::decode(codec, buf) {
                Ok(Some(message)) => self.handle(message),
                Ok(None) => break,
                Err(DecodeError::Malformed { reason, discarded }) => {
                    self.shared
                        .events
                        .on_event(&HubEvent::FrameDiscarded { reason, discarded });
                }
                Err(e) => {
                    warn!(error = %e, "Notification buffer reset");
                    buf.clear();
                    break;
                }
            }
        }
    }

    fn handle(&self, message: Message) {
        match self.shared.router().route(message) {
            RouteOutcome::SetupRequired {
                port,
                kind,
                profile,
            } => self.start_setup(port, kind, profile),
            RouteOutcome::Flushed { port, count } if count > 0 => {
                debug!(port, count, "Queued commands released");
            }
            _ => {}
        }
    }

    /// Send the port setup command without blocking the reader.
    fn start_setup(&self, port: u8, kind: DeviceKind, profile: SetupProfile) {
        let command = Command::new(port, CommandKind::setup(kind, profile));
        let submission = match self.shared.dispatcher.submit(command) {
            Ok(submission) => submission,
            Err(e) => {
                warn!(port, error = %e, "Port setup not sent");
                if e != DispatchError::HubDisconnected {
                    let _ = self
                        .shared
                        .registry
                        .mark_attached(port, |cmd| self.shared.dispatcher.submit(cmd));
                }
                return;
            }
        };

        let shared = self.shared.clone();
        tokio::spawn(async move {
            if let Err(e) = submission.resolve().await {
                if e == DispatchError::HubDisconnected {
                    return;
                }
                warn!(port, kind = %kind, error = %e, "Port setup failed, attaching with defaults");
                shared.log(
                    LogLevel::Warn,
                    format!("Port {} setup failed: {}", port, e),
                );
            }
            // Normally the hub's PortInfo completes the attach. Without it
            // the port still attaches, so queued commands are released.
            if shared.registry.get(port) == Ok(PortState::Attaching { kind }) {
                let _ = shared
                    .registry
                    .mark_attached(port, |cmd| shared.dispatcher.submit(cmd));
            }
        });
    }

    /// Stop [`Hub::run`] and fail everything outstanding.
    pub fn shutdown(&self) {
        self.shared.cancel.cancel();
        self.shared.teardown("shutdown");
    }

    pub fn port_state(&self, port: u8) -> Result<PortState, RegistryError> {
        self.shared.registry.get(port)
    }

    /// Device on an attached port. Repeated calls return the same device.
    pub fn device(&self, port: u8) -> Result<Device, RegistryError> {
        self.shared.registry.device_for(port)
    }

    /// Device of `kind` on `port`, usable before the port has attached.
    ///
    /// With `QueueMode::Queue` its commands wait up to `queue_timeout_ms` for
    /// the attach; with `QueueMode::FailFast` the port must already be attached.
    pub fn expect_device(&self, port: u8, kind: DeviceKind) -> Result<Device, RegistryError> {
        self.shared
            .registry
            .expect(port, kind, self.shared.config.queue_mode)
    }

    /// Send `kind` to `device` and wait for the outcome.
    #[instrument(skip(self, device), fields(port = device.port()))]
    pub async fn send_command(&self, device: &Device, kind: CommandKind) -> Result<Ack, DispatchError> {
        check_capability(device, &kind)?;
        let command = Command::new(device.port(), kind);
        self.shared.codec.validate(&command)?;

        let admission = self.shared.registry.admit(
            device,
            command,
            self.shared.config.queue_mode,
            |cmd| self.shared.dispatcher.submit(cmd),
        )?;
        let submission = match admission {
            Admission::Submitted(submission) => submission,
            Admission::Queued(mut rx) => {
                let port = device.port();
                match tokio::time::timeout(self.shared.config.queue_timeout(), &mut rx).await {
                    Ok(queued) => queued.map_err(|_| DispatchError::HubDisconnected)??,
                    Err(_) => match rx.try_recv() {
                        // Flushed just as the wait ran out.
                        Ok(queued) => queued?,
                        // Dropping `rx` keeps the command from being flushed later.
                        Err(_) => {
                            let state = self.shared.registry.get(port).unwrap_or(PortState::Empty);
                            warn!(port, %state, "Port did not attach in time, command dropped");
                            return Err(DispatchError::PortNotReady { port, state });
                        }
                    },
                }
            }
        };
        submission.resolve().await
    }

    /// Last value reported for `device`.
    pub fn read_value(&self, device: &Device) -> Result<Option<Value>, DispatchError> {
        self.shared.registry.check_bound(device)?;
        Ok(self.shared.registry.value(device.port()))
    }

    /// Call `callback` with each new value for `device`.
    ///
    /// Dropping the returned [`Subscription`] unsubscribes.
    pub fn on_value_change<F>(&self, device: &Device, callback: F) -> Result<Subscription, DispatchError>
    where
        F: FnMut(Value) + Send + 'static,
    {
        self.shared.registry.check_bound(device)?;
        Ok(self.shared.observers.subscribe(device, callback))
    }

    /// Correlated commands still waiting for an ack.
    pub fn pending_acks(&self) -> usize {
        self.shared.dispatcher.pending()
    }

    pub fn motor(&self, port: u8) -> Result<Motor, RegistryError> {
        Ok(Motor::new(self.clone(), self.typed(port, DeviceKind::MOTOR)?))
    }

    pub fn led(&self, port: u8) -> Result<Led, RegistryError> {
        Ok(Led::new(self.clone(), self.typed(port, DeviceKind::RGB_LED)?))
    }

    pub fn tilt_sensor(&self, port: u8) -> Result<TiltSensor, RegistryError> {
        Ok(TiltSensor::new(self.clone(), self.typed(port, DeviceKind::TILT)?))
    }

    pub fn distance_sensor(&self, port: u8) -> Result<DistanceSensor, RegistryError> {
        Ok(DistanceSensor::new(
            self.clone(),
            self.typed(port, DeviceKind::DISTANCE)?,
        ))
    }

    fn typed(&self, port: u8, kind: DeviceKind) -> Result<Device, RegistryError> {
        let device = match self.port_state(port)? {
            PortState::Attached { .. } => self.device(port)?,
            _ => self.expect_device(port, kind)?,
        };
        if device.kind() != kind {
            return Err(RegistryError::KindMismatch {
                port,
                expected: kind,
                actual: device.kind(),
            });
        }
        Ok(device)
    }
}

fn check_capability(device: &Device, kind: &CommandKind) -> Result<(), DispatchError> {
    let required = match kind {
        CommandKind::MotorPower { .. } => Capabilities::ACCEPTS_POWER,
        CommandKind::LedRgb { .. } | CommandKind::LedIndex { .. } => Capabilities::ACCEPTS_COLOR,
        CommandKind::PortSetup { .. } => Capabilities::NONE,
    };
    if device.supports(required) {
        Ok(())
    } else {
        Err(DispatchError::Unsupported(format!(
            "{} on device kind {} ({})",
            kind.opcode(),
            device.kind(),
            device.capabilities()
        )))
    }
}
