//! Notification routing.
//!
//! Every decoded inbound message goes through [`NotificationRouter::route`]
//! in arrival order. Routing is synchronous: anything that has to wait (the
//! port setup handshake) is handed back to the caller as a [`RouteOutcome`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::device::{Device, DeviceId, DeviceKind, SetupProfile, Value, ValueFormat};
use crate::dispatch::CommandDispatcher;
use crate::events::{HubEvent, HubObserver};
use crate::port::{PortInfo, PortRegistry};
use crate::protocol::{Message, ProtocolTable};

/// What the caller still has to do after routing a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    Handled,
    /// A port attached whose kind needs a setup command before it is usable.
    SetupRequired {
        port: u8,
        kind: DeviceKind,
        profile: SetupProfile,
    },
    /// A port became attached and `count` queued commands went out.
    Flushed { port: u8, count: usize },
    /// Message did not apply to the current state.
    Ignored,
}

struct ObserverEntry {
    id: u64,
    port: u8,
    device: DeviceId,
    tx: mpsc::UnboundedSender<Value>,
}

/// Value change subscribers.
///
/// Each subscriber gets its own channel and task, so a slow or panicking
/// callback only ever stalls itself.
#[derive(Default)]
pub struct ValueObservers {
    next_id: AtomicU64,
    entries: Mutex<Vec<ObserverEntry>>,
}

impl ValueObservers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Call `callback` with every new value reported for `device`.
    ///
    /// The subscription lasts until the returned handle is dropped or the
    /// device detaches. Must be called inside a tokio runtime.
    pub fn subscribe<F>(self: &Arc<Self>, device: &Device, mut callback: F) -> Subscription
    where
        F: FnMut(Value) + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<Value>();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().push(ObserverEntry {
            id,
            port: device.port(),
            device: device.id(),
            tx,
        });

        let task = tokio::spawn(async move {
            while let Some(value) = rx.recv().await {
                callback(value);
            }
        });
        debug!(port = device.port(), device = %device.id(), subscription = id, "Value observer added");

        Subscription {
            id,
            observers: Arc::downgrade(self),
            task,
        }
    }

    /// Fan `value` out to every observer of `port`, dropping dead ones.
    ///
    /// Returns how many observers received it.
    pub fn notify(&self, port: u8, value: &Value) -> usize {
        let mut delivered = 0;
        self.entries.lock().retain(|entry| {
            if entry.port != port {
                return true;
            }
            if entry.tx.send(value.clone()).is_ok() {
                delivered += 1;
                true
            } else {
                warn!(port, device = %entry.device, subscription = entry.id, "Observer gone, removed");
                false
            }
        });
        delivered
    }

    /// Drop every observer on `port`.
    pub fn remove_port(&self, port: u8) {
        self.entries.lock().retain(|entry| entry.port != port);
    }

    pub fn remove(&self, id: u64) {
        self.entries.lock().retain(|entry| entry.id != id);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handle to a value observer; dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    observers: Weak<ValueObservers>,
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether the callback task is still running.
    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(observers) = self.observers.upgrade() {
            observers.remove(self.id);
        }
    }
}

/// Borrowed view of one hub's state used to route a message.
pub struct NotificationRouter<'a> {
    pub registry: &'a PortRegistry,
    pub dispatcher: &'a CommandDispatcher,
    pub observers: &'a ValueObservers,
    pub events: &'a dyn HubObserver,
    pub table: &'static ProtocolTable,
    pub auto_setup: bool,
}

impl NotificationRouter<'_> {
    pub fn route(&self, message: Message) -> RouteOutcome {
        trace!(msg = %message, "Routing");
        match message {
            Message::PortAttached { port, kind } => self.on_attached(port, kind),
            Message::PortInfo { port, mode, format } => {
                let info = PortInfo { mode, format };
                match self
                    .registry
                    .on_info(port, info, |cmd| self.dispatcher.submit(cmd))
                {
                    Ok(Some(count)) => RouteOutcome::Flushed { port, count },
                    Ok(None) => RouteOutcome::Handled,
                    Err(e) => {
                        debug!(port, error = %e, "Port info ignored");
                        RouteOutcome::Ignored
                    }
                }
            }
            Message::PortDetached { port } => {
                self.observers.remove_port(port);
                match self.registry.on_detach(port) {
                    Ok(true) => RouteOutcome::Handled,
                    Ok(false) => RouteOutcome::Ignored,
                    Err(e) => {
                        warn!(port, error = %e, "Detach ignored");
                        RouteOutcome::Ignored
                    }
                }
            }
            Message::SensorValue { port, payload } => self.on_value(port, &payload),
            Message::CommandAck { port, correlation } => {
                self.dispatcher.resolve_ack(port, correlation);
                RouteOutcome::Handled
            }
            Message::Error {
                port,
                correlation,
                code,
            } => {
                self.dispatcher.resolve_error(port, correlation, code);
                RouteOutcome::Handled
            }
        }
    }

    fn on_attached(&self, port: u8, kind: DeviceKind) -> RouteOutcome {
        match self.registry.on_attach(port, kind) {
            Ok(true) => self.observers.remove_port(port),
            Ok(false) => {}
            Err(e) => {
                warn!(port, error = %e, "Attach ignored");
                return RouteOutcome::Ignored;
            }
        }

        let profile = self.table.device(kind).and_then(|spec| spec.setup);
        match profile {
            Some(profile) if self.auto_setup => RouteOutcome::SetupRequired {
                port,
                kind,
                profile,
            },
            _ => match self
                .registry
                .mark_attached(port, |cmd| self.dispatcher.submit(cmd))
            {
                Ok(count) => RouteOutcome::Flushed { port, count },
                Err(e) => {
                    warn!(port, error = %e, "Could not complete attach");
                    RouteOutcome::Ignored
                }
            },
        }
    }

    fn on_value(&self, port: u8, payload: &[u8]) -> RouteOutcome {
        let Some(kind) = self.registry.get(port).ok().and_then(|s| s.kind()) else {
            debug!(port, "Value for empty port ignored");
            return RouteOutcome::Ignored;
        };
        let format = self
            .table
            .device(kind)
            .map(|spec| spec.value)
            .unwrap_or(ValueFormat::Raw);
        let value = Value::decode(format, payload);

        self.registry.set_value(port, value.clone());
        self.observers.notify(port, &value);
        self.events
            .on_event(&HubEvent::ValueUpdated { port, value });
        RouteOutcome::Handled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HubConfig;
    use crate::device::TiltDirection;
    use crate::events::NullObserver;
    use crate::port::PortState;
    use crate::protocol::{FrameCodec, WEDO2_V1};
    use crate::transport::MockTransport;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    struct Fixture {
        registry: PortRegistry,
        dispatcher: CommandDispatcher,
        observers: Arc<ValueObservers>,
    }

    impl Fixture {
        fn new() -> Self {
            let mock = Arc::new(MockTransport::new("hub"));
            Self {
                registry: PortRegistry::new(&WEDO2_V1, Arc::new(NullObserver)),
                dispatcher: CommandDispatcher::spawn(
                    mock,
                    FrameCodec::default(),
                    &HubConfig::default(),
                    Arc::new(NullObserver),
                    CancellationToken::new(),
                ),
                observers: Arc::new(ValueObservers::new()),
            }
        }

        fn router(&self) -> NotificationRouter<'_> {
            NotificationRouter {
                registry: &self.registry,
                dispatcher: &self.dispatcher,
                observers: &self.observers,
                events: &NullObserver,
                table: &WEDO2_V1,
                auto_setup: true,
            }
        }
    }

    #[tokio::test]
    async fn test_attach_with_setup_profile() {
        let fx = Fixture::new();
        let outcome = fx.router().route(Message::PortAttached {
            port: 1,
            kind: DeviceKind::TILT,
        });
        assert!(matches!(
            outcome,
            RouteOutcome::SetupRequired {
                port: 1,
                kind: DeviceKind::TILT,
                ..
            }
        ));
        assert!(matches!(
            fx.registry.get(1).unwrap(),
            PortState::Attaching { .. }
        ));

        let outcome = fx.router().route(Message::PortInfo {
            port: 1,
            mode: 0,
            format: 0,
        });
        assert_eq!(outcome, RouteOutcome::Flushed { port: 1, count: 0 });
        assert!(fx.registry.get(1).unwrap().is_attached());
    }

    #[tokio::test]
    async fn test_attach_without_setup_is_immediate() {
        let fx = Fixture::new();
        let outcome = fx.router().route(Message::PortAttached {
            port: 6,
            kind: DeviceKind::RGB_LED,
        });
        assert_eq!(outcome, RouteOutcome::Flushed { port: 6, count: 0 });
        assert!(fx.registry.get(6).unwrap().is_attached());
    }

    #[tokio::test]
    async fn test_sensor_value_is_decoded_and_cached() {
        let fx = Fixture::new();
        fx.router().route(Message::PortAttached {
            port: 1,
            kind: DeviceKind::TILT,
        });
        fx.router().route(Message::PortInfo {
            port: 1,
            mode: 0,
            format: 0,
        });
        let outcome = fx.router().route(Message::SensorValue {
            port: 1,
            payload: vec![180],
        });
        assert_eq!(outcome, RouteOutcome::Handled);
        assert_eq!(
            fx.registry.value(1),
            Some(Value::Tilt(TiltDirection::Forward))
        );
    }

    #[tokio::test]
    async fn test_value_for_empty_port_ignored() {
        let fx = Fixture::new();
        let outcome = fx.router().route(Message::SensorValue {
            port: 3,
            payload: vec![1],
        });
        assert_eq!(outcome, RouteOutcome::Ignored);
    }

    #[tokio::test]
    async fn test_panicking_observer_does_not_block_others() {
        let fx = Fixture::new();
        fx.router().route(Message::PortAttached {
            port: 2,
            kind: DeviceKind::DISTANCE,
        });
        fx.router().route(Message::PortInfo {
            port: 2,
            mode: 1,
            format: 0,
        });
        let device = fx.registry.device_for(2).unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _bad = fx.observers.subscribe(&device, |_| panic!("observer failure"));
        let _good = fx.observers.subscribe(&device, move |value| {
            let _ = tx.send(value);
        });

        for reading in [10u8, 20, 30] {
            fx.router().route(Message::SensorValue {
                port: 2,
                payload: vec![reading],
            });
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let mut seen = Vec::new();
        while let Ok(Some(value)) = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await {
            seen.push(value);
            if seen.len() == 3 {
                break;
            }
        }
        assert_eq!(
            seen,
            vec![
                Value::Distance(10.0),
                Value::Distance(20.0),
                Value::Distance(30.0)
            ]
        );
        assert_eq!(fx.observers.len(), 1);
    }

    #[tokio::test]
    async fn test_detach_drops_observers() {
        let fx = Fixture::new();
        fx.router().route(Message::PortAttached {
            port: 6,
            kind: DeviceKind::RGB_LED,
        });
        let device = fx.registry.device_for(6).unwrap();
        let sub = fx.observers.subscribe(&device, |_| {});
        assert_eq!(fx.observers.len(), 1);

        assert_eq!(
            fx.router().route(Message::PortDetached { port: 6 }),
            RouteOutcome::Handled
        );
        assert!(fx.observers.is_empty());
        drop(sub);
    }

    #[tokio::test]
    async fn test_reattach_drops_stale_observers() {
        let fx = Fixture::new();
        fx.router().route(Message::PortAttached {
            port: 2,
            kind: DeviceKind::DISTANCE,
        });
        fx.router().route(Message::PortInfo {
            port: 2,
            mode: 0,
            format: 0,
        });
        let distance = fx.registry.device_for(2).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _stale = fx.observers.subscribe(&distance, move |value| {
            let _ = tx.send(value);
        });

        // A new device on the same port without a detach in between.
        fx.router().route(Message::PortAttached {
            port: 2,
            kind: DeviceKind::TILT,
        });
        assert!(fx.observers.is_empty());
        fx.router().route(Message::PortInfo {
            port: 2,
            mode: 0,
            format: 0,
        });
        fx.router().route(Message::SensorValue {
            port: 2,
            payload: vec![180],
        });

        assert_eq!(
            fx.registry.value(2),
            Some(Value::Tilt(TiltDirection::Forward))
        );
        assert_eq!(
            tokio::time::timeout(Duration::from_millis(50), rx.recv()).await,
            Ok(None)
        );
    }
}
