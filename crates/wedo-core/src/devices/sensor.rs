//! Tilt and distance sensors.

use crate::device::{Device, TiltDirection, Value};
use crate::dispatch::DispatchError;
use crate::hub::Hub;
use crate::router::Subscription;

#[derive(Clone)]
pub struct TiltSensor {
    hub: Hub,
    device: Device,
}

impl TiltSensor {
    pub(crate) fn new(hub: Hub, device: Device) -> Self {
        Self { hub, device }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Current direction; `NoTilt` until the first reading arrives.
    pub fn tilt(&self) -> Result<TiltDirection, DispatchError> {
        match self.hub.read_value(&self.device)? {
            Some(Value::Tilt(direction)) => Ok(direction),
            _ => Ok(TiltDirection::NoTilt),
        }
    }

    pub fn on_change<F>(&self, mut callback: F) -> Result<Subscription, DispatchError>
    where
        F: FnMut(TiltDirection) + Send + 'static,
    {
        self.hub.on_value_change(&self.device, move |value| {
            if let Value::Tilt(direction) = value {
                callback(direction);
            }
        })
    }
}

#[derive(Clone)]
pub struct DistanceSensor {
    hub: Hub,
    device: Device,
}

impl DistanceSensor {
    pub(crate) fn new(hub: Hub, device: Device) -> Self {
        Self { hub, device }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Latest distance reading, `None` before the first one.
    pub fn distance(&self) -> Result<Option<f32>, DispatchError> {
        match self.hub.read_value(&self.device)? {
            Some(Value::Distance(distance)) => Ok(Some(distance)),
            _ => Ok(None),
        }
    }

    pub fn on_change<F>(&self, mut callback: F) -> Result<Subscription, DispatchError>
    where
        F: FnMut(f32) + Send + 'static,
    {
        self.hub.on_value_change(&self.device, move |value| {
            if let Value::Distance(distance) = value {
                callback(distance);
            }
        })
    }
}
