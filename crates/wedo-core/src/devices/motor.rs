//! Motor device.

use tracing::info;

use crate::device::Device;
use crate::dispatch::{Ack, DispatchError};
use crate::hub::Hub;
use crate::protocol::CommandKind;

/// Motor on one hub port.
#[derive(Clone)]
pub struct Motor {
    hub: Hub,
    device: Device,
}

impl Motor {
    pub(crate) fn new(hub: Hub, device: Device) -> Self {
        Self { hub, device }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Run at `power` percent, -100..=100. Negative runs backwards.
    pub async fn set_power(&self, power: i32) -> Result<Ack, DispatchError> {
        let ack = self
            .hub
            .send_command(&self.device, CommandKind::MotorPower { power })
            .await?;
        info!(port = self.device.port(), power, "Motor power set");
        Ok(ack)
    }

    pub async fn stop(&self) -> Result<Ack, DispatchError> {
        self.set_power(0).await
    }
}
