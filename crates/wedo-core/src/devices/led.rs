//! RGB LED device with blink and disco modes.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::device::Device;
use crate::dispatch::{Ack, DispatchError};
use crate::hub::Hub;
use crate::protocol::CommandKind;

pub type Rgb = (u8, u8, u8);

/// Colours accepted by [`Led::set_color`] and [`Led::blink`].
pub const NAMED_COLORS: &[(&str, Rgb)] = &[
    ("red", (255, 0, 0)),
    ("green", (0, 255, 0)),
    ("blue", (0, 0, 255)),
    ("yellow", (255, 255, 0)),
    ("cyan", (0, 255, 255)),
    ("magenta", (255, 0, 255)),
    ("white", (255, 255, 255)),
    ("black", (0, 0, 0)),
];

const OFF: Rgb = (0, 0, 0);
pub const BLINK_INTERVAL: Duration = Duration::from_millis(500);
pub const DISCO_INTERVAL: Duration = Duration::from_secs(2);
/// Blue, red, green, purple.
pub const DISCO_COLORS: [Rgb; 4] = [(0, 0, 255), (255, 0, 0), (0, 255, 0), (128, 0, 128)];

/// Look up a colour name, ignoring case.
pub fn named_color(name: &str) -> Result<Rgb, DispatchError> {
    NAMED_COLORS
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, rgb)| *rgb)
        .ok_or_else(|| {
            let known: Vec<&str> = NAMED_COLORS.iter().map(|(n, _)| *n).collect();
            DispatchError::InvalidParameter(format!(
                "unknown colour '{}', expected one of {}",
                name,
                known.join(", ")
            ))
        })
}

/// The hub's RGB LED.
///
/// Clones share the running mode, so `stop_mode` on any clone stops a blink
/// or disco started from another.
#[derive(Clone)]
pub struct Led {
    hub: Hub,
    device: Device,
    mode: Arc<Mutex<Option<AbortHandle>>>,
}

impl Led {
    pub(crate) fn new(hub: Hub, device: Device) -> Self {
        Self {
            hub,
            device,
            mode: Arc::new(Mutex::new(None)),
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    async fn write(&self, (red, green, blue): Rgb) -> Result<Ack, DispatchError> {
        self.hub
            .send_command(&self.device, CommandKind::LedRgb { red, green, blue })
            .await
    }

    pub async fn set_rgb(&self, red: u8, green: u8, blue: u8) -> Result<Ack, DispatchError> {
        self.stop_mode();
        self.write((red, green, blue)).await
    }

    pub async fn set_color(&self, name: &str) -> Result<Ack, DispatchError> {
        let rgb = named_color(name)?;
        self.stop_mode();
        self.write(rgb).await
    }

    /// Built-in palette colour, 0..=10.
    pub async fn set_index(&self, index: u8) -> Result<Ack, DispatchError> {
        self.stop_mode();
        self.hub
            .send_command(&self.device, CommandKind::LedIndex { index })
            .await
    }

    /// Toggle `name` on and off every 500 ms for `duration`, then leave it on.
    ///
    /// Returns early with `Ok` if another LED command cancels the blink.
    pub async fn blink(&self, name: &str, duration: Duration) -> Result<(), DispatchError> {
        let rgb = named_color(name)?;
        self.stop_mode();

        let led = self.clone();
        let task = tokio::spawn(async move {
            let end = Instant::now() + duration;
            let mut on = true;
            while Instant::now() < end {
                led.write(if on { rgb } else { OFF }).await?;
                on = !on;
                tokio::time::sleep(BLINK_INTERVAL).await;
            }
            led.write(rgb).await.map(|_| ())
        });
        self.set_mode(task.abort_handle());

        match task.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => {
                debug!(port = self.device.port(), "Blink cancelled");
                Ok(())
            }
            Err(e) => std::panic::resume_unwind(e.into_panic()),
        }
    }

    /// Cycle blue, red, green, purple every 2 s until another LED command.
    pub fn disco(&self) {
        self.stop_mode();

        let led = self.clone();
        let task = tokio::spawn(async move {
            for rgb in DISCO_COLORS.iter().cycle() {
                if let Err(e) = led.write(*rgb).await {
                    warn!(port = led.device.port(), error = %e, "Disco stopped");
                    return;
                }
                tokio::time::sleep(DISCO_INTERVAL).await;
            }
        });
        self.set_mode(task.abort_handle());
    }

    /// Cancel a running blink or disco.
    pub fn stop_mode(&self) {
        if let Some(handle) = self.mode.lock().take() {
            handle.abort();
        }
    }

    pub fn mode_running(&self) -> bool {
        self.mode
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    fn set_mode(&self, handle: AbortHandle) {
        if let Some(previous) = self.mode.lock().replace(handle) {
            previous.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_named_colors() {
        assert_eq!(named_color("red").unwrap(), (255, 0, 0));
        assert_eq!(named_color("Magenta").unwrap(), (255, 0, 255));
        assert_eq!(NAMED_COLORS.len(), 8);
        assert!(matches!(
            named_color("orange"),
            Err(DispatchError::InvalidParameter(_))
        ));
    }
}
