//! Manager - discovery and coordination of several hubs.

use std::sync::Arc;

use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::config::ManagerConfig;
use crate::device::Device;
use crate::events::{HubEvent, HubObserver, LogLevel, TracingObserver};
use crate::hub::{Hub, RunExit};
use crate::port::RegistryError;
use crate::transport::{HubScanner, TransportError};

#[derive(Error, Debug)]
pub enum ManagerError {
    #[error("No hub found matching {filters:?}")]
    NoHubFound { filters: Vec<String> },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
}

/// Finds hubs and runs them side by side.
pub struct Manager {
    config: ManagerConfig,
    scanner: Arc<dyn HubScanner>,
    events: Arc<dyn HubObserver>,
    hubs: Vec<Hub>,
}

impl Manager {
    /// Create a manager with the default tracing observer.
    pub fn new(scanner: Arc<dyn HubScanner>, config: ManagerConfig) -> Self {
        Self::with_observer(scanner, config, Arc::new(TracingObserver))
    }

    pub fn with_observer(
        scanner: Arc<dyn HubScanner>,
        config: ManagerConfig,
        events: Arc<dyn HubObserver>,
    ) -> Self {
        Self {
            config,
            scanner,
            events,
            hubs: Vec::new(),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Scan, keep hubs whose name matches a filter, connect each one.
    ///
    /// Hubs already connected are kept as they are. A hub that fails to
    /// connect is skipped; if none remain the call fails with `NoHubFound`.
    #[instrument(skip(self))]
    pub async fn discover(&mut self) -> Result<Vec<Hub>, ManagerError> {
        let found = self.scanner.scan(self.config.scan_timeout()).await?;
        info!(count = found.len(), "Scan complete");

        for descriptor in found {
            if !self.config.matches_name(&descriptor.name) {
                info!(name = %descriptor.name, "Skipping non-matching device");
                continue;
            }
            if self.hubs.iter().any(|hub| hub.id() == descriptor.address) {
                continue;
            }

            let transport = match self.scanner.connect(&descriptor).await {
                Ok(transport) => transport,
                Err(e) => {
                    warn!(address = %descriptor.address, error = %e, "Connect failed");
                    self.events.on_event(&HubEvent::Log {
                        level: LogLevel::Warn,
                        message: format!("Could not connect to {}: {}", descriptor.name, e),
                    });
                    continue;
                }
            };
            let hub = Hub::connect_with_observer(
                transport,
                &descriptor.name,
                self.config.hub.clone(),
                self.events.clone(),
            )?;
            self.hubs.push(hub);
        }

        if self.hubs.is_empty() {
            return Err(ManagerError::NoHubFound {
                filters: self.config.name_filters.clone(),
            });
        }
        Ok(self.hubs.clone())
    }

    pub fn hubs(&self) -> &[Hub] {
        &self.hubs
    }

    pub fn hub(&self, id: &str) -> Option<&Hub> {
        self.hubs.iter().find(|hub| hub.id() == id)
    }

    /// Run every hub concurrently until each one exits.
    ///
    /// Returns each hub's id with its exit.
    pub async fn run(&self) -> Vec<(String, Result<RunExit, TransportError>)> {
        let tasks: Vec<_> = self
            .hubs
            .iter()
            .cloned()
            .map(|hub| {
                let id = hub.id().to_string();
                (id, tokio::spawn(async move { hub.run().await }))
            })
            .collect();

        let mut exits = Vec::with_capacity(tasks.len());
        for (id, task) in tasks {
            let exit = match task.await {
                Ok(exit) => exit,
                Err(e) => {
                    warn!(hub = %id, error = %e, "Hub task failed");
                    Err(TransportError::Io(std::io::Error::other(e.to_string())))
                }
            };
            exits.push((id, exit));
        }
        exits
    }

    /// Device on `port` of the primary (first discovered) hub.
    pub fn device(&self, port: u8) -> Result<Device, ManagerError> {
        let hub = self.hubs.first().ok_or_else(|| ManagerError::NoHubFound {
            filters: self.config.name_filters.clone(),
        })?;
        Ok(hub.device(port)?)
    }

    pub fn shutdown(&self) {
        for hub in &self.hubs {
            hub.shutdown();
        }
    }
}
