//! Registry of kernel clients (one document bridge per kernel).

use crate::config::Config;
use crate::error::{Error, Result};
use crate::kernel::bridge::DocumentBridge;
use crate::outputs::OutputStore;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Establishes the transport connection to a kernel. The in-process default
/// has nothing to connect.
#[async_trait]
pub trait KernelConnector: Send + Sync {
    async fn connect(&self, kernel_id: &str) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct LocalKernelConnector;

#[async_trait]
impl KernelConnector for LocalKernelConnector {
    async fn connect(&self, _kernel_id: &str) -> Result<()> {
        Ok(())
    }
}

pub struct KernelRegistry {
    bridges: RwLock<HashMap<String, Arc<DocumentBridge>>>,
    store: Arc<OutputStore>,
    connector: Arc<dyn KernelConnector>,
    config: Arc<Config>,
}

impl KernelRegistry {
    pub fn new(
        store: Arc<OutputStore>,
        connector: Arc<dyn KernelConnector>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            bridges: RwLock::new(HashMap::new()),
            store,
            connector,
            config,
        }
    }

    pub fn get(&self, kernel_id: &str) -> Option<Arc<DocumentBridge>> {
        self.bridges.read().get(kernel_id).cloned()
    }

    /// Bring up the client for a new kernel, retrying the connection with
    /// one-second spacing up to the configured attempt count.
    pub async fn start_kernel(&self, kernel_id: Option<String>) -> Result<String> {
        let kernel_id = kernel_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let attempts = self.config.connection_attempts.max(1);
        for attempt in 1..=attempts {
            match self.connector.connect(&kernel_id).await {
                Ok(()) => break,
                Err(e) if attempt == attempts => {
                    return Err(Error::Io(std::io::Error::new(
                        std::io::ErrorKind::ConnectionRefused,
                        format!("kernel '{kernel_id}' unreachable after {attempts} attempts: {e}"),
                    )));
                }
                Err(e) => {
                    tracing::warn!(
                        kernel_id = %kernel_id,
                        attempt,
                        error = %e,
                        "kernel connection attempt failed; retrying"
                    );
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }

        let bridge = Arc::new(DocumentBridge::new(
            kernel_id.clone(),
            Arc::clone(&self.store),
            &self.config,
        ));
        self.bridges.write().insert(kernel_id.clone(), bridge);
        Ok(kernel_id)
    }

    pub fn shutdown_kernel(&self, kernel_id: &str) -> bool {
        self.bridges.write().remove(kernel_id).is_some()
    }

    pub fn kernel_count(&self) -> usize {
        self.bridges.read().len()
    }
}
