//! Container runtime capabilities consumed by the resolver
//!
//! The resolver only needs three operations: list running containers,
//! inspect one container, and subscribe to lifecycle events. Any backend
//! that provides them can drive it; [`crate::docker::DockerRuntime`] is the
//! Docker implementation.

use futures::stream::BoxStream;
use std::future::Future;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("container runtime request failed: {0}")]
    Request(String),
    #[error("container event stream failed: {0}")]
    EventStream(String),
}

/// The parts of an inspected container the resolver cares about
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerDetails {
    pub id: String,
    /// Environment as `KEY=value` strings
    pub env: Vec<String>,
    /// `(network name, IP address)` pairs ordered by network name
    pub networks: Vec<(String, String)>,
}

impl ContainerDetails {
    /// Value of the environment variable `key`, if set
    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.env.iter().find_map(|entry| {
            let (k, v) = entry.split_once('=')?;
            (k == key).then_some(v)
        })
    }

    /// First network address that is not empty
    pub fn first_address(&self) -> Option<&str> {
        self.networks
            .iter()
            .map(|(_, addr)| addr.as_str())
            .find(|addr| !addr.is_empty())
    }
}

/// A lifecycle notification. Only used for logging; any event triggers a
/// full rescan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeEvent {
    pub action: String,
    pub actor: Option<String>,
}

pub trait ContainerRuntime: Send + Sync + 'static {
    /// IDs of all running containers
    fn list_running(&self) -> impl Future<Output = Result<Vec<String>, RuntimeError>> + Send;

    fn inspect(
        &self,
        id: &str,
    ) -> impl Future<Output = Result<ContainerDetails, RuntimeError>> + Send;

    /// Lifecycle events. An `Err` item or the end of the stream means the
    /// subscription is gone.
    fn events(&self) -> BoxStream<'_, Result<RuntimeEvent, RuntimeError>>;
}
