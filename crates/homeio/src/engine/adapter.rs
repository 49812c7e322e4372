use std::sync::Arc;

use async_trait::async_trait;
use linkme::distributed_slice;
use tracing::error;
use tracing::info;

use super::command::CommandQueueEntry;
use super::device::DeviceDescriptor;
use super::state::StateProperties;
use crate::config::Config;

/// Result type for adapter factory functions
pub type AdapterFactoryResult = anyhow::Result<Option<Arc<dyn VendorAdapter>>>;

pub struct AdapterContext<'a> {
    pub config: &'a Config,
}

#[distributed_slice]
pub static REGISTRY: [fn(&AdapterContext) -> AdapterFactoryResult];

/// Errors an adapter can report. Both are recoverable: the engine skips the
/// vendor or device involved and carries on.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdapterError {
    /// Vendor unreachable, timed out, or rejected our credentials
    #[error("{vendor} unavailable: {reason}")]
    Unavailable { vendor: String, reason: String },

    /// Vendor answered, but not with anything we can use
    #[error("{vendor} returned invalid data: {reason}")]
    DataInvalid { vendor: String, reason: String },
}

impl AdapterError {
    pub fn unavailable(vendor: &str, reason: impl Into<String>) -> Self {
        AdapterError::Unavailable {
            vendor: vendor.to_string(),
            reason: reason.into(),
        }
    }

    pub fn data_invalid(vendor: &str, reason: impl Into<String>) -> Self {
        AdapterError::DataInvalid {
            vendor: vendor.to_string(),
            reason: reason.into(),
        }
    }
}

/// Normalization boundary for one vendor integration
#[async_trait]
pub trait VendorAdapter: Send + Sync {
    /// Brand tag recorded on every device this adapter reports
    fn name(&self) -> &str;

    /// Whether this adapter is polled during a quick cycle.
    ///
    /// Cloud APIs with tight rate limits return false and are only polled on full
    /// cycles.
    fn poll_on_quick(&self) -> bool {
        true
    }

    /// List every device the vendor knows about.
    async fn list_devices(&self) -> Result<Vec<DeviceDescriptor>, AdapterError>;

    /// Fetch the current state of one device, converted to canonical units.
    async fn fetch_state(&self, device: &DeviceDescriptor) -> Result<StateProperties, AdapterError>;

    /// Send a queued command to the vendor, converting it to the vendor's scale.
    ///
    /// Called by the command executor, never by the reconciliation loop.
    async fn apply_command(&self, entry: &CommandQueueEntry) -> Result<(), AdapterError>;
}

/// Build every adapter whose integration is configured.
///
/// A factory that fails is logged and skipped so one broken integration does not
/// keep the others from starting.
pub fn build_adapters(cfg: &Config) -> Vec<Arc<dyn VendorAdapter>> {
    let ctx = AdapterContext { config: cfg };
    let mut adapters = Vec::new();
    for constr in REGISTRY {
        let adapter = match constr(&ctx) {
            Ok(Some(a)) => a,
            Err(e) => {
                error!("failed to set up vendor adapter: {:#}", e);
                continue;
            }
            Ok(None) => continue,
        };
        info!("Registered vendor adapter: {}", adapter.name());
        adapters.push(adapter);
    }
    // Registry order is link order; keep polling order stable across builds.
    adapters.sort_by(|a, b| a.name().cmp(b.name()));
    adapters
}
