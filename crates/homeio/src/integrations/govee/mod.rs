#[allow(clippy::module_inception)]
mod govee;
mod model;

use std::sync::Arc;
use std::time::Duration;

pub use govee::GoveeAdapter;
use linkme::distributed_slice;

use crate::engine;

#[distributed_slice(engine::ADAPTER_REGISTRY)]
fn init_govee(ctx: &engine::AdapterContext) -> engine::AdapterFactoryResult {
    let Some(govee_config) = &ctx.config.integrations.govee else {
        return Ok(None);
    };

    let timeout = Duration::from_secs(ctx.config.poll.adapter_timeout_secs);
    Ok(Some(Arc::new(GoveeAdapter::new(govee_config, timeout)?)))
}
