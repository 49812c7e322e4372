#[allow(clippy::module_inception)]
mod hue;
mod model;

use std::sync::Arc;
use std::time::Duration;

pub use hue::HueAdapter;
use linkme::distributed_slice;

use crate::engine;

#[distributed_slice(engine::ADAPTER_REGISTRY)]
fn init_hue(ctx: &engine::AdapterContext) -> engine::AdapterFactoryResult {
    let Some(hue_config) = &ctx.config.integrations.hue else {
        return Ok(None);
    };

    let timeout = Duration::from_secs(ctx.config.poll.adapter_timeout_secs);
    Ok(Some(Arc::new(HueAdapter::new(hue_config, timeout)?)))
}
