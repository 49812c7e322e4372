#[cfg(feature = "integration_govee")]
pub mod govee;
#[cfg(any(feature = "integration_govee", feature = "integration_hue"))]
mod http;
#[cfg(feature = "integration_hue")]
pub mod hue;
