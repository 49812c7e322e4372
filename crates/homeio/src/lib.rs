pub mod config;
pub mod engine;
mod integrations;
pub mod store;

pub use config::Config;
pub use config::Diagnostic;
pub use config::LogLevel;
pub use config::format_diagnostics;
pub use engine::DeviceQuery;
pub use engine::DeviceView;
pub use engine::Engine;
pub use engine::EngineConfig;
pub use engine::PollReport;
pub use engine::StateChangeRequest;
pub use store::Store;
