mod adapter;
mod command;
mod device;
#[allow(clippy::module_inception)]
mod engine;
mod error;
mod guard;
mod report;
mod state;
mod view;

pub use adapter::AdapterContext;
pub use adapter::AdapterError;
pub use adapter::AdapterFactoryResult;
pub use adapter::REGISTRY as ADAPTER_REGISTRY;
pub use adapter::VendorAdapter;
pub use adapter::build_adapters;
pub use command::Command;
pub use command::CommandParseError;
pub use command::CommandQueueEntry;
pub use command::CommandStatus;
pub use command::NewCommand;
pub use device::Brightness;
pub use device::BrightnessPresets;
pub use device::Device;
pub use device::DeviceDescriptor;
pub use device::DeviceGroup;
pub use device::EntryId;
pub use device::GroupId;
pub use device::PowerState;
pub use device::Room;
pub use device::RoomId;
pub use engine::Engine;
pub use engine::EngineConfig;
pub use engine::StateChangeRequest;
pub use engine::WriteOutcome;
pub use engine::divergence;
pub use error::EngineError;
pub use guard::PendingCommandGuard;
pub use guard::PendingSet;
pub use report::MergeStats;
pub use report::PollReport;
pub use report::VendorOutcome;
pub use report::VendorReport;
pub use state::BrightnessScale;
pub use state::StateProperties;
pub use view::DeviceQuery;
pub use view::DeviceView;
pub use view::DeviceViewBuilder;
