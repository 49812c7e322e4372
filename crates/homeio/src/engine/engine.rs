use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::PoisonError;
use std::time::Duration;
use std::time::Instant;

use chrono::Utc;
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use tracing::debug;
use tracing::info;
use tracing::info_span;
use tracing::warn;

use super::adapter::AdapterError;
use super::adapter::VendorAdapter;
use super::command::Command;
use super::command::CommandQueueEntry;
use super::command::CommandStatus;
use super::command::NewCommand;
use super::device::Device;
use super::device::DeviceDescriptor;
use super::device::DeviceGroup;
use super::device::EntryId;
use super::device::GroupId;
use super::device::Room;
use super::error::EngineError;
use super::guard::PendingCommandGuard;
use super::report::MergeStats;
use super::report::PollReport;
use super::report::VendorOutcome;
use super::report::VendorReport;
use super::state::StateProperties;
use super::view::DeviceQuery;
use super::view::DeviceView;
use super::view::DeviceViewBuilder;
use crate::config::PollConfig;
use crate::store::DeviceConfigUpdate;
use crate::store::Store;
use crate::store::StoreError;
use crate::store::Upsert;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// Upper bound on every single adapter call
    pub adapter_timeout: Duration,
    /// Poll vendors in parallel, one task each
    pub concurrent: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            adapter_timeout: Duration::from_secs(10),
            concurrent: false,
        }
    }
}

impl From<&PollConfig> for EngineConfig {
    fn from(poll: &PollConfig) -> Self {
        Self {
            adapter_timeout: Duration::from_secs(poll.adapter_timeout_secs),
            concurrent: poll.concurrent,
        }
    }
}

/// Caller request to change one property of a device.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StateChangeRequest {
    pub device: String,
    pub command: String,
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WriteOutcome {
    pub device: Device,
    /// Entry created for this write, if any
    pub queued: Option<EntryId>,
    /// A command was needed but another one for the device was still in flight
    pub suppressed: bool,
}

/// The command that would move `device` towards its preferred state, if any.
///
/// Each property with a preference is compared with what was last observed.
/// Power is checked first, so a device gets at most one command per cycle.
pub fn divergence(device: &Device) -> Option<Command> {
    if let Some(power) = device.preferred_power {
        if device.actual_power != Some(power) {
            return Some(Command::Turn(power));
        }
    }
    if let Some(level) = device.preferred_brightness {
        if device.actual_brightness != Some(level) {
            return Some(Command::Brightness(level));
        }
    }
    None
}

/// Lazily created async mutex per device id.
#[derive(Clone, Default)]
struct DeviceLocks(Arc<std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>>);

impl DeviceLocks {
    fn get(&self, device: &str) -> Arc<Mutex<()>> {
        let mut map = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        map.entry(device.to_string()).or_default().clone()
    }
}

enum DeviceMerge {
    Merged { inserted: bool, enqueued: bool },
    FetchFailed { inserted: bool },
}

/// The part of the engine a per-vendor poll task needs.
#[derive(Clone)]
struct Reconciler {
    store: Arc<dyn Store>,
    locks: DeviceLocks,
    timeout: Duration,
}

impl Reconciler {
    async fn bounded<T, F>(&self, vendor: &str, fut: F) -> Result<T, AdapterError>
    where
        F: Future<Output = Result<T, AdapterError>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(AdapterError::unavailable(
                vendor,
                format!("no answer within {:?}", self.timeout),
            )),
        }
    }

    async fn poll_vendor(
        self,
        adapter: Arc<dyn VendorAdapter>,
        token: CancellationToken,
    ) -> VendorReport {
        let started = Instant::now();
        let vendor = adapter.name().to_string();
        let outcome = self.merge_vendor(&*adapter, &token).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match &outcome {
            VendorOutcome::Completed(stats) => info!(
                seen = stats.seen,
                inserted = stats.inserted,
                failed = stats.failed,
                enqueued = stats.enqueued,
                "Polled {} in {}ms",
                vendor,
                duration_ms
            ),
            VendorOutcome::Failed { error } => warn!("Polling {} failed: {}", vendor, error),
            VendorOutcome::Skipped { .. } => {}
        }

        VendorReport {
            vendor,
            duration_ms,
            outcome,
        }
    }

    async fn merge_vendor(
        &self,
        adapter: &dyn VendorAdapter,
        token: &CancellationToken,
    ) -> VendorOutcome {
        let vendor = adapter.name();
        let descriptors = match self.bounded(vendor, adapter.list_devices()).await {
            Ok(d) => d,
            Err(e) => {
                return VendorOutcome::Failed {
                    error: e.to_string(),
                };
            }
        };

        let mut stats = MergeStats::default();
        for descriptor in &descriptors {
            if token.is_cancelled() {
                debug!("Poll of {} cancelled after {} devices", vendor, stats.seen);
                break;
            }
            stats.seen += 1;

            // Network call happens before the device lock is taken.
            let state = self.bounded(vendor, adapter.fetch_state(descriptor)).await;
            match self.merge_device(descriptor, state).await {
                Ok(DeviceMerge::Merged { inserted, enqueued }) => {
                    stats.count_upsert(inserted);
                    if enqueued {
                        stats.enqueued += 1;
                    }
                }
                Ok(DeviceMerge::FetchFailed { inserted }) => {
                    stats.count_upsert(inserted);
                    stats.failed += 1;
                }
                Err(e) => {
                    warn!(device = %descriptor.id, "Failed to merge device: {}", e);
                    stats.failed += 1;
                }
            }
        }
        VendorOutcome::Completed(stats)
    }

    async fn merge_device(
        &self,
        descriptor: &DeviceDescriptor,
        state: Result<StateProperties, AdapterError>,
    ) -> Result<DeviceMerge, StoreError> {
        let lock = self.locks.get(&descriptor.id);
        let _held = lock.lock().await;

        let inserted = matches!(self.store.upsert_device(descriptor)?, Upsert::Inserted(_));
        if inserted {
            info!(device = %descriptor.id, "Discovered {} {}", descriptor.brand, descriptor.name);
        }

        let state = match state {
            Ok(s) => s,
            Err(e) => {
                warn!(device = %descriptor.id, "Failed to fetch state: {}", e);
                return Ok(DeviceMerge::FetchFailed { inserted });
            }
        };

        let device = self.store.apply_observed(&descriptor.id, &state)?;
        let Some(command) = divergence(&device) else {
            return Ok(DeviceMerge::Merged {
                inserted,
                enqueued: false,
            });
        };

        let entry = self
            .store
            .enqueue_unless_pending(NewCommand::for_device(&device, command))?;
        match &entry {
            Some(e) => info!(device = %device.id, entry = %e.id, "Queued {}", command),
            None => debug!(device = %device.id, "Divergent but a command is already in flight"),
        }
        Ok(DeviceMerge::Merged {
            inserted,
            enqueued: entry.is_some(),
        })
    }
}

impl MergeStats {
    fn count_upsert(&mut self, inserted: bool) {
        if inserted {
            self.inserted += 1;
        } else {
            self.updated += 1;
        }
    }
}

/// homeio engine
///
/// Polls vendor adapters into the store, queues commands for devices whose
/// observed state has drifted from what was asked for, and serves the caller-facing
/// read and write paths.
pub struct Engine {
    reconciler: Reconciler,
    adapters: Vec<Arc<dyn VendorAdapter>>,
    guard: PendingCommandGuard,
    views: DeviceViewBuilder,
    config: EngineConfig,
}

impl Engine {
    pub fn new(
        store: Arc<dyn Store>,
        adapters: Vec<Arc<dyn VendorAdapter>>,
        config: EngineConfig,
    ) -> Self {
        Self {
            reconciler: Reconciler {
                store: store.clone(),
                locks: DeviceLocks::default(),
                timeout: config.adapter_timeout,
            },
            adapters,
            guard: PendingCommandGuard::new(store.clone()),
            views: DeviceViewBuilder::new(store),
            config,
        }
    }

    fn store(&self) -> &dyn Store {
        &*self.reconciler.store
    }

    pub fn adapters(&self) -> &[Arc<dyn VendorAdapter>] {
        &self.adapters
    }

    pub fn guard(&self) -> &PendingCommandGuard {
        &self.guard
    }

    /// Run one poll cycle over every adapter.
    ///
    /// A quick cycle skips adapters that opt out of it. Vendors are independent:
    /// one failing or timing out does not affect the others. Cancelling `token`
    /// stops the cycle at the next device or vendor boundary.
    #[tracing::instrument(skip(self, token))]
    pub async fn poll_cycle(&self, quick: bool, token: &CancellationToken) -> PollReport {
        let started_at = Utc::now();
        let started = Instant::now();

        let vendors = if self.config.concurrent {
            self.poll_concurrent(quick, token).await
        } else {
            self.poll_sequential(quick, token).await
        };

        let report = PollReport {
            started_at,
            quick,
            cancelled: token.is_cancelled(),
            total_ms: started.elapsed().as_millis() as u64,
            vendors,
        };
        info!(
            "Poll cycle finished in {}ms, {} commands queued",
            report.total_ms,
            report.enqueued()
        );
        report
    }

    fn skip_reason(&self, adapter: &dyn VendorAdapter, quick: bool) -> Option<&'static str> {
        if quick && !adapter.poll_on_quick() {
            Some("not polled on quick cycles")
        } else {
            None
        }
    }

    async fn poll_sequential(&self, quick: bool, token: &CancellationToken) -> Vec<VendorReport> {
        let mut reports = Vec::with_capacity(self.adapters.len());
        for adapter in &self.adapters {
            if token.is_cancelled() {
                reports.push(skipped(adapter.name(), "cycle cancelled"));
                continue;
            }
            if let Some(reason) = self.skip_reason(&**adapter, quick) {
                reports.push(skipped(adapter.name(), reason));
                continue;
            }
            let span = info_span!("vendor", vendor = adapter.name());
            let report = self
                .reconciler
                .clone()
                .poll_vendor(adapter.clone(), token.clone())
                .instrument(span)
                .await;
            reports.push(report);
        }
        reports
    }

    async fn poll_concurrent(&self, quick: bool, token: &CancellationToken) -> Vec<VendorReport> {
        let mut tasks = Vec::with_capacity(self.adapters.len());
        for adapter in &self.adapters {
            let name = adapter.name().to_string();
            if token.is_cancelled() {
                tasks.push((name, Err(skipped(adapter.name(), "cycle cancelled"))));
                continue;
            }
            if let Some(reason) = self.skip_reason(&**adapter, quick) {
                tasks.push((name, Err(skipped(adapter.name(), reason))));
                continue;
            }
            let span = info_span!("vendor", vendor = adapter.name());
            let handle = tokio::spawn(
                self.reconciler
                    .clone()
                    .poll_vendor(adapter.clone(), token.clone())
                    .instrument(span),
            );
            tasks.push((name, Ok(handle)));
        }

        let mut reports = Vec::with_capacity(tasks.len());
        for (name, task) in tasks {
            let report = match task {
                Ok(handle) => match handle.await {
                    Ok(report) => report,
                    Err(e) => VendorReport {
                        vendor: name,
                        duration_ms: 0,
                        outcome: VendorOutcome::Failed {
                            error: format!("poll task died: {}", e),
                        },
                    },
                },
                Err(report) => report,
            };
            reports.push(report);
        }
        reports
    }

    /// Device listing for callers.
    pub fn devices(&self, query: &DeviceQuery) -> Result<Vec<DeviceView>, EngineError> {
        self.views.build(query)
    }

    pub fn device(&self, id: &str) -> Result<Device, EngineError> {
        self.store()
            .get_device(id)?
            .ok_or_else(|| EngineError::device_not_found(id))
    }

    /// Record a caller's preferred state and queue a command if the device is not
    /// already there.
    #[tracing::instrument(skip(self), fields(device = %request.device))]
    pub async fn set_state(&self, request: &StateChangeRequest) -> Result<WriteOutcome, EngineError> {
        let command = Command::parse(&request.command, &request.value)?;

        // Unknown ids never get a lock entry.
        self.device(&request.device)?;
        let lock = self.reconciler.locks.get(&request.device);
        let _held = lock.lock().await;

        let device = self.store().set_preferred(&request.device, command)?;

        let reached = match command {
            Command::Turn(power) => device.actual_power == Some(power),
            Command::Brightness(level) => device.actual_brightness == Some(level),
        };
        if reached {
            debug!("Device already reports {}, nothing to queue", command);
            return Ok(WriteOutcome {
                device,
                queued: None,
                suppressed: false,
            });
        }

        let entry = self
            .store()
            .enqueue_unless_pending(NewCommand::for_device(&device, command))?;
        match &entry {
            Some(e) => info!(entry = %e.id, "Queued {}", command),
            None => info!("Not queueing {}, a command is already in flight", command),
        }
        Ok(WriteOutcome {
            device,
            suppressed: entry.is_none(),
            queued: entry.map(|e| e.id),
        })
    }

    /// Queue a command without consulting the pending guard. For manual retries.
    #[tracing::instrument(skip(self))]
    pub fn send_command(&self, device: &str, command: Command) -> Result<CommandQueueEntry, EngineError> {
        let device = self.device(device)?;
        let entry = self.store().enqueue(NewCommand::for_device(&device, command))?;
        info!(entry = %entry.id, "Queued {} for {} (unguarded)", command, device.id);
        Ok(entry)
    }

    pub fn pending_commands(&self, device: &str) -> Result<Vec<CommandQueueEntry>, EngineError> {
        self.device(device)?;
        Ok(self.store().list_pending(device)?)
    }

    /// Move a queue entry along its lifecycle on behalf of the executor.
    pub fn transition(&self, entry: EntryId, status: CommandStatus) -> Result<CommandQueueEntry, EngineError> {
        match self.store().transition(entry, status) {
            Ok(e) => {
                info!(entry = %e.id, device = %e.device, "Command is now {}", e.status);
                Ok(e)
            }
            Err(StoreError::UnknownEntry(id)) => {
                Err(EngineError::NotFound(format!("command queue entry {}", id)))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn add_room(&self, name: &str) -> Result<Room, EngineError> {
        if name.trim().is_empty() {
            return Err(EngineError::validation("room name must not be empty"));
        }
        Ok(self.store().insert_room(name.trim())?)
    }

    pub fn rooms(&self) -> Result<Vec<Room>, EngineError> {
        Ok(self.store().list_rooms()?)
    }

    /// Replace the caller-owned configuration of a device.
    #[tracing::instrument(skip(self, update))]
    pub fn update_config(&self, device: &str, update: &DeviceConfigUpdate) -> Result<Device, EngineError> {
        self.device(device)?;
        if let Some(room) = update.room {
            if !self.store().list_rooms()?.iter().any(|r| r.id == room) {
                return Err(EngineError::NotFound(format!("room {}", room)));
            }
        }
        if let Some(code) = update.x10_code.as_deref().filter(|c| !c.is_empty()) {
            if let Some(other) = self.store().find_by_x10(code, Some(device))? {
                return Err(EngineError::validation(format!(
                    "X10 code {} is already used by {}",
                    code, other.id
                )));
            }
        }
        Ok(self.store().update_config(device, update)?)
    }

    fn group(&self, id: GroupId) -> Result<DeviceGroup, EngineError> {
        self.store()
            .get_group(id)?
            .ok_or_else(|| EngineError::NotFound(format!("device group {}", id)))
    }

    /// Create a group represented by `reference_device`, which must be of `model`.
    #[tracing::instrument(skip(self))]
    pub fn create_group(
        &self,
        name: &str,
        model: &str,
        reference_device: &str,
    ) -> Result<DeviceGroup, EngineError> {
        if name.trim().is_empty() {
            return Err(EngineError::validation("group name must not be empty"));
        }
        let device = self.device(reference_device)?;
        if device.model != model {
            return Err(EngineError::validation(format!(
                "device {} is a {}, not a {}",
                device.id, device.model, model
            )));
        }
        if device.group.is_some() {
            return Err(EngineError::validation(format!(
                "device {} already belongs to a group",
                device.id
            )));
        }
        let group = self.store().create_group(name.trim(), model, reference_device)?;
        info!(group = %group.id, "Created group {}", group.name);
        Ok(group)
    }

    /// Add a device to a group. It is then only shown through the reference device.
    #[tracing::instrument(skip(self))]
    pub fn join_group(&self, device: &str, group: GroupId) -> Result<Device, EngineError> {
        let d = self.device(device)?;
        let g = self.group(group)?;
        if d.model != g.model {
            return Err(EngineError::validation(format!(
                "device {} is a {}, group {} holds {}",
                d.id, d.model, g.name, g.model
            )));
        }
        if let Some(current) = d.group.filter(|c| *c != group) {
            if self.group(current)?.reference_device == d.id {
                return Err(EngineError::validation(format!(
                    "device {} represents group {}; delete that group first",
                    d.id, current
                )));
            }
        }
        if g.reference_device == d.id {
            return Ok(d);
        }
        Ok(self.store().set_membership(device, Some((group, true)))?)
    }

    /// Take a device out of its group.
    ///
    /// The reference device can only leave once it is the last member, and its
    /// leaving removes the group.
    #[tracing::instrument(skip(self))]
    pub fn leave_group(&self, device: &str) -> Result<Device, EngineError> {
        let d = self.device(device)?;
        let Some(group) = d.group else {
            return Ok(d);
        };
        let g = self.group(group)?;
        if g.reference_device != d.id {
            return Ok(self.store().set_membership(device, None)?);
        }

        let others = self
            .store()
            .group_members(group)?
            .into_iter()
            .filter(|m| m.id != d.id)
            .count();
        if others > 0 {
            return Err(EngineError::validation(format!(
                "device {} represents group {} which still has {} other members",
                d.id, g.name, others
            )));
        }
        self.store().delete_group(group)?;
        info!(group = %group, "Removed group {} with its last member", g.name);
        self.device(device)
    }

    #[tracing::instrument(skip(self))]
    pub fn delete_group(&self, group: GroupId) -> Result<(), EngineError> {
        self.group(group)?;
        self.store().delete_group(group)?;
        info!(group = %group, "Deleted group");
        Ok(())
    }

    pub fn group_members(&self, group: GroupId) -> Result<Vec<Device>, EngineError> {
        self.group(group)?;
        Ok(self.store().group_members(group)?)
    }

    /// Groups a device of `model` could join.
    pub fn available_groups(&self, model: &str) -> Result<Vec<DeviceGroup>, EngineError> {
        Ok(self
            .store()
            .list_groups()?
            .into_iter()
            .filter(|g| g.model == model)
            .collect())
    }
}

fn skipped(vendor: &str, reason: &str) -> VendorReport {
    VendorReport {
        vendor: vendor.to_string(),
        duration_ms: 0,
        outcome: VendorOutcome::Skipped {
            reason: reason.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Brightness;
    use crate::engine::DeviceDescriptor;
    use crate::engine::PowerState;

    fn device() -> Device {
        Device::from_descriptor(&DeviceDescriptor {
            id: "D1".to_string(),
            brand: "govee".to_string(),
            model: "H6008".to_string(),
            name: "Lamp".to_string(),
            raw: serde_json::Value::Null,
        })
    }

    #[test]
    fn test_no_preference_never_diverges() {
        let mut d = device();
        d.actual_power = Some(PowerState::Off);
        d.actual_brightness = Some(Brightness::saturating(10));
        assert_eq!(divergence(&d), None);
    }

    #[test]
    fn test_power_divergence_wins() {
        let mut d = device();
        d.actual_power = Some(PowerState::Off);
        d.actual_brightness = Some(Brightness::saturating(10));
        d.preferred_power = Some(PowerState::On);
        d.preferred_brightness = Some(Brightness::saturating(80));
        assert_eq!(divergence(&d), Some(Command::Turn(PowerState::On)));

        d.actual_power = Some(PowerState::On);
        assert_eq!(
            divergence(&d),
            Some(Command::Brightness(Brightness::saturating(80)))
        );

        d.actual_brightness = Some(Brightness::saturating(80));
        assert_eq!(divergence(&d), None);
    }

    #[test]
    fn test_brightness_diverges_while_off() {
        let mut d = device();
        d.actual_power = Some(PowerState::Off);
        d.actual_brightness = Some(Brightness::saturating(10));
        d.preferred_power = Some(PowerState::Off);
        d.preferred_brightness = Some(Brightness::saturating(80));
        assert_eq!(
            divergence(&d),
            Some(Command::Brightness(Brightness::saturating(80)))
        );

        d.actual_brightness = Some(Brightness::saturating(80));
        assert_eq!(divergence(&d), None);
    }

    #[test]
    fn test_unobserved_device_diverges_on_power() {
        let mut d = device();
        d.preferred_power = Some(PowerState::Off);
        assert_eq!(divergence(&d), Some(Command::Turn(PowerState::Off)));
    }

    #[tokio::test]
    async fn test_unknown_device_write_takes_no_lock() {
        let engine = Engine::new(
            Arc::new(crate::store::MemoryStore::new()),
            Vec::new(),
            EngineConfig::default(),
        );
        let request = StateChangeRequest {
            device: "nope".to_string(),
            command: "turn".to_string(),
            value: serde_json::json!("on"),
        };

        let err = engine.set_state(&request).await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
        assert!(engine.reconciler.locks.0.lock().unwrap().is_empty());
    }
}
