use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;
use std::sync::MutexGuard;

use chrono::DateTime;
use chrono::Utc;
use rusqlite::Connection;
use rusqlite::OptionalExtension;
use rusqlite::Row;
use rusqlite::params;

use super::CommandQueue;
use super::DeviceConfigUpdate;
use super::DeviceFilter;
use super::DeviceStore;
use super::StoreError;
use super::Upsert;
use super::apply_preference;
use crate::engine::Brightness;
use crate::engine::BrightnessPresets;
use crate::engine::Command;
use crate::engine::CommandQueueEntry;
use crate::engine::CommandStatus;
use crate::engine::Device;
use crate::engine::DeviceDescriptor;
use crate::engine::DeviceGroup;
use crate::engine::EntryId;
use crate::engine::GroupId;
use crate::engine::NewCommand;
use crate::engine::PowerState;
use crate::engine::Room;
use crate::engine::RoomId;
use crate::engine::StateProperties;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS rooms (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS device_groups (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    model TEXT NOT NULL,
    reference_device TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS devices (
    device TEXT PRIMARY KEY,
    brand TEXT NOT NULL,
    model TEXT NOT NULL,
    name TEXT NOT NULL,
    preferred_name TEXT,
    actual_power TEXT,
    actual_brightness INTEGER,
    preferred_power TEXT,
    preferred_brightness INTEGER,
    online INTEGER NOT NULL DEFAULT 0,
    room INTEGER,
    group_id INTEGER,
    show_in_group_only INTEGER NOT NULL DEFAULT 0,
    preset_low INTEGER,
    preset_medium INTEGER,
    preset_high INTEGER,
    preferred_color_temp INTEGER,
    x10_code TEXT,
    vendor TEXT NOT NULL DEFAULT '{}'
);
CREATE INDEX IF NOT EXISTS idx_devices_room ON devices(room);
CREATE INDEX IF NOT EXISTS idx_devices_group ON devices(group_id);

CREATE TABLE IF NOT EXISTS command_queue (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    device TEXT NOT NULL,
    model TEXT NOT NULL,
    brand TEXT NOT NULL,
    command TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_command_queue_device_status ON command_queue(device, status);
"#;

const DEVICE_COLUMNS: &str = "device, brand, model, name, preferred_name, actual_power, \
     actual_brightness, preferred_power, preferred_brightness, online, room, group_id, \
     show_in_group_only, preset_low, preset_medium, preset_high, preferred_color_temp, \
     x10_code, vendor";

const ENTRY_COLUMNS: &str = "id, device, model, brand, command, status, created_at";

/// A device row as stored, before its text columns are parsed.
struct DeviceRow {
    id: String,
    brand: String,
    model: String,
    name: String,
    preferred_name: Option<String>,
    actual_power: Option<String>,
    actual_brightness: Option<i64>,
    preferred_power: Option<String>,
    preferred_brightness: Option<i64>,
    online: bool,
    room: Option<i64>,
    group: Option<i64>,
    show_in_group_only: bool,
    presets: [Option<i64>; 3],
    preferred_color_temp: Option<i64>,
    x10_code: Option<String>,
    vendor: String,
}

impl DeviceRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            brand: row.get(1)?,
            model: row.get(2)?,
            name: row.get(3)?,
            preferred_name: row.get(4)?,
            actual_power: row.get(5)?,
            actual_brightness: row.get(6)?,
            preferred_power: row.get(7)?,
            preferred_brightness: row.get(8)?,
            online: row.get(9)?,
            room: row.get(10)?,
            group: row.get(11)?,
            show_in_group_only: row.get(12)?,
            presets: [row.get(13)?, row.get(14)?, row.get(15)?],
            preferred_color_temp: row.get(16)?,
            x10_code: row.get(17)?,
            vendor: row.get(18)?,
        })
    }

    fn into_device(self) -> Result<Device, StoreError> {
        let vendor = serde_json::from_str(&self.vendor).map_err(|e| StoreError::Corrupt {
            what: "device",
            reason: format!("vendor fields of {}: {}", self.id, e),
        })?;
        let [low, medium, high] = self.presets;
        Ok(Device {
            actual_power: power_from_column(self.actual_power)?,
            preferred_power: power_from_column(self.preferred_power)?,
            actual_brightness: self.actual_brightness.map(Brightness::saturating),
            preferred_brightness: self.preferred_brightness.map(Brightness::saturating),
            online: self.online,
            room: self.room.map(RoomId),
            group: self.group.map(GroupId),
            show_in_group_only: self.show_in_group_only,
            presets: BrightnessPresets {
                low: low.map(Brightness::saturating),
                medium: medium.map(Brightness::saturating),
                high: high.map(Brightness::saturating),
            },
            preferred_color_temp: self
                .preferred_color_temp
                .and_then(|t| u16::try_from(t).ok()),
            x10_code: self.x10_code,
            preferred_name: self.preferred_name,
            vendor,
            id: self.id,
            brand: self.brand,
            model: self.model,
            name: self.name,
        })
    }
}

fn power_from_column(value: Option<String>) -> Result<Option<PowerState>, StoreError> {
    value
        .map(|s| {
            s.parse::<PowerState>().map_err(|_| StoreError::Corrupt {
                what: "device",
                reason: format!("unknown power state '{}'", s),
            })
        })
        .transpose()
}

fn brightness_column(value: Option<Brightness>) -> Option<i64> {
    value.map(|b| i64::from(b.percent()))
}

struct EntryRow {
    id: i64,
    device: String,
    model: String,
    brand: String,
    command: String,
    status: String,
    created_at: String,
}

impl EntryRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            device: row.get(1)?,
            model: row.get(2)?,
            brand: row.get(3)?,
            command: row.get(4)?,
            status: row.get(5)?,
            created_at: row.get(6)?,
        })
    }

    fn into_entry(self) -> Result<CommandQueueEntry, StoreError> {
        let corrupt = |reason: String| StoreError::Corrupt {
            what: "command queue",
            reason: format!("entry {}: {}", self.id, reason),
        };
        let command: Command =
            serde_json::from_str(&self.command).map_err(|e| corrupt(e.to_string()))?;
        let status: CommandStatus = self
            .status
            .parse()
            .map_err(|_| corrupt(format!("unknown status '{}'", self.status)))?;
        let created_at = DateTime::parse_from_rfc3339(&self.created_at)
            .map_err(|e| corrupt(e.to_string()))?
            .with_timezone(&Utc);
        Ok(CommandQueueEntry {
            id: EntryId(self.id),
            device: self.device,
            model: self.model,
            brand: self.brand,
            command,
            status,
            created_at,
        })
    }
}

/// Store backed by a single SQLite database file.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Self::with_connection(Connection::open(path)?)
    }

    /// A private database that lives as long as the store.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    fn update_device<F>(&self, id: &str, f: F) -> Result<Device, StoreError>
    where
        F: FnOnce(&mut Device),
    {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut device =
            load_device(&tx, id)?.ok_or_else(|| StoreError::UnknownDevice(id.to_string()))?;
        f(&mut device);
        save_device(&tx, &device)?;
        tx.commit()?;
        Ok(device)
    }
}

fn load_device(conn: &Connection, id: &str) -> Result<Option<Device>, StoreError> {
    let sql = format!("SELECT {} FROM devices WHERE device = ?1", DEVICE_COLUMNS);
    conn.query_row(&sql, params![id], DeviceRow::from_row)
        .optional()?
        .map(DeviceRow::into_device)
        .transpose()
}

fn load_devices(
    conn: &Connection,
    clause: &str,
    args: impl rusqlite::Params,
) -> Result<Vec<Device>, StoreError> {
    let sql = format!("SELECT {} FROM devices {}", DEVICE_COLUMNS, clause);
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(args, DeviceRow::from_row)?;
    rows.map(|row| row?.into_device()).collect()
}

/// Write every column of `device`, inserting the row if it does not exist yet.
fn save_device(conn: &Connection, device: &Device) -> Result<(), StoreError> {
    let vendor = serde_json::to_string(&device.vendor).map_err(|e| StoreError::Corrupt {
        what: "device",
        reason: e.to_string(),
    })?;
    let sql = format!(
        "INSERT OR REPLACE INTO devices ({}) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)",
        DEVICE_COLUMNS
    );
    conn.execute(
        &sql,
        params![
            device.id,
            device.brand,
            device.model,
            device.name,
            device.preferred_name,
            device.actual_power.map(|p| p.as_ref().to_string()),
            brightness_column(device.actual_brightness),
            device.preferred_power.map(|p| p.as_ref().to_string()),
            brightness_column(device.preferred_brightness),
            device.online,
            device.room.map(|r| r.0),
            device.group.map(|g| g.0),
            device.show_in_group_only,
            brightness_column(device.presets.low),
            brightness_column(device.presets.medium),
            brightness_column(device.presets.high),
            device.preferred_color_temp,
            device.x10_code,
            vendor,
        ],
    )?;
    Ok(())
}

fn load_entry(conn: &Connection, id: EntryId) -> Result<Option<CommandQueueEntry>, StoreError> {
    let sql = format!("SELECT {} FROM command_queue WHERE id = ?1", ENTRY_COLUMNS);
    conn.query_row(&sql, params![id.0], EntryRow::from_row)
        .optional()?
        .map(EntryRow::into_entry)
        .transpose()
}

fn command_json(command: &Command) -> Result<String, StoreError> {
    serde_json::to_string(command).map_err(|e| StoreError::Corrupt {
        what: "command queue",
        reason: e.to_string(),
    })
}

fn group_exists(conn: &Connection, id: GroupId) -> Result<bool, StoreError> {
    Ok(conn
        .query_row(
            "SELECT 1 FROM device_groups WHERE id = ?1",
            params![id.0],
            |_| Ok(()),
        )
        .optional()?
        .is_some())
}

impl DeviceStore for SqliteStore {
    fn upsert_device(&self, descriptor: &DeviceDescriptor) -> Result<Upsert, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let upsert = match load_device(&tx, &descriptor.id)? {
            Some(mut existing) => {
                existing.refresh_identity(descriptor);
                Upsert::Updated(existing)
            }
            None => Upsert::Inserted(Device::from_descriptor(descriptor)),
        };
        save_device(&tx, upsert.device())?;
        tx.commit()?;
        Ok(upsert)
    }

    fn get_device(&self, id: &str) -> Result<Option<Device>, StoreError> {
        load_device(&*self.lock()?, id)
    }

    fn list_devices(&self, filter: &DeviceFilter) -> Result<Vec<Device>, StoreError> {
        let conn = self.lock()?;
        match filter {
            DeviceFilter::All => load_devices(&conn, "ORDER BY device", []),
            DeviceFilter::Single(id) => load_devices(&conn, "WHERE device = ?1", params![id]),
            DeviceFilter::Room(room) => {
                load_devices(&conn, "WHERE room = ?1 ORDER BY device", params![room.0])
            }
            DeviceFilter::ExcludeRoom(room) => load_devices(
                &conn,
                "WHERE room IS NULL OR room != ?1 ORDER BY device",
                params![room.0],
            ),
        }
    }

    fn apply_observed(&self, id: &str, state: &StateProperties) -> Result<Device, StoreError> {
        self.update_device(id, |d| state.apply_to(d))
    }

    fn set_preferred(&self, id: &str, command: Command) -> Result<Device, StoreError> {
        self.update_device(id, |d| apply_preference(d, command))
    }

    fn update_config(&self, id: &str, update: &DeviceConfigUpdate) -> Result<Device, StoreError> {
        self.update_device(id, |d| update.apply_to(d))
    }

    fn find_by_x10(&self, code: &str, excluding: Option<&str>) -> Result<Option<Device>, StoreError> {
        let conn = self.lock()?;
        let found = load_devices(
            &conn,
            "WHERE x10_code = ?1 AND (?2 IS NULL OR device != ?2) ORDER BY device LIMIT 1",
            params![code, excluding],
        )?;
        Ok(found.into_iter().next())
    }

    fn insert_room(&self, name: &str) -> Result<Room, StoreError> {
        let conn = self.lock()?;
        conn.execute("INSERT INTO rooms (name) VALUES (?1)", params![name])?;
        Ok(Room {
            id: RoomId(conn.last_insert_rowid()),
            name: name.to_string(),
        })
    }

    fn list_rooms(&self) -> Result<Vec<Room>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT id, name FROM rooms ORDER BY id")?;
        let rooms = stmt
            .query_map([], |row| {
                Ok(Room {
                    id: RoomId(row.get(0)?),
                    name: row.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rooms)
    }

    fn create_group(
        &self,
        name: &str,
        model: &str,
        reference_device: &str,
    ) -> Result<DeviceGroup, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut device = load_device(&tx, reference_device)?
            .ok_or_else(|| StoreError::UnknownDevice(reference_device.to_string()))?;

        tx.execute(
            "INSERT INTO device_groups (name, model, reference_device) VALUES (?1, ?2, ?3)",
            params![name, model, reference_device],
        )?;
        let group = DeviceGroup {
            id: GroupId(tx.last_insert_rowid()),
            name: name.to_string(),
            model: model.to_string(),
            reference_device: reference_device.to_string(),
        };

        device.group = Some(group.id);
        device.show_in_group_only = false;
        save_device(&tx, &device)?;
        tx.commit()?;
        Ok(group)
    }

    fn get_group(&self, id: GroupId) -> Result<Option<DeviceGroup>, StoreError> {
        let conn = self.lock()?;
        Ok(conn
            .query_row(
                "SELECT id, name, model, reference_device FROM device_groups WHERE id = ?1",
                params![id.0],
                |row| {
                    Ok(DeviceGroup {
                        id: GroupId(row.get(0)?),
                        name: row.get(1)?,
                        model: row.get(2)?,
                        reference_device: row.get(3)?,
                    })
                },
            )
            .optional()?)
    }

    fn list_groups(&self) -> Result<Vec<DeviceGroup>, StoreError> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT id, name, model, reference_device FROM device_groups ORDER BY id")?;
        let groups = stmt
            .query_map([], |row| {
                Ok(DeviceGroup {
                    id: GroupId(row.get(0)?),
                    name: row.get(1)?,
                    model: row.get(2)?,
                    reference_device: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(groups)
    }

    fn set_membership(
        &self,
        device: &str,
        membership: Option<(GroupId, bool)>,
    ) -> Result<Device, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        if let Some((group, _)) = membership {
            if !group_exists(&tx, group)? {
                return Err(StoreError::UnknownGroup(group));
            }
        }
        let mut d =
            load_device(&tx, device)?.ok_or_else(|| StoreError::UnknownDevice(device.to_string()))?;
        d.group = membership.map(|(g, _)| g);
        d.show_in_group_only = membership.is_some_and(|(_, only)| only);
        save_device(&tx, &d)?;
        tx.commit()?;
        Ok(d)
    }

    fn delete_group(&self, id: GroupId) -> Result<(), StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        if !group_exists(&tx, id)? {
            return Err(StoreError::UnknownGroup(id));
        }
        tx.execute(
            "UPDATE devices SET group_id = NULL, show_in_group_only = 0 WHERE group_id = ?1",
            params![id.0],
        )?;
        tx.execute("DELETE FROM device_groups WHERE id = ?1", params![id.0])?;
        tx.commit()?;
        Ok(())
    }

    fn group_members(&self, id: GroupId) -> Result<Vec<Device>, StoreError> {
        let conn = self.lock()?;
        load_devices(
            &conn,
            "WHERE group_id = ?1 ORDER BY COALESCE(preferred_name, name), device",
            params![id.0],
        )
    }
}

impl CommandQueue for SqliteStore {
    fn enqueue(&self, command: NewCommand) -> Result<CommandQueueEntry, StoreError> {
        let conn = self.lock()?;
        let created_at = Utc::now();
        conn.execute(
            "INSERT INTO command_queue (device, model, brand, command, status, created_at) \
             VALUES (?1, ?2, ?3, ?4, 'pending', ?5)",
            params![
                command.device,
                command.model,
                command.brand,
                command_json(&command.command)?,
                created_at.to_rfc3339(),
            ],
        )?;
        Ok(CommandQueueEntry {
            id: EntryId(conn.last_insert_rowid()),
            device: command.device,
            model: command.model,
            brand: command.brand,
            command: command.command,
            status: CommandStatus::Pending,
            created_at,
        })
    }

    fn enqueue_unless_pending(
        &self,
        command: NewCommand,
    ) -> Result<Option<CommandQueueEntry>, StoreError> {
        let conn = self.lock()?;
        let created_at = Utc::now();
        // Check and insert in one statement so another writer on the same file
        // cannot slip a command in between.
        let inserted = conn.execute(
            "INSERT INTO command_queue (device, model, brand, command, status, created_at) \
             SELECT ?1, ?2, ?3, ?4, 'pending', ?5 \
             WHERE NOT EXISTS ( \
                 SELECT 1 FROM command_queue \
                 WHERE device = ?1 AND status IN ('pending', 'processing'))",
            params![
                command.device,
                command.model,
                command.brand,
                command_json(&command.command)?,
                created_at.to_rfc3339(),
            ],
        )?;
        if inserted == 0 {
            return Ok(None);
        }
        Ok(Some(CommandQueueEntry {
            id: EntryId(conn.last_insert_rowid()),
            device: command.device,
            model: command.model,
            brand: command.brand,
            command: command.command,
            status: CommandStatus::Pending,
            created_at,
        }))
    }

    fn has_pending(&self, device: &str) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        Ok(conn
            .query_row(
                "SELECT 1 FROM command_queue \
                 WHERE device = ?1 AND status IN ('pending', 'processing') LIMIT 1",
                params![device],
                |_| Ok(()),
            )
            .optional()?
            .is_some())
    }

    fn list_pending(&self, device: &str) -> Result<Vec<CommandQueueEntry>, StoreError> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM command_queue \
             WHERE device = ?1 AND status IN ('pending', 'processing') ORDER BY id",
            ENTRY_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![device], EntryRow::from_row)?;
        rows.map(|row| row?.into_entry()).collect()
    }

    fn pending_devices(&self) -> Result<HashSet<String>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT device FROM command_queue WHERE status IN ('pending', 'processing')",
        )?;
        let devices = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<HashSet<_>>>()?;
        Ok(devices)
    }

    fn get_entry(&self, id: EntryId) -> Result<Option<CommandQueueEntry>, StoreError> {
        load_entry(&*self.lock()?, id)
    }

    fn transition(&self, id: EntryId, to: CommandStatus) -> Result<CommandQueueEntry, StoreError> {
        let conn = self.lock()?;
        let mut entry = load_entry(&conn, id)?.ok_or(StoreError::UnknownEntry(id))?;
        if !entry.status.can_transition_to(to) {
            return Err(StoreError::InvalidTransition {
                id,
                from: entry.status,
                to,
            });
        }
        // Compare-and-set on the old status in case another process moved it.
        let changed = conn.execute(
            "UPDATE command_queue SET status = ?1 WHERE id = ?2 AND status = ?3",
            params![to.as_ref(), id.0, entry.status.as_ref()],
        )?;
        if changed == 0 {
            let current = load_entry(&conn, id)?.ok_or(StoreError::UnknownEntry(id))?;
            return Err(StoreError::InvalidTransition {
                id,
                from: current.status,
                to,
            });
        }
        entry.status = to;
        Ok(entry)
    }
}
