use std::collections::{
    HashMap,
    HashSet,
};

use tracing::{
    debug,
    info,
    warn,
};

use crate::config::Mode;
use crate::entity::device::{
    Device,
    DeviceId,
    DeviceKind,
    DiskInfo,
    FileInfo,
    LoopInfo,
    MdInfo,
    MultipathInfo,
    PartType,
    PartitionInfo,
};
use crate::entity::record::{
    keys,
    DeviceRecord,
};
use crate::errors::BlkError;
use crate::linux;

use super::handlers;
use super::DeviceTree;
use super::LookupOpts;

/// Discovery working state for one population pass: the records still
/// pending classification and the monotonically growing set of names
/// already taken up. Recursion into slave/parent records terminates
/// because every step claims a name not yet in `seen`.
pub(crate) struct PopulateCtx {
    pub records: HashMap<String, DeviceRecord>,
    pub seen: HashSet<String>,
}

impl PopulateCtx {
    fn new(records: &[DeviceRecord]) -> Self {
        PopulateCtx {
            records: records
                .iter()
                .map(|r| (r.name.clone(), r.clone()))
                .collect(),
            seen: HashSet::new(),
        }
    }
}

impl DeviceTree {
    /// Full discovery pass over the given enumeration records.
    /// Idempotent when re-invoked: records matching already-known
    /// devices update them in place instead of re-adding. A bad record
    /// aborts only its own discovery; the pass continues.
    pub fn populate(&mut self, records: &[DeviceRecord]) -> Result<(), BlkError> {
        self.protected_names = self.gather_protected_names();
        self.setup_disk_images()?;

        let mut ctx = PopulateCtx::new(records);

        let mut names: Vec<String> = ctx.records.keys().cloned().collect();
        names.sort();

        for name in names {
            if let Err(err) = self.discover_by_name(&mut ctx, &name) {
                warn!(record = %name, %err, "skipping record");
            }
        }

        Ok(())
    }

    /// Protected-device names, computed once per pass: configured specs
    /// plus whatever backs the running system. `/dev/` and
    /// `/dev/mapper/` prefixes on configured specs are normalized away.
    fn gather_protected_names(&self) -> HashSet<String> {
        let mut names: HashSet<String> = self
            .config
            .protected
            .iter()
            .map(|spec| {
                let spec = spec.strip_prefix("/dev/").unwrap_or(spec);

                spec.strip_prefix("mapper/").unwrap_or(spec).to_string()
            })
            .collect();

        if !self.config.mode.offline() {
            names.extend(linux::mount::live_device_names());
        }

        names
    }

    /// In image-install mode each configured disk image becomes a
    /// file-backed loop pair up front, so the scan sees them like disks.
    fn setup_disk_images(&mut self) -> Result<(), BlkError> {
        if self.config.mode != Mode::ImageInstall {
            return Ok(());
        }

        let images: Vec<(String, String)> = self
            .config
            .disk_images
            .iter()
            .map(|(n, p)| (n.clone(), p.clone()))
            .collect();

        for (name, path) in images {
            if self
                .get_device_by_name(&name, LookupOpts::any())
                .is_some()
            {
                continue;
            }

            let file_id = self.alloc_device_id();
            let mut file = Device::new(
                file_id,
                &format!("{name}.img"),
                DeviceKind::FileDevice(FileInfo {
                    file_path: path.clone(),
                }),
            );
            file.exists = true;
            self.add_device(file)?;

            let loop_id = self.alloc_device_id();
            let mut loop_dev = Device::new(
                loop_id,
                &name,
                DeviceKind::Loop(LoopInfo {
                    backing_file: Some(path),
                }),
            );
            loop_dev.exists = true;
            loop_dev.parents = vec![file_id];
            self.add_device(loop_dev)?;
        }

        Ok(())
    }

    /// Discovers the named record if it is pending and not yet seen.
    /// Returns the id of the resulting (or already-known) device.
    pub(crate) fn discover_by_name(
        &mut self,
        ctx: &mut PopulateCtx,
        name: &str,
    ) -> Result<Option<DeviceId>, BlkError> {
        if ctx.seen.contains(name) {
            return Ok(self
                .get_device_by_name(name, LookupOpts::any())
                .map(|d| d.id));
        }

        ctx.seen.insert(name.to_string());

        let Some(record) = ctx.records.get(name).cloned() else {
            return Ok(None);
        };

        self.discover_record(ctx, &record)
    }

    fn discover_record(
        &mut self,
        ctx: &mut PopulateCtx,
        record: &DeviceRecord,
    ) -> Result<Option<DeviceId>, BlkError> {
        if self.skip_record(record) {
            debug!(record = %record.name, "skipping known-dead record");
            return Ok(None);
        }

        if self.should_ignore(record) {
            if record.is_disk() {
                self.ignored_disks.insert(record.name.clone());
            }

            debug!(record = %record.name, "ignoring record");
            return Ok(None);
        }

        // Type dispatch. Priority order matters: one physical device can
        // satisfy several predicates, and the more specific branches
        // must win.
        let device_id = if let Some(known) =
            self.get_device_by_name(&record.name, LookupOpts::any())
        {
            let id = known.id;
            self.refresh_known(id, record)?;
            Some(id)
        } else if record.is_loop() {
            self.add_loop_device(record)?
        } else if record.is_dm_mpath() && !record.is_dm_partition() {
            self.add_multipath_device(ctx, record)?
        } else if record.is_dm_partition() {
            self.add_partition_device(ctx, record)?
        } else if record.is_dm_lvm() {
            self.add_lvm_lv_device(ctx, record)?
        } else if record.is_dm_luks() {
            self.add_luks_mapping_device(ctx, record)?
        } else if record.is_dm() {
            info!(record = %record.name, "unhandled device-mapper device");
            None
        } else if record.is_md() && !record.is_md_container() {
            self.add_md_array_device(ctx, record)?
        } else if record.is_cdrom() {
            self.add_optical_device(record)?
        } else if record.is_disk() {
            self.add_disk_device(record)?
        } else if record.is_partition() {
            self.add_partition_device(ctx, record)?
        } else {
            info!(record = %record.name, "unknown device type");
            None
        };

        let Some(device_id) = device_id else {
            return Ok(None);
        };

        self.mark_protected(device_id, record);
        self.backfill_exclusive(device_id);

        handlers::handle_format(self, ctx, record, device_id)?;

        // Snapshot for diffing during commit.
        let device = self.device_mut(device_id)?;
        device.original_format = device.format.clone();

        Ok(Some(device_id))
    }

    /// Skip-check: records matching a device already scheduled for
    /// destruction, or a hidden device, are never rediscovered.
    fn skip_record(&self, record: &DeviceRecord) -> bool {
        let destroy_scheduled = self.actions.iter().any(|a| {
            match &a.kind {
                crate::entity::action::ActionKind::DestroyDevice {
                    removed: Some(device),
                } => {
                    device.name == record.name
                        || (device.sysfs_path.is_some()
                            && device.sysfs_path.as_deref()
                                == record.sysfs_path.as_deref())
                }
                _ => false,
            }
        });

        if destroy_scheduled {
            return true;
        }

        self.hidden.iter().any(|d| {
            d.name == record.name
                || (d.sysfs_path.is_some()
                    && d.sysfs_path.as_deref() == record.sysfs_path.as_deref())
                || (d.uuid.is_some() && d.uuid.as_deref() == record.fmt_uuid())
                || (d.format.uuid.is_some()
                    && d.format.uuid.as_deref() == record.fmt_uuid())
        })
    }

    /// Device-type-specific exclusion rules.
    fn should_ignore(&self, record: &DeviceRecord) -> bool {
        if record.is_mtd() {
            return true;
        }

        if record.is_loop() && record.prop(keys::LOOP_BACKING_FILE).is_none() {
            return true;
        }

        if record.is_cdrom() && record.prop(keys::ID_CDROM_MEDIA) != Some("1") {
            return true;
        }

        if record.is_disk() {
            if record.read_only {
                return true;
            }

            if self.config.ignored_disks.iter().any(|d| *d == record.name) {
                return true;
            }

            if !self.exclusive_disks.is_empty()
                && !self.disk_in_exclusive_list(record)
            {
                return true;
            }
        }

        false
    }

    /// Exclusive-list membership for a disk. A RAID-member disk also
    /// passes when the list names the array its metadata points at;
    /// the entry is rewritten to the member's own name so later passes
    /// match directly.
    fn disk_in_exclusive_list(&self, record: &DeviceRecord) -> bool {
        if self.exclusive_disks.iter().any(|d| *d == record.name) {
            return true;
        }

        if let Some(array_name) = record.prop(keys::MD_DEVNAME) {
            return self.exclusive_disks.iter().any(|d| d == array_name);
        }

        false
    }

    fn refresh_known(
        &mut self,
        id: DeviceId,
        record: &DeviceRecord,
    ) -> Result<(), BlkError> {
        let device = self.device_mut(id)?;

        if device.sysfs_path.is_none() {
            device.sysfs_path = record.sysfs_path.clone();
        }
        if device.major_minor.is_none() {
            device.major_minor = record.major_minor;
        }
        if record.size > 0 {
            device.size = record.size;
        }

        Ok(())
    }

    fn base_device(&mut self, record: &DeviceRecord, kind: DeviceKind) -> Device {
        let id = self.alloc_device_id();
        let mut device = Device::new(id, &record.name, kind);

        device.exists = true;
        device.sysfs_path = record.sysfs_path.clone();
        device.major_minor = record.major_minor;
        device.serial = record.serial.clone();
        device.size = record.size;

        device
    }

    fn add_disk_device(
        &mut self,
        record: &DeviceRecord,
    ) -> Result<Option<DeviceId>, BlkError> {
        let device = self.base_device(
            record,
            DeviceKind::Disk(DiskInfo {
                bus: record.bus.clone(),
                removable: record.removable,
                read_only: record.read_only,
            }),
        );

        Ok(Some(self.add_device(device)?))
    }

    fn add_optical_device(
        &mut self,
        record: &DeviceRecord,
    ) -> Result<Option<DeviceId>, BlkError> {
        let mut device = self.base_device(
            record,
            DeviceKind::Disk(DiskInfo {
                bus: record.bus.clone(),
                removable: true,
                read_only: true,
            }),
        );

        // Optical media are tracked but never operated on.
        device.controllable = false;

        Ok(Some(self.add_device(device)?))
    }

    fn add_loop_device(
        &mut self,
        record: &DeviceRecord,
    ) -> Result<Option<DeviceId>, BlkError> {
        let backing = record
            .prop(keys::LOOP_BACKING_FILE)
            .map(str::to_string)
            .ok_or_else(|| {
                BlkError::Device(format!(
                    "loop device {} has no backing file",
                    record.name,
                ))
            })?;

        let file_id = match self
            .devices
            .values()
            .find(|d| match &d.kind {
                DeviceKind::FileDevice(info) => info.file_path == backing,
                _ => false,
            })
            .map(|d| d.id)
        {
            Some(id) => id,
            None => {
                let id = self.alloc_device_id();
                let mut file = Device::new(
                    id,
                    &backing,
                    DeviceKind::FileDevice(FileInfo {
                        file_path: backing.clone(),
                    }),
                );
                file.exists = true;

                self.add_device(file)?
            }
        };

        let mut device = self.base_device(
            record,
            DeviceKind::Loop(LoopInfo {
                backing_file: Some(backing),
            }),
        );
        device.parents = vec![file_id];

        Ok(Some(self.add_device(device)?))
    }

    fn add_partition_device(
        &mut self,
        ctx: &mut PopulateCtx,
        record: &DeviceRecord,
    ) -> Result<Option<DeviceId>, BlkError> {
        let disk_name = partition_disk_name(record);

        let disk_id = self
            .discover_by_name(ctx, &disk_name)?
            .or_else(|| {
                self.get_device_by_name(&disk_name, LookupOpts::any())
                    .map(|d| d.id)
            })
            .ok_or_else(|| {
                BlkError::DeviceTree(format!(
                    "partition {} has no discoverable disk {disk_name}",
                    record.name,
                ))
            })?;

        let number = partition_number(&record.name);

        let mut device = self.base_device(
            record,
            DeviceKind::Partition(PartitionInfo {
                number,
                part_type: PartType::Primary,
                disk: disk_id,
            }),
        );
        device.parents = vec![disk_id];

        Ok(Some(self.add_device(device)?))
    }

    fn add_multipath_device(
        &mut self,
        ctx: &mut PopulateCtx,
        record: &DeviceRecord,
    ) -> Result<Option<DeviceId>, BlkError> {
        let mut parents = Vec::new();

        for slave in record.slaves.clone() {
            if let Some(id) = self.discover_by_name(ctx, &slave)? {
                parents.push(id);
            }
        }

        if parents.is_empty() {
            return Err(BlkError::DeviceTree(format!(
                "multipath {} has no usable member devices",
                record.name,
            )));
        }

        let name = record
            .prop(keys::DM_NAME)
            .unwrap_or(&record.name)
            .to_string();
        let wwid = record
            .prop(keys::DM_UUID)
            .and_then(|u| u.strip_prefix("mpath-"))
            .map(str::to_string);

        if wwid.is_none() && record.serial.is_none() {
            return Err(BlkError::DeviceTree(format!(
                "multipath {name} has no usable identifying metadata",
            )));
        }

        let id = self.alloc_device_id();
        let mut device = Device::new(id, &name, DeviceKind::Multipath(MultipathInfo {
            wwid,
        }));
        device.exists = true;
        device.sysfs_path = record.sysfs_path.clone();
        device.major_minor = record.major_minor;
        device.serial = record.serial.clone();
        device.size = record.size;
        device.parents = parents;

        Ok(Some(self.add_device(device)?))
    }

    fn add_luks_mapping_device(
        &mut self,
        ctx: &mut PopulateCtx,
        record: &DeviceRecord,
    ) -> Result<Option<DeviceId>, BlkError> {
        let mut parents = Vec::new();

        for slave in record.slaves.clone() {
            if let Some(id) = self.discover_by_name(ctx, &slave)? {
                parents.push(id);
            }
        }

        if parents.is_empty() {
            return Err(BlkError::DeviceTree(format!(
                "luks mapping {} has no backing device",
                record.name,
            )));
        }

        let name = record
            .prop(keys::DM_NAME)
            .unwrap_or(&record.name)
            .to_string();

        let id = self.alloc_device_id();
        let mut device = Device::new(id, &name, DeviceKind::LuksMapping);
        device.exists = true;
        device.sysfs_path = record.sysfs_path.clone();
        device.major_minor = record.major_minor;
        device.size = record.size;
        device.parents = parents;

        Ok(Some(self.add_device(device)?))
    }

    fn add_lvm_lv_device(
        &mut self,
        ctx: &mut PopulateCtx,
        record: &DeviceRecord,
    ) -> Result<Option<DeviceId>, BlkError> {
        // The LV's slaves are its PVs; discovering them runs PV
        // reconciliation, which finds or creates the VG.
        for slave in record.slaves.clone() {
            self.discover_by_name(ctx, &slave)?;
        }

        let vg_name = record.prop(keys::DM_VG_NAME).map(str::to_string);
        let lv_name = record.prop(keys::DM_LV_NAME).map(str::to_string);

        let (Some(vg_name), Some(lv_name)) = (vg_name, lv_name) else {
            return Err(BlkError::DeviceTree(format!(
                "lvm device {} carries no VG/LV naming",
                record.name,
            )));
        };

        // PV reconciliation may already have materialized this LV.
        let full_name = format!("{vg_name}-{lv_name}");
        if let Some(existing) =
            self.get_device_by_name(&full_name, LookupOpts::any())
        {
            let id = existing.id;
            self.refresh_known(id, record)?;

            return Ok(Some(id));
        }

        let vg_id = match self.get_device_by_name(&vg_name, LookupOpts::any()) {
            Some(vg) => vg.id,
            None => handlers::lvm::create_incomplete_vg(self, &vg_name)?,
        };

        handlers::lvm::add_lv_from_record(self, vg_id, &vg_name, &lv_name, record)
            .map(Some)
    }

    fn add_md_array_device(
        &mut self,
        ctx: &mut PopulateCtx,
        record: &DeviceRecord,
    ) -> Result<Option<DeviceId>, BlkError> {
        // Members first: their member-format handler finds or creates
        // the array by metadata UUID.
        for slave in record.slaves.clone() {
            self.discover_by_name(ctx, &slave)?;
        }

        let array_uuid = record.prop(keys::MD_UUID).map(str::to_string);

        if let Some(uuid) = &array_uuid {
            if let Some(existing) =
                self.get_device_by_uuid(uuid, LookupOpts::any())
            {
                // Recover the live array's human-assigned name and
                // metadata version onto the member-created device.
                let id = existing.id;
                let devname = record
                    .prop(keys::MD_DEVNAME)
                    .unwrap_or(&record.name)
                    .to_string();

                let device = self.device_mut(id)?;

                let renamed_from = if device.name != devname {
                    Some(std::mem::replace(&mut device.name, devname.clone()))
                } else {
                    None
                };

                if let DeviceKind::MdArray(info) = &mut device.kind {
                    if info.metadata_version.is_none() {
                        info.metadata_version =
                            record.prop(keys::MD_METADATA).map(str::to_string);
                    }
                }

                if let Some(old) = renamed_from {
                    self.names.remove(&old);
                    self.names.insert(devname);
                }

                self.refresh_known(id, record)?;

                return Ok(Some(id));
            }
        }

        let mut device = self.base_device(
            record,
            DeviceKind::MdArray(MdInfo {
                level: record.prop(keys::MD_LEVEL).map(str::to_string),
                metadata_version: record.prop(keys::MD_METADATA).map(str::to_string),
                member_count: record.prop_u64(keys::MD_DEVICES).map(|n| n as u32),
            }),
        );
        device.uuid = array_uuid;

        Ok(Some(self.add_device(device)?))
    }

    fn mark_protected(&mut self, id: DeviceId, record: &DeviceRecord) {
        let is_protected = self.protected_names.contains(&record.name)
            || record
                .fmt_uuid()
                .map(|u| self.protected_names.contains(&format!("UUID={u}")))
                .unwrap_or(false);

        if !is_protected {
            return;
        }

        if let Some(device) = self.devices.get_mut(&id) {
            device.protected = true;
        }

        // A device backing the running system protects its whole stack.
        let parents: Vec<DeviceId> = self
            .devices
            .get(&id)
            .map(|d| d.parents.clone())
            .unwrap_or_default();

        let mut stack = parents;
        while let Some(pid) = stack.pop() {
            if let Some(parent) = self.devices.get_mut(&pid) {
                if !parent.protected {
                    parent.protected = true;
                    stack.extend(parent.parents.clone());
                }
            }
        }
    }

    /// Aggregates named on the exclusive allow-list implicitly pull
    /// their member disks onto it, since users never list members.
    fn backfill_exclusive(&mut self, id: DeviceId) {
        let Some(device) = self.devices.get(&id) else {
            return;
        };

        let is_aggregate = matches!(
            device.kind,
            DeviceKind::Multipath(_)
                | DeviceKind::MdArray(_)
                | DeviceKind::DmRaidArray(_)
        );

        if !is_aggregate || !self.exclusive_disks.contains(&device.name) {
            return;
        }

        let members: Vec<String> = device
            .parents
            .iter()
            .filter_map(|p| self.devices.get(p))
            .map(|d| d.name.clone())
            .collect();

        for member in members {
            if !self.exclusive_disks.contains(&member) {
                self.exclusive_disks.push(member);
            }
        }
    }
}

/// Owning disk name for a partition record: prefer the kernel's slave
/// link, fall back to name surgery (`sda1` -> `sda`, `nvme0n1p2` ->
/// `nvme0n1`).
fn partition_disk_name(record: &DeviceRecord) -> String {
    if let Some(slave) = record.slaves.first() {
        return slave.clone();
    }

    let name = record.name.trim_end_matches(|c: char| c.is_ascii_digit());
    let name = match name.strip_suffix('p') {
        Some(base)
            if base
                .chars()
                .last()
                .map(|c| c.is_ascii_digit())
                .unwrap_or(false) =>
        {
            base
        }
        _ => name,
    };

    name.to_string()
}

fn partition_number(name: &str) -> u32 {
    name.chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .collect::<String>()
        .chars()
        .rev()
        .collect::<String>()
        .parse()
        .unwrap_or(0)
}

#[cfg(test)]
pub(crate) mod record_support {
    use super::*;

    pub fn disk_record(name: &str) -> DeviceRecord {
        let mut record = DeviceRecord::new(name);
        record.size = 500 << 30;
        record
            .props
            .insert(keys::DEVTYPE.to_string(), "disk".to_string());

        record
    }

    pub fn partition_record(name: &str, disk: &str) -> DeviceRecord {
        let mut record = DeviceRecord::new(name);
        record.size = 100 << 30;
        record.slaves = vec![disk.to_string()];
        record
            .props
            .insert(keys::DEVTYPE.to_string(), "partition".to_string());

        record
    }

    pub fn with_fs(mut record: DeviceRecord, fs_type: &str, uuid: &str) -> DeviceRecord {
        record
            .props
            .insert(keys::ID_FS_TYPE.to_string(), fs_type.to_string());
        record
            .props
            .insert(keys::ID_FS_UUID.to_string(), uuid.to_string());

        record
    }
}
