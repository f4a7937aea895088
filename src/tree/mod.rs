pub mod actions;
pub mod handlers;
pub mod populate;

use std::collections::{
    BTreeMap,
    HashSet,
};

use tracing::{
    debug,
    warn,
};

use crate::config::Config;
use crate::entity::action::Action;
use crate::entity::device::{
    names_match,
    Device,
    DeviceId,
    DeviceKind,
};
use crate::errors::BlkError;
use crate::linux;

/// Flags accepted by every lookup: whether to match aggregates that are
/// missing members, and whether to also search the hidden list.
#[derive(Debug, Default, Clone, Copy)]
pub struct LookupOpts {
    pub incomplete: bool,
    pub hidden: bool,
}

impl LookupOpts {
    pub fn any() -> Self {
        LookupOpts {
            incomplete: true,
            hidden: true,
        }
    }
}

/// The in-memory model of the machine's storage topology, plus the queue
/// of pending actions against it. Constructed once per storage session.
#[derive(Debug, Default)]
pub struct DeviceTree {
    pub config: Config,

    devices: BTreeMap<DeviceId, Device>,

    /// Deliberately excluded devices, kept for identity-collision
    /// avoidance. Leaves-first order.
    hidden: Vec<Device>,

    actions: Vec<Action>,
    completed: Vec<Action>,

    /// Every name this tree has ever handed out or hidden, so rescans
    /// and new devices cannot collide.
    names: HashSet<String>,

    /// Disks dropped by the ignore-check during populate.
    ignored_disks: HashSet<String>,

    /// Allow-list, back-filled with aggregate members during populate.
    exclusive_disks: Vec<String>,

    /// Computed once at the start of each population pass.
    protected_names: HashSet<String>,

    next_device_id: DeviceId,
    next_action_id: u64,
}

impl DeviceTree {
    pub fn new(config: Config) -> Self {
        DeviceTree {
            exclusive_disks: config.exclusive_disks.clone(),
            config,
            next_device_id: 1,
            next_action_id: 1,
            ..Default::default()
        }
    }

    /// Clears all state except configuration. Used between the locate
    /// phase and re-scans.
    pub fn reset(&mut self) {
        let config = std::mem::take(&mut self.config);
        *self = DeviceTree::new(config);
    }

    pub fn alloc_device_id(&mut self) -> DeviceId {
        let id = self.next_device_id;
        self.next_device_id += 1;

        id
    }

    pub(crate) fn alloc_action_id(&mut self) -> u64 {
        let id = self.next_action_id;
        self.next_action_id += 1;

        id
    }

    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    pub fn hidden_devices(&self) -> impl Iterator<Item = &Device> {
        self.hidden.iter()
    }

    pub fn ignored_disks(&self) -> &HashSet<String> {
        &self.ignored_disks
    }

    pub fn exclusive_disks(&self) -> &[String] {
        &self.exclusive_disks
    }

    pub fn get_device(&self, id: DeviceId) -> Option<&Device> {
        self.devices.get(&id)
    }

    pub fn get_device_mut(&mut self, id: DeviceId) -> Option<&mut Device> {
        self.devices.get_mut(&id)
    }

    pub(crate) fn device(&self, id: DeviceId) -> Result<&Device, BlkError> {
        self.devices
            .get(&id)
            .ok_or_else(|| BlkError::NoSuchDevice(format!("device id {id}")))
    }

    pub(crate) fn device_mut(&mut self, id: DeviceId) -> Result<&mut Device, BlkError> {
        self.devices
            .get_mut(&id)
            .ok_or_else(|| BlkError::NoSuchDevice(format!("device id {id}")))
    }

    /// Adds a device to the tree. Every listed parent must already be
    /// present, the name must be free, and the UUID must be unique among
    /// visible devices.
    pub fn add_device(&mut self, device: Device) -> Result<DeviceId, BlkError> {
        for parent in &device.parents {
            if !self.devices.contains_key(parent) {
                return Err(BlkError::Device(format!(
                    "cannot add {}: parent id {parent} not in tree",
                    device.name,
                )));
            }
        }

        if !device.is_nodevice() {
            if self
                .devices
                .values()
                .any(|d| d.name == device.name && !d.is_nodevice())
            {
                return Err(BlkError::DeviceTree(format!(
                    "device name {} already in tree",
                    device.name,
                )));
            }

            if let Some(uuid) = &device.uuid {
                let dup = self
                    .devices
                    .values()
                    .any(|d| !d.is_nodevice() && d.uuid.as_ref() == Some(uuid));

                if dup {
                    return Err(BlkError::DeviceTree(format!(
                        "duplicate uuid {uuid} for device {}",
                        device.name,
                    )));
                }
            }
        }

        if device.format.exists != device.exists && !device.format.is_none() {
            return Err(BlkError::Bug(format!(
                "device {} exists={} but its format exists={}",
                device.name, device.exists, device.format.exists,
            )));
        }

        debug!(
            name = %device.name,
            kind = device.type_name(),
            exists = device.exists,
            "added device to tree"
        );

        let id = device.id;
        self.names.insert(device.name.clone());
        self.devices.insert(id, device);

        Ok(id)
    }

    /// Removes a device. Leaf-only unless `force` (reserved for
    /// extended-partition cleanup and the hide cascade).
    pub fn remove_device(&mut self, id: DeviceId, force: bool) -> Result<Device, BlkError> {
        let device = self.device(id)?;

        if device.protected && !force {
            return Err(BlkError::Device(format!(
                "cannot remove protected device {}",
                device.name,
            )));
        }

        if !force && !self.children_of(id).is_empty() {
            let name = device.name.clone();

            return Err(BlkError::Device(format!(
                "cannot remove non-leaf device {name}",
            )));
        }

        let device = self
            .devices
            .remove(&id)
            .ok_or_else(|| BlkError::NoSuchDevice(format!("device id {id}")))?;

        self.names.remove(&device.name);

        debug!(name = %device.name, "removed device from tree");

        Ok(device)
    }

    pub fn children_of(&self, id: DeviceId) -> Vec<DeviceId> {
        self.devices
            .values()
            .filter(|d| d.parents.contains(&id))
            .map(|d| d.id)
            .collect()
    }

    pub fn is_leaf(&self, id: DeviceId) -> bool {
        self.children_of(id).is_empty()
    }

    pub fn leaves(&self) -> Vec<DeviceId> {
        self.devices
            .keys()
            .copied()
            .filter(|id| self.is_leaf(*id))
            .collect()
    }

    /// Whether `id` is `other` or transitively stacked on it.
    pub fn depends_on(&self, id: DeviceId, other: DeviceId) -> bool {
        if id == other {
            return true;
        }

        let Some(device) = self.devices.get(&id) else {
            return false;
        };

        device.parents.iter().any(|p| self.depends_on(*p, other))
    }

    /// Every device stacked on `id`, directly or transitively.
    pub fn dependents_of(&self, id: DeviceId) -> Vec<DeviceId> {
        self.devices
            .keys()
            .copied()
            .filter(|d| *d != id && self.depends_on(*d, id))
            .collect()
    }

    /// Stack depth, used to order teardown/setup passes.
    fn depth(&self, id: DeviceId) -> usize {
        let Some(device) = self.devices.get(&id) else {
            return 0;
        };

        device
            .parents
            .iter()
            .map(|p| self.depth(*p) + 1)
            .max()
            .unwrap_or(0)
    }

    /// Node path, resolving btrfs volumes and subvolumes through their
    /// parents since they have no node of their own.
    pub fn device_path(&self, id: DeviceId) -> Result<String, BlkError> {
        let device = self.device(id)?;

        match &device.kind {
            DeviceKind::BtrfsVolume(_) | DeviceKind::BtrfsSubvolume(_) => {
                let parent = device.parents.first().copied().ok_or_else(|| {
                    BlkError::DeviceTree(format!(
                        "btrfs device {} has no parents",
                        device.name,
                    ))
                })?;

                self.device_path(parent)
            }
            _ => Ok(device.path()),
        }
    }

    fn visible_matching<'a>(
        &'a self,
        opts: LookupOpts,
        pred: impl Fn(&Device) -> bool,
    ) -> Option<&'a Device> {
        let live = self
            .devices
            .values()
            .find(|d| (opts.incomplete || d.is_complete()) && pred(d));

        if live.is_some() {
            return live;
        }

        if opts.hidden {
            return self
                .hidden
                .iter()
                .find(|d| (opts.incomplete || d.is_complete()) && pred(d));
        }

        None
    }

    pub fn get_device_by_name(&self, name: &str, opts: LookupOpts) -> Option<&Device> {
        self.visible_matching(opts, |d| names_match(&d.name, name))
    }

    /// Matches the device's own UUID or its format's UUID.
    pub fn get_device_by_uuid(&self, uuid: &str, opts: LookupOpts) -> Option<&Device> {
        self.visible_matching(opts, |d| {
            d.uuid.as_deref() == Some(uuid) || d.format.uuid.as_deref() == Some(uuid)
        })
    }

    pub fn get_device_by_label(&self, label: &str, opts: LookupOpts) -> Option<&Device> {
        self.visible_matching(opts, |d| d.format.label.as_deref() == Some(label))
    }

    pub fn get_device_by_serial(&self, serial: &str, opts: LookupOpts) -> Option<&Device> {
        self.visible_matching(opts, |d| d.serial.as_deref() == Some(serial))
    }

    pub fn get_device_by_sysfs_path(
        &self,
        path: &str,
        opts: LookupOpts,
    ) -> Option<&Device> {
        self.visible_matching(opts, |d| d.sysfs_path.as_deref() == Some(path))
    }

    pub fn get_device_by_id(&self, id: DeviceId, opts: LookupOpts) -> Option<&Device> {
        self.visible_matching(opts, |d| d.id == id)
    }

    pub fn get_devices_by_type(&self, type_name: &str) -> Vec<&Device> {
        self.devices
            .values()
            .filter(|d| d.type_name() == type_name)
            .collect()
    }

    /// Resolves a loosely-specified device string down to a concrete
    /// device: `UUID=`, `LABEL=`, a BIOS drive-number token (`0x80`...),
    /// a `/dev/...` path with device-mapper/md canonicalization, or a
    /// configured disk-image name. For btrfs, `options` may narrow the
    /// resolved volume to a subvolume via `subvol=`/`subvolid=`.
    pub fn resolve_device_spec(
        &self,
        spec: &str,
        options: Option<&str>,
        opts: LookupOpts,
    ) -> Option<&Device> {
        let device = self.resolve_spec_inner(spec, opts)?;

        if let (DeviceKind::BtrfsVolume(_), Some(options)) = (&device.kind, options) {
            if let Some(narrowed) = self.narrow_to_subvol(device.id, options) {
                return Some(narrowed);
            }
        }

        Some(device)
    }

    fn resolve_spec_inner(&self, spec: &str, opts: LookupOpts) -> Option<&Device> {
        if let Some(uuid) = spec.strip_prefix("UUID=") {
            return self.get_device_by_uuid(uuid, opts);
        }

        if let Some(label) = spec.strip_prefix("LABEL=") {
            return self.get_device_by_label(label, opts);
        }

        // BIOS drive number: 0x80 is the first disk.
        if let Some(hex) = spec.strip_prefix("0x") {
            let drive = u64::from_str_radix(hex, 16).ok()?;
            let index = drive.checked_sub(0x80)? as usize;

            let mut disks: Vec<&Device> =
                self.devices.values().filter(|d| d.is_disk()).collect();
            disks.sort_by(|a, b| a.name.cmp(&b.name));

            return disks.get(index).copied();
        }

        if let Some(image_path) = self.config.disk_images.get(spec) {
            return self.visible_matching(opts, |d| match &d.kind {
                DeviceKind::FileDevice(info) => &info.file_path == image_path,
                _ => false,
            });
        }

        let name = spec.strip_prefix("/dev/").unwrap_or(spec);

        // /dev/mapper and /dev/md nodes canonicalize to tree names.
        if let Some(dm_name) = name.strip_prefix("mapper/") {
            return self.get_device_by_name(dm_name, opts);
        }

        if let Some(md_name) = name.strip_prefix("md/") {
            return self
                .get_device_by_name(&format!("md{md_name}"), opts)
                .or_else(|| self.get_device_by_name(md_name, opts));
        }

        self.get_device_by_name(name, opts)
    }

    fn narrow_to_subvol(&self, vol: DeviceId, options: &str) -> Option<&Device> {
        let mut subvol_path = None;
        let mut subvol_id = None;

        for opt in options.split(',') {
            if let Some(path) = opt.strip_prefix("subvol=") {
                subvol_path = Some(path.trim_start_matches('/'));
            } else if let Some(id) = opt.strip_prefix("subvolid=") {
                subvol_id = id.parse::<u64>().ok();
            }
        }

        self.devices.values().find(|d| {
            d.parents.iter().any(|p| self.depends_on(*p, vol) || *p == vol)
                && match &d.kind {
                    DeviceKind::BtrfsSubvolume(info) => {
                        subvol_path == Some(info.subvol_path.as_str())
                            || subvol_id == Some(info.vol_id)
                    }
                    _ => false,
                }
        })
    }

    /// Mountpoint to device name, for every formatted device that knows
    /// where it mounts.
    pub fn filesystems(&self) -> BTreeMap<String, String> {
        self.devices
            .values()
            .filter_map(|d| {
                d.format
                    .mountpoint
                    .as_ref()
                    .map(|m| (m.clone(), d.name.clone()))
            })
            .collect()
    }

    /// Format UUID to device name.
    pub fn uuids(&self) -> BTreeMap<String, String> {
        self.devices
            .values()
            .filter_map(|d| {
                d.format
                    .uuid
                    .as_ref()
                    .map(|u| (u.clone(), d.name.clone()))
            })
            .collect()
    }

    /// Format label to device name.
    pub fn labels(&self) -> BTreeMap<String, String> {
        self.devices
            .values()
            .filter_map(|d| {
                d.format
                    .label
                    .as_ref()
                    .map(|l| (l.clone(), d.name.clone()))
            })
            .collect()
    }

    /// Hides `device` and everything stacked on it: children first
    /// (depth-first, so the hidden list ends up leaves-first), canceling
    /// the entire action queue up front since a hidden subtree
    /// invalidates the assumptions the queue was built on.
    pub fn hide(&mut self, id: DeviceId) -> Result<(), BlkError> {
        self.cancel_all_actions();
        self.hide_inner(id)
    }

    fn hide_inner(&mut self, id: DeviceId) -> Result<(), BlkError> {
        for child in self.children_of(id) {
            self.hide_inner(child)?;
        }

        let exists = self.device(id)?.exists;

        if exists {
            // Children were just hidden, so force-removal is safe here.
            let device = self.remove_device(id, true)?;

            debug!(name = %device.name, "hiding device");

            // The name stays reserved so a rescan cannot hand it out to
            // a colliding device.
            self.names.insert(device.name.clone());
            self.hidden.push(device);
        }

        Ok(())
    }

    /// Restores `device` and everything that depends on it from the
    /// hidden list. The list is leaves-first, so the reverse scan
    /// reinserts roots before their dependents.
    pub fn unhide(&mut self, id: DeviceId) -> Result<(), BlkError> {
        let mut restored = Vec::new();

        for i in (0..self.hidden.len()).rev() {
            let matches = {
                let d = &self.hidden[i];
                d.id == id || self.hidden_depends_on(d, id)
            };

            if matches {
                restored.push(self.hidden.remove(i));
            }
        }

        if restored.is_empty() {
            return Err(BlkError::NoSuchDevice(format!(
                "device id {id} is not hidden",
            )));
        }

        for device in restored {
            self.names.remove(&device.name);
            self.add_device(device)?;
        }

        Ok(())
    }

    /// `depends_on` over the union of live and hidden devices, needed
    /// while the subtree in question is still on the hidden list.
    fn hidden_depends_on(&self, device: &Device, other: DeviceId) -> bool {
        if device.id == other {
            return true;
        }

        device.parents.iter().any(|p| {
            if self.depends_on(*p, other) {
                return true;
            }

            self.hidden
                .iter()
                .find(|h| h.id == *p)
                .map(|h| self.hidden_depends_on(h, other))
                .unwrap_or(false)
        })
    }

    /// Deactivates every unprotected device, leaves first. Best effort:
    /// failures are logged and the pass continues.
    pub fn teardown_all(&mut self) {
        if self.config.mode.offline() {
            return;
        }

        let mut ids: Vec<DeviceId> = self.devices.keys().copied().collect();
        ids.sort_by_key(|id| std::cmp::Reverse(self.depth(*id)));

        for id in ids {
            let Some(device) = self.devices.get(&id) else {
                continue;
            };

            if device.protected || !device.exists || !device.controllable {
                continue;
            }

            if let Err(err) = self.teardown_device(id) {
                warn!(
                    device = %self.devices[&id].name,
                    %err,
                    "teardown failed, continuing"
                );
            }
        }
    }

    fn teardown_device(&self, id: DeviceId) -> Result<(), BlkError> {
        let device = self.device(id)?;

        match &device.kind {
            DeviceKind::LvmVolumeGroup(_) => linux::lvm::deactivate_vg(&device.name),
            DeviceKind::MdArray(_) => linux::mdadm::stop(&device.path()),
            DeviceKind::LuksMapping => linux::luks::close(&device.name),
            DeviceKind::Multipath(_) => linux::multipath::flush(&device.name),
            DeviceKind::DmRaidArray(info) => linux::dmraid::deactivate(&info.raid_set),
            _ if device.format.exists => device.format.teardown(),
            _ => Ok(()),
        }
    }

    /// Activates every device, roots first. Best effort.
    pub fn setup_all(&mut self) {
        if self.config.mode.offline() {
            return;
        }

        let mut ids: Vec<DeviceId> = self.devices.keys().copied().collect();
        ids.sort_by_key(|id| self.depth(*id));

        for id in ids {
            let Some(device) = self.devices.get(&id) else {
                continue;
            };

            if !device.exists || !device.controllable {
                continue;
            }

            let result = match &device.kind {
                DeviceKind::LvmVolumeGroup(_) => {
                    linux::lvm::activate_vg(&device.name)
                }
                DeviceKind::DmRaidArray(info) => {
                    linux::dmraid::activate(&info.raid_set)
                }
                _ => Ok(()),
            };

            if let Err(err) = result {
                warn!(device = %device.name, %err, "setup failed, continuing");
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::config::{
        Config,
        Mode,
    };
    use crate::entity::device::DiskInfo;

    pub fn testing_tree() -> DeviceTree {
        DeviceTree::new(Config {
            mode: Mode::Testing,
            ..Default::default()
        })
    }

    pub fn add_disk(tree: &mut DeviceTree, name: &str) -> DeviceId {
        let id = tree.alloc_device_id();
        let mut disk = Device::new(id, name, DeviceKind::Disk(DiskInfo::default()));
        disk.exists = true;

        tree.add_device(disk).expect("add_disk failed")
    }

    pub fn add_child(
        tree: &mut DeviceTree,
        parent: DeviceId,
        name: &str,
        kind: DeviceKind,
    ) -> DeviceId {
        let id = tree.alloc_device_id();
        let mut device = Device::new(id, name, kind);
        device.exists = true;
        device.parents = vec![parent];

        tree.add_device(device).expect("add_child failed")
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::entity::device::{
        BtrfsSubvolInfo,
        BtrfsVolInfo,
        DiskInfo,
        PartType,
        PartitionInfo,
    };

    #[test]
    fn test_parent_must_be_present() {
        let mut tree = testing_tree();

        let id = tree.alloc_device_id();
        let mut orphan = Device::new(id, "sda1", DeviceKind::NoDevice);
        orphan.parents = vec![9999];

        let result = tree.add_device(orphan);

        assert!(matches!(result, Err(BlkError::Device(_))));
    }

    #[test]
    fn test_duplicate_uuid_rejected() {
        let mut tree = testing_tree();

        let a = tree.alloc_device_id();
        let mut disk_a = Device::new(a, "sda", DeviceKind::Disk(DiskInfo::default()));
        disk_a.exists = true;
        disk_a.uuid = Some("11-22".to_string());
        tree.add_device(disk_a).expect("first add failed");

        let b = tree.alloc_device_id();
        let mut disk_b = Device::new(b, "sdb", DeviceKind::Disk(DiskInfo::default()));
        disk_b.exists = true;
        disk_b.uuid = Some("11-22".to_string());

        let result = tree.add_device(disk_b);

        assert!(matches!(result, Err(BlkError::DeviceTree(_))));
    }

    #[test]
    fn test_leaf_only_removal() {
        let mut tree = testing_tree();

        let disk = add_disk(&mut tree, "sda");
        let part = add_child(
            &mut tree,
            disk,
            "sda1",
            DeviceKind::Partition(PartitionInfo {
                number: 1,
                part_type: PartType::Primary,
                disk,
            }),
        );

        assert!(!tree.is_leaf(disk));
        assert!(tree.is_leaf(part));

        let result = tree.remove_device(disk, false);
        assert!(matches!(result, Err(BlkError::Device(_))));

        tree.remove_device(part, false).expect("leaf removal failed");
        tree.remove_device(disk, false)
            .expect("removal after child gone failed");

        assert_eq!(tree.devices().count(), 0);
    }

    #[test]
    fn test_depends_on() {
        let mut tree = testing_tree();

        let disk = add_disk(&mut tree, "sda");
        let part = add_child(
            &mut tree,
            disk,
            "sda1",
            DeviceKind::Partition(PartitionInfo {
                number: 1,
                part_type: PartType::Primary,
                disk,
            }),
        );
        let luks = add_child(&mut tree, part, "luks-62", DeviceKind::LuksMapping);

        assert!(tree.depends_on(luks, disk));
        assert!(tree.depends_on(luks, luks));
        assert!(!tree.depends_on(disk, luks));

        assert_eq!(tree.dependents_of(disk), vec![part, luks]);
        assert_eq!(tree.leaves(), vec![luks]);
    }

    #[test]
    fn test_name_lookup_with_dash_escape() {
        let mut tree = testing_tree();
        let disk = add_disk(&mut tree, "sda");

        add_child(
            &mut tree,
            disk,
            "my-vg-data",
            DeviceKind::NoDevice,
        );

        // NoDevice is excluded from name collisions but still findable.
        assert!(tree
            .get_device_by_name("my--vg-data", LookupOpts::default())
            .is_some());
        assert!(tree
            .get_device_by_name("my-vg-data", LookupOpts::default())
            .is_some());
        assert!(tree
            .get_device_by_name("other", LookupOpts::default())
            .is_none());
    }

    #[test]
    fn test_uuid_lookup_includes_format_uuid() {
        let mut tree = testing_tree();

        let id = tree.alloc_device_id();
        let mut disk = Device::new(id, "sda", DeviceKind::Disk(DiskInfo::default()));
        disk.exists = true;
        disk.format = crate::entity::format::Format {
            uuid: Some("fmt-uuid-1".to_string()),
            exists: true,
            ..Default::default()
        };
        tree.add_device(disk).expect("add failed");

        let found = tree.get_device_by_uuid("fmt-uuid-1", LookupOpts::default());

        assert_eq!(found.map(|d| d.name.as_str()), Some("sda"));
    }

    #[test]
    fn test_resolve_device_spec() {
        let mut tree = testing_tree();

        let disk = add_disk(&mut tree, "sda");
        let part = add_child(
            &mut tree,
            disk,
            "sda1",
            DeviceKind::Partition(PartitionInfo {
                number: 1,
                part_type: PartType::Primary,
                disk,
            }),
        );

        {
            let part = tree.get_device_mut(part).expect("no partition");
            part.format.uuid = Some("aaaa-bbbb".to_string());
            part.format.label = Some("root".to_string());
        }

        let opts = LookupOpts::default();

        assert_eq!(
            tree.resolve_device_spec("/dev/sda1", None, opts)
                .map(|d| d.id),
            Some(part),
        );
        assert_eq!(
            tree.resolve_device_spec("UUID=aaaa-bbbb", None, opts)
                .map(|d| d.id),
            Some(part),
        );
        assert_eq!(
            tree.resolve_device_spec("LABEL=root", None, opts).map(|d| d.id),
            Some(part),
        );
        assert_eq!(
            tree.resolve_device_spec("0x80", None, opts).map(|d| d.id),
            Some(disk),
        );
        assert!(tree.resolve_device_spec("LABEL=nope", None, opts).is_none());
    }

    #[test]
    fn test_resolve_btrfs_subvol_spec() {
        let mut tree = testing_tree();

        let disk = add_disk(&mut tree, "sda");
        let vol = add_child(
            &mut tree,
            disk,
            "btrfs.1234",
            DeviceKind::BtrfsVolume(BtrfsVolInfo::default()),
        );
        let subvol = add_child(
            &mut tree,
            vol,
            "btrfs.1234/home",
            DeviceKind::BtrfsSubvolume(BtrfsSubvolInfo {
                vol_id: 258,
                parent_id: 5,
                subvol_path: "home".to_string(),
            }),
        );

        let found = tree.resolve_device_spec(
            "/dev/btrfs.1234",
            Some("noatime,subvol=home"),
            LookupOpts::default(),
        );

        assert_eq!(found.map(|d| d.id), Some(subvol));

        let by_id = tree.resolve_device_spec(
            "/dev/btrfs.1234",
            Some("subvolid=258"),
            LookupOpts::default(),
        );

        assert_eq!(by_id.map(|d| d.id), Some(subvol));
    }

    #[test]
    fn test_hide_unhide_round_trip() {
        let mut tree = testing_tree();

        let disk = add_disk(&mut tree, "sda");
        let part = add_child(
            &mut tree,
            disk,
            "sda1",
            DeviceKind::Partition(PartitionInfo {
                number: 1,
                part_type: PartType::Primary,
                disk,
            }),
        );
        let luks = add_child(&mut tree, part, "luks-62", DeviceKind::LuksMapping);

        tree.hide(disk).expect("hide failed");

        assert_eq!(tree.devices().count(), 0);
        assert_eq!(tree.hidden_devices().count(), 3);
        // Leaves-first: the mapping was hidden before its ancestors.
        assert_eq!(tree.hidden[0].id, luks);

        // The names stay reserved while hidden.
        assert!(tree.names.contains("sda1"));

        tree.unhide(disk).expect("unhide failed");

        assert_eq!(tree.devices().count(), 3);
        assert_eq!(tree.hidden_devices().count(), 0);

        let part = tree.get_device(part).expect("partition lost");
        assert_eq!(part.parents, vec![disk]);
        assert!(tree.depends_on(luks, disk));
        assert!(tree
            .find_actions(super::actions::ActionFilter::default())
            .is_empty());
    }

    #[test]
    fn test_hide_skips_planned_devices() {
        let mut tree = testing_tree();

        let disk = add_disk(&mut tree, "sda");

        let id = tree.alloc_device_id();
        let mut planned = Device::new(
            id,
            "sda9",
            DeviceKind::Partition(PartitionInfo {
                number: 9,
                part_type: PartType::Primary,
                disk,
            }),
        );
        planned.parents = vec![disk];
        // Planned devices are not physically there; hide drops them from
        // the live list via action cancellation only.
        tree.register_action(crate::entity::action::Action::create_device(planned))
            .expect("register failed");

        tree.hide(disk).expect("hide failed");

        assert_eq!(tree.devices().count(), 0);
        // Only the disk is on the hidden list; the planned partition was
        // removed by canceling its create action.
        assert_eq!(tree.hidden_devices().count(), 1);
    }

    #[test]
    fn test_reset() {
        let mut tree = testing_tree();
        add_disk(&mut tree, "sda");

        tree.reset();

        assert_eq!(tree.devices().count(), 0);
        assert_eq!(tree.config.mode, crate::config::Mode::Testing);
    }
}
