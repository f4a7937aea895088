use std::collections::HashMap;

use serde::{
    Deserialize,
    Serialize,
};

/// udev-style property keys the tree reads off enumeration records.
/// Everything else in a record's property map is carried opaquely.
pub mod keys {
    pub const DEVTYPE: &str = "DEVTYPE";

    pub const ID_PART_TABLE_TYPE: &str = "ID_PART_TABLE_TYPE";

    pub const ID_FS_TYPE: &str = "ID_FS_TYPE";
    pub const ID_FS_UUID: &str = "ID_FS_UUID";
    pub const ID_FS_LABEL: &str = "ID_FS_LABEL";
    pub const ID_CDROM: &str = "ID_CDROM";
    pub const ID_CDROM_MEDIA: &str = "ID_CDROM_MEDIA";

    pub const DM_NAME: &str = "DM_NAME";
    pub const DM_UUID: &str = "DM_UUID";
    pub const DM_VG_NAME: &str = "DM_VG_NAME";
    pub const DM_LV_NAME: &str = "DM_LV_NAME";
    pub const DM_MULTIPATH_DEVICE_PATH: &str = "DM_MULTIPATH_DEVICE_PATH";

    pub const MD_UUID: &str = "MD_UUID";
    pub const MD_LEVEL: &str = "MD_LEVEL";
    pub const MD_DEVNAME: &str = "MD_DEVNAME";
    pub const MD_METADATA: &str = "MD_METADATA";
    pub const MD_DEVICES: &str = "MD_DEVICES";

    // Per-PV knowledge of the owning VG, merged into the PV's record by
    // the enumeration adapter from the LVM report tools.
    pub const LVM2_VG_NAME: &str = "LVM2_VG_NAME";
    pub const LVM2_VG_UUID: &str = "LVM2_VG_UUID";
    pub const LVM2_PV_COUNT: &str = "LVM2_PV_COUNT";
    pub const LVM2_PE_SIZE: &str = "LVM2_PE_SIZE";
    pub const LVM2_LV_NAMES: &str = "LVM2_LV_NAMES";
    pub const LVM2_LV_UUIDS: &str = "LVM2_LV_UUIDS";
    pub const LVM2_LV_SIZES: &str = "LVM2_LV_SIZES";
    pub const LVM2_LV_ATTRS: &str = "LVM2_LV_ATTRS";
    pub const LVM2_LV_TYPES: &str = "LVM2_LV_TYPES";
    pub const LVM2_LV_ORIGINS: &str = "LVM2_LV_ORIGINS";
    pub const LVM2_LV_POOLS: &str = "LVM2_LV_POOLS";

    pub const DMRAID_SET_NAME: &str = "DMRAID_SET_NAME";

    // Encoded "id parent_id path" triples separated by ';', answering the
    // subvolume-listing query without the btrfs tool in offline modes.
    pub const BTRFS_SUBVOLUMES: &str = "BTRFS_SUBVOLUMES";

    pub const LOOP_BACKING_FILE: &str = "LOOP_BACKING_FILE";
}

/// Format-type hints that mark a disk as a firmware/BIOS RAID member.
const BIOSRAID_MEMBER_TYPES: [&str; 5] = [
    "isw_raid_member",
    "ddf_raid_member",
    "promise_fasttrack_raid_member",
    "via_raid_member",
    "silicon_medley_raid_member",
];

/// One normalized block-device enumeration record. The tree treats these
/// as opaque except for the named fields and predicates below; absent
/// fields are `None` rather than an error, because heterogeneous hardware
/// routinely omits them.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub name: String,

    #[serde(default)]
    pub sysfs_path: Option<String>,

    #[serde(default)]
    pub major_minor: Option<(u32, u32)>,

    #[serde(default)]
    pub serial: Option<String>,

    #[serde(default)]
    pub bus: Option<String>,

    #[serde(default)]
    pub size: u64,

    #[serde(default)]
    pub read_only: bool,

    #[serde(default)]
    pub removable: bool,

    /// Names of the devices this one is stacked on, from the kernel's
    /// holders/slaves links. Aggregates (dm, md, multipath) list their
    /// members here.
    #[serde(default)]
    pub slaves: Vec<String>,

    /// udev-style properties; see [`keys`].
    #[serde(default)]
    pub props: HashMap<String, String>,
}

impl DeviceRecord {
    pub fn new(name: &str) -> Self {
        DeviceRecord {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn path(&self) -> String {
        format!("/dev/{}", self.name)
    }

    /// A property that is simply absent yields `None`; there is no
    /// "missing key" error to catch.
    pub fn prop(&self, key: &str) -> Option<&str> {
        self.props.get(key).map(String::as_str)
    }

    pub fn prop_u64(&self, key: &str) -> Option<u64> {
        self.prop(key).and_then(|v| v.parse().ok())
    }

    /// Whitespace- or comma-separated list property.
    pub fn prop_list(&self, key: &str) -> Vec<String> {
        self.prop(key)
            .map(|v| {
                v.split(|c: char| c == ',' || c.is_whitespace())
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// blkid/udev TYPE hint for whatever is written on the device.
    pub fn fmt_type(&self) -> Option<&str> {
        self.prop(keys::ID_FS_TYPE)
    }

    pub fn fmt_uuid(&self) -> Option<&str> {
        self.prop(keys::ID_FS_UUID)
    }

    pub fn fmt_label(&self) -> Option<&str> {
        self.prop(keys::ID_FS_LABEL)
    }

    fn dm_uuid(&self) -> &str {
        self.prop(keys::DM_UUID).unwrap_or("")
    }

    // Predicates, most specific first. One physical device can satisfy
    // several of these; dispatch priority lives in tree::populate.

    pub fn is_dm(&self) -> bool {
        self.props.contains_key(keys::DM_NAME)
            || self.name.starts_with("dm-")
    }

    pub fn is_dm_lvm(&self) -> bool {
        self.dm_uuid().starts_with("LVM-")
    }

    pub fn is_dm_luks(&self) -> bool {
        self.dm_uuid().starts_with("CRYPT-LUKS")
    }

    pub fn is_dm_mpath(&self) -> bool {
        self.dm_uuid().starts_with("mpath-")
    }

    /// A partition of a device-mapper device (kpartx-style), not a
    /// mapper target of its own.
    pub fn is_dm_partition(&self) -> bool {
        self.dm_uuid().starts_with("part")
    }

    pub fn is_md(&self) -> bool {
        self.props.contains_key(keys::MD_LEVEL)
            || (self.name.starts_with("md")
                && self.name[2..].chars().all(|c| c.is_ascii_digit())
                && self.name.len() > 2)
    }

    pub fn is_md_container(&self) -> bool {
        self.prop(keys::MD_LEVEL) == Some("container")
    }

    pub fn is_cdrom(&self) -> bool {
        self.prop(keys::ID_CDROM) == Some("1") || self.name.starts_with("sr")
    }

    pub fn is_loop(&self) -> bool {
        self.name.starts_with("loop")
    }

    pub fn is_mtd(&self) -> bool {
        self.name.starts_with("mtd")
    }

    pub fn is_partition(&self) -> bool {
        self.prop(keys::DEVTYPE) == Some("partition")
    }

    pub fn is_disk(&self) -> bool {
        self.prop(keys::DEVTYPE) == Some("disk")
            && !self.is_dm()
            && !self.is_md()
            && !self.is_loop()
            && !self.is_cdrom()
            && !self.is_mtd()
    }

    pub fn is_biosraid_member(&self) -> bool {
        self.fmt_type()
            .map(|t| BIOSRAID_MEMBER_TYPES.contains(&t))
            .unwrap_or(false)
    }

    pub fn is_multipath_member(&self) -> bool {
        self.fmt_type() == Some("mpath_member")
            || self.prop(keys::DM_MULTIPATH_DEVICE_PATH) == Some("1")
    }
}
