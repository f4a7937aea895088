use serde::{
    Deserialize,
    Serialize,
};

use super::format::Format;

/// Process-unique, monotonic device identity. Parent links are ids into
/// the owning tree's arena; children are always computed by reverse scan,
/// never stored, so the graph carries no back-pointers.
pub type DeviceId = u64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,

    /// Mutable for partitions, whose numbering can shift when siblings
    /// are created or destroyed.
    pub name: String,

    pub uuid: Option<String>,
    pub sysfs_path: Option<String>,
    pub serial: Option<String>,
    pub major_minor: Option<(u32, u32)>,

    /// Bytes.
    pub size: u64,

    /// Real hardware state vs. planned-by-action.
    pub exists: bool,

    /// Never auto-removed (backs the running system, or listed in config).
    pub protected: bool,

    /// Whether this code may operate on the device at all.
    pub controllable: bool,

    pub parents: Vec<DeviceId>,

    pub format: Format,

    /// Snapshot of the format as discovered, diffed against during commit.
    pub original_format: Format,

    pub kind: DeviceKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DeviceKind {
    Disk(DiskInfo),
    Partition(PartitionInfo),
    MdArray(MdInfo),
    Multipath(MultipathInfo),
    DmRaidArray(DmRaidInfo),
    LvmVolumeGroup(VgInfo),
    LvmLogicalVolume(LvInfo),
    LvmThinPool(LvInfo),
    LvmThinLogicalVolume(ThinLvInfo),
    LuksMapping,
    BtrfsVolume(BtrfsVolInfo),
    BtrfsSubvolume(BtrfsSubvolInfo),
    Loop(LoopInfo),
    FileDevice(FileInfo),
    NoDevice,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskInfo {
    pub bus: Option<String>,
    pub removable: bool,
    pub read_only: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartType {
    Primary,
    Extended,
    Logical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionInfo {
    pub number: u32,
    pub part_type: PartType,
    pub disk: DeviceId,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct MdInfo {
    pub level: Option<String>,
    pub metadata_version: Option<String>,
    /// Member count the metadata claims; the array is incomplete while
    /// fewer parents than this are attached.
    pub member_count: Option<u32>,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultipathInfo {
    pub wwid: Option<String>,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct DmRaidInfo {
    pub raid_set: String,
}

/// Accumulated by PV reconciliation; consumed by LV materialization.
/// Lists stay index-aligned and deduplicated by LV name.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct VgInfo {
    pub pv_count: Option<u32>,
    pub pe_size: Option<u64>,
    pub lv_info: Vec<LvEntry>,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct LvEntry {
    pub name: String,
    pub uuid: Option<String>,
    pub size: u64,
    /// lvs attribute string, e.g. "-wi-ao----"; the first character
    /// drives materialization ordering and skipping.
    pub attr: String,
    pub seg_type: String,
    /// Snapshot origin LV, when this entry is a snapshot.
    pub origin: Option<String>,
    /// Owning thin pool, when this entry is a thin LV.
    pub pool: Option<String>,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct LvInfo {
    pub vg_name: String,
    pub lv_name: String,
    pub attr: String,
    pub seg_type: String,
    /// Mirror image/log components folded in by materialization.
    pub copies: u32,
    pub log_size: u64,
    pub metadata_size: u64,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThinLvInfo {
    pub vg_name: String,
    pub lv_name: String,
    pub pool_name: String,
    pub attr: String,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct BtrfsVolInfo {
    /// Set once the subvolume listing query ran for this volume.
    pub subvols_listed: bool,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct BtrfsSubvolInfo {
    pub vol_id: u64,
    pub parent_id: u64,
    pub subvol_path: String,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopInfo {
    pub backing_file: Option<String>,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileInfo {
    pub file_path: String,
}

impl Device {
    pub fn new(id: DeviceId, name: &str, kind: DeviceKind) -> Self {
        Device {
            id,
            name: name.to_string(),
            uuid: None,
            sysfs_path: None,
            serial: None,
            major_minor: None,
            size: 0,
            exists: false,
            protected: false,
            controllable: true,
            parents: Vec::new(),
            format: Format::none(),
            original_format: Format::none(),
            kind,
        }
    }

    /// Device node path. Btrfs volumes and subvolumes have no node of
    /// their own; the tree resolves those through their parents.
    pub fn path(&self) -> String {
        match &self.kind {
            DeviceKind::LvmLogicalVolume(lv) | DeviceKind::LvmThinPool(lv) => {
                format!("/dev/mapper/{}", lv_dm_name(&lv.vg_name, &lv.lv_name))
            }
            DeviceKind::LvmThinLogicalVolume(lv) => {
                format!("/dev/mapper/{}", lv_dm_name(&lv.vg_name, &lv.lv_name))
            }
            DeviceKind::LuksMapping
            | DeviceKind::Multipath(_)
            | DeviceKind::DmRaidArray(_) => {
                format!("/dev/mapper/{}", self.name)
            }
            DeviceKind::FileDevice(info) => info.file_path.clone(),
            _ => format!("/dev/{}", self.name),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match &self.kind {
            DeviceKind::Disk(_) => "disk",
            DeviceKind::Partition(_) => "partition",
            DeviceKind::MdArray(_) => "mdarray",
            DeviceKind::Multipath(_) => "multipath",
            DeviceKind::DmRaidArray(_) => "dmraidarray",
            DeviceKind::LvmVolumeGroup(_) => "lvmvg",
            DeviceKind::LvmLogicalVolume(_) => "lvmlv",
            DeviceKind::LvmThinPool(_) => "lvmthinpool",
            DeviceKind::LvmThinLogicalVolume(_) => "lvmthinlv",
            DeviceKind::LuksMapping => "luks/dm-crypt",
            DeviceKind::BtrfsVolume(_) => "btrfs volume",
            DeviceKind::BtrfsSubvolume(_) => "btrfs subvolume",
            DeviceKind::Loop(_) => "loop",
            DeviceKind::FileDevice(_) => "file",
            DeviceKind::NoDevice => "nodevice",
        }
    }

    pub fn is_nodevice(&self) -> bool {
        matches!(self.kind, DeviceKind::NoDevice)
    }

    pub fn is_disk(&self) -> bool {
        matches!(self.kind, DeviceKind::Disk(_))
    }

    pub fn is_partition(&self) -> bool {
        matches!(self.kind, DeviceKind::Partition(_))
    }

    /// Aggregates that may legitimately exist with missing members.
    pub fn can_be_incomplete(&self) -> bool {
        matches!(
            self.kind,
            DeviceKind::MdArray(_)
                | DeviceKind::DmRaidArray(_)
                | DeviceKind::LvmVolumeGroup(_)
        )
    }

    /// Whether the aggregate currently has all the members its metadata
    /// claims. Non-aggregates are always complete.
    pub fn is_complete(&self) -> bool {
        match &self.kind {
            DeviceKind::MdArray(info) => match info.member_count {
                Some(count) => self.parents.len() as u32 >= count,
                None => true,
            },
            DeviceKind::LvmVolumeGroup(info) => match info.pv_count {
                Some(count) => self.parents.len() as u32 >= count,
                None => true,
            },
            _ => true,
        }
    }
}

/// Device-mapper node name for an LV: literal dashes in either name are
/// doubled, then the two are joined with a single dash.
pub fn lv_dm_name(vg: &str, lv: &str) -> String {
    format!("{}-{}", vg.replace('-', "--"), lv.replace('-', "--"))
}

/// Name-lookup equivalence: a `--` in the requested name may match a
/// literal `-` in the stored name.
pub fn names_match(stored: &str, requested: &str) -> bool {
    stored == requested || stored == requested.replace("--", "-")
}
