use serde::{
    Deserialize,
    Serialize,
};

use crate::errors::BlkError;
use crate::linux;

/// What is written on a device. Owned exclusively by exactly one Device;
/// replacing a device's format discards the previous one.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Format {
    pub kind: FormatKind,
    pub uuid: Option<String>,
    pub label: Option<String>,
    pub mountpoint: Option<String>,

    /// Node path of the owning device, set when the format is attached.
    pub device: Option<String>,

    pub exists: bool,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub enum FormatKind {
    /// "No format": freshly zeroed disk, unreadable content, or simply
    /// nothing there. A routine state, not an error.
    #[default]
    None,

    DiskLabel {
        label_type: DiskLabelType,
        /// A disklabel found on a non-partitionable device is recorded
        /// but never processed further.
        unusable: bool,
    },

    Filesystem {
        fs_type: String,
    },

    Swap,

    LvmPv(PvFormatInfo),

    MdMember(MdMemberInfo),

    MultipathMember,

    DmRaidMember(DmRaidMemberInfo),

    Luks {
        /// Expected device-mapper name of the unlocked mapping.
        map_name: Option<String>,
    },

    Btrfs {
        vol_uuid: Option<String>,
    },

    BiosBoot,
    Efi,
    AppleBoot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskLabelType {
    Gpt,
    Msdos,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct PvFormatInfo {
    pub vg_name: Option<String>,
    pub vg_uuid: Option<String>,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct MdMemberInfo {
    pub array_uuid: Option<String>,
    pub level: Option<String>,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct DmRaidMemberInfo {
    pub set_name: Option<String>,
}

/// Parameters to the format factory. Type-specific extras that do not
/// apply to the requested type are ignored.
#[derive(Debug, Default, Clone)]
pub struct FormatArgs {
    pub uuid: Option<String>,
    pub label: Option<String>,
    pub device: Option<String>,
    pub mountpoint: Option<String>,
    pub exists: bool,

    pub map_name: Option<String>,
    pub vol_uuid: Option<String>,
    pub vg_name: Option<String>,
    pub vg_uuid: Option<String>,
    pub array_uuid: Option<String>,
    pub md_level: Option<String>,
    pub set_name: Option<String>,
}

/// Filesystem type strings the factory accepts as plain filesystems.
const FILESYSTEM_TYPES: [&str; 11] = [
    "ext2", "ext3", "ext4", "xfs", "f2fs", "vfat", "ntfs", "reiserfs",
    "iso9660", "udf", "squashfs",
];

impl Format {
    pub fn none() -> Self {
        Format::default()
    }

    /// Factory keyed by a blkid/udev format-type string. Fails when the
    /// requested type cannot be constructed; discovery callers fall back
    /// to [`Format::none`] because unreadable content is expected on
    /// real-world hardware.
    pub fn from_type(fmt_type: &str, args: FormatArgs) -> Result<Self, BlkError> {
        let kind = match fmt_type {
            "swap" => FormatKind::Swap,
            "LVM2_member" => FormatKind::LvmPv(PvFormatInfo {
                vg_name: args.vg_name.clone(),
                vg_uuid: args.vg_uuid.clone(),
            }),
            "linux_raid_member" => FormatKind::MdMember(MdMemberInfo {
                array_uuid: args.array_uuid.clone(),
                level: args.md_level.clone(),
            }),
            "mpath_member" => FormatKind::MultipathMember,
            "crypto_LUKS" => FormatKind::Luks {
                map_name: args.map_name.clone(),
            },
            "btrfs" => FormatKind::Btrfs {
                vol_uuid: args.vol_uuid.clone().or_else(|| args.uuid.clone()),
            },
            "bios_boot" => FormatKind::BiosBoot,
            "efi" => FormatKind::Efi,
            "appleboot" => FormatKind::AppleBoot,
            t if t.ends_with("_raid_member") => {
                FormatKind::DmRaidMember(DmRaidMemberInfo {
                    set_name: args.set_name.clone(),
                })
            }
            t if FILESYSTEM_TYPES.contains(&t) => FormatKind::Filesystem {
                fs_type: t.to_string(),
            },
            t => {
                return Err(BlkError::Format(format!(
                    "cannot construct format from type {t}"
                )));
            }
        };

        Ok(Format {
            kind,
            uuid: args.uuid,
            label: args.label,
            mountpoint: args.mountpoint,
            device: args.device,
            exists: args.exists,
        })
    }

    /// A disklabel read off a device, or planned for one.
    pub fn disklabel(label_type: DiskLabelType, unusable: bool, exists: bool) -> Self {
        Format {
            kind: FormatKind::DiskLabel {
                label_type,
                unusable,
            },
            exists,
            ..Default::default()
        }
    }

    /// Canonical type string, `None` for "no format".
    pub fn type_name(&self) -> Option<&str> {
        match &self.kind {
            FormatKind::None => None,
            FormatKind::DiskLabel { .. } => Some("disklabel"),
            FormatKind::Filesystem { fs_type } => Some(fs_type),
            FormatKind::Swap => Some("swap"),
            FormatKind::LvmPv(_) => Some("lvmpv"),
            FormatKind::MdMember(_) => Some("mdmember"),
            FormatKind::MultipathMember => Some("multipath_member"),
            FormatKind::DmRaidMember(_) => Some("dmraidmember"),
            FormatKind::Luks { .. } => Some("luks"),
            FormatKind::Btrfs { .. } => Some("btrfs"),
            FormatKind::BiosBoot => Some("biosboot"),
            FormatKind::Efi => Some("efi"),
            FormatKind::AppleBoot => Some("appleboot"),
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self.kind, FormatKind::None)
    }

    pub fn is_disklabel(&self) -> bool {
        matches!(self.kind, FormatKind::DiskLabel { .. })
    }

    pub fn is_luks(&self) -> bool {
        matches!(self.kind, FormatKind::Luks { .. })
    }

    fn device_path(&self) -> Result<&str, BlkError> {
        self.device.as_deref().ok_or_else(|| {
            BlkError::Format("format has no device path".to_string())
        })
    }

    /// Activate the format (swapon, open mapping). Requires the format
    /// to already exist on disk.
    pub fn setup(&self) -> Result<(), BlkError> {
        if !self.exists {
            return Err(BlkError::Format(format!(
                "setup of format {:?} that does not exist",
                self.type_name(),
            )));
        }

        match &self.kind {
            FormatKind::Swap => linux::mkfs::swap_on(self.device_path()?),
            // LUKS activation needs a passphrase and goes through the
            // LUKS reconciliation handler instead.
            _ => Ok(()),
        }
    }

    /// Deactivate the format. Requires the format to already exist.
    pub fn teardown(&self) -> Result<(), BlkError> {
        if !self.exists {
            return Err(BlkError::Format(format!(
                "teardown of format {:?} that does not exist",
                self.type_name(),
            )));
        }

        match &self.kind {
            FormatKind::Swap => linux::mkfs::swap_off(self.device_path()?),
            FormatKind::Luks { map_name: Some(name) } => linux::luks::close(name),
            _ => Ok(()),
        }
    }

    /// Write the format to disk. Forbidden on an already-existing format
    /// unless `force`, which tears the old one down first.
    pub fn create(&mut self, force: bool) -> Result<(), BlkError> {
        if self.exists {
            if !force {
                return Err(BlkError::Format(format!(
                    "create of format {:?} that already exists",
                    self.type_name(),
                )));
            }

            self.teardown()?;
            self.exists = false;
        }

        let device = self.device_path()?.to_string();

        match &self.kind {
            FormatKind::None => {}
            FormatKind::DiskLabel { label_type, .. } => {
                linux::sfdisk::create_table(&device, *label_type)?;
            }
            FormatKind::Filesystem { fs_type } => {
                linux::mkfs::create_fs(&device, fs_type, self.label.as_deref())?;
            }
            FormatKind::Swap => {
                linux::mkfs::make_swap(&device, self.label.as_deref())?;
            }
            FormatKind::LvmPv(_) => {
                linux::lvm::create_pv(&device)?;
            }
            FormatKind::Luks { .. } => {
                linux::luks::format(&device, None)?;
            }
            FormatKind::Btrfs { .. } => {
                linux::mkfs::create_fs(&device, "btrfs", self.label.as_deref())?;
            }
            FormatKind::Efi => {
                linux::mkfs::create_fs(&device, "vfat", self.label.as_deref())?;
            }
            // Marker partitions carry no payload to write.
            FormatKind::BiosBoot | FormatKind::AppleBoot => {}
            FormatKind::MdMember(_)
            | FormatKind::MultipathMember
            | FormatKind::DmRaidMember(_) => {
                // Written by the aggregate's own create path (mdadm,
                // multipath, dmraid), never directly.
            }
        }

        self.exists = true;

        Ok(())
    }

    /// Wipe the format off the device.
    pub fn destroy(&mut self) -> Result<(), BlkError> {
        if !self.exists {
            return Err(BlkError::Format(format!(
                "destroy of format {:?} that does not exist",
                self.type_name(),
            )));
        }

        linux::sfdisk::wipe(self.device_path()?)?;
        self.exists = false;

        Ok(())
    }
}
